// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! End-to-end collectives: every rank runs on its own thread over loopback,
//! with a distinct bootstrap port range per test so the tests can run in
//! parallel.

use std::thread;
use std::time::Duration;

use pg_ring::{pattern, ConnectConfig, Element, PgError, PgHandle, ReduceOp};

fn config(base_port: u16) -> ConnectConfig {
    ConnectConfig {
        base_port,
        timeout: Duration::from_secs(30),
    }
}

fn world(n: usize) -> Vec<String> {
    vec!["127.0.0.1".to_string(); n]
}

/// Run one all-reduce across `inputs.len()` ranks and collect every rank's
/// resulting send region.
fn run_all_reduce<T: Element>(
    base_port: u16,
    op: ReduceOp,
    count: usize,
    inputs: Vec<Vec<T>>,
) -> Vec<Vec<T>> {
    let n = inputs.len();
    let hosts = world(n);

    thread::scope(|scope| {
        let handles: Vec<_> = inputs
            .into_iter()
            .enumerate()
            .map(|(rank, input)| {
                let hosts = hosts.clone();
                scope.spawn(move || {
                    let mut pg = PgHandle::connect(&hosts, rank, config(base_port)).unwrap();
                    pg.register(T::KIND, count).unwrap();
                    pg.send_slice_mut::<T>().unwrap().copy_from_slice(&input);
                    pg.all_reduce(T::KIND, op, count).unwrap();
                    let out = pg.send_slice::<T>().unwrap().to_vec();
                    pg.close().unwrap();
                    out
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn sum_of_two_int32_ranks() {
    let outputs = run_all_reduce::<i32>(
        47010,
        ReduceOp::Sum,
        8,
        vec![vec![1; 8], vec![2; 8]],
    );

    for out in &outputs {
        assert_eq!(out, &vec![3; 8]);
    }
    // Agreement: byte-identical integer results on every rank.
    assert_eq!(outputs[0], outputs[1]);
}

#[test]
fn sum_of_four_ranks_reads_as_ones() {
    let inputs = (0..4).map(|k| vec![10i32.pow(k); 16]).collect();
    let outputs = run_all_reduce::<i32>(47040, ReduceOp::Sum, 16, inputs);

    for out in &outputs {
        assert_eq!(out, &vec![1111; 16]);
    }
    for out in &outputs[1..] {
        assert_eq!(out, &outputs[0]);
    }
}

#[test]
fn mean_of_four_float32_ranks() {
    let inputs = (0..4).map(|k| vec![10f32.powi(k); 16]).collect();
    let outputs = run_all_reduce::<f32>(47070, ReduceOp::Mean, 16, inputs);

    // 1 + 10 + 100 + 1000 = 1111, divided by 4 exactly once.
    for out in &outputs {
        assert_eq!(out, &vec![277.75; 16]);
    }
}

#[test]
fn product_of_three_int32_ranks() {
    let outputs = run_all_reduce::<i32>(
        47100,
        ReduceOp::Prod,
        9,
        vec![vec![2; 9], vec![3; 9], vec![5; 9]],
    );

    for out in &outputs {
        assert_eq!(out, &vec![30; 9]);
    }
}

#[test]
fn max_of_four_float32_ranks() {
    let inputs = (0..4).map(|k| vec![k as f32; 8]).collect();
    let outputs = run_all_reduce::<f32>(47160, ReduceOp::Max, 8, inputs);

    for out in &outputs {
        assert_eq!(out, &vec![3.0; 8]);
    }
}

#[test]
fn count_not_divisible_by_world_size_fails() {
    let hosts = world(4);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let hosts = hosts.clone();
                scope.spawn(move || {
                    let mut pg = PgHandle::connect(&hosts, rank, config(47130)).unwrap();
                    pg.register(pg_ring::ElementType::Int32, 21).unwrap();
                    let res = pg.all_reduce(pg_ring::ElementType::Int32, ReduceOp::Sum, 21);
                    pg.close().unwrap();
                    res
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for res in results {
        assert!(matches!(
            res.unwrap_err(),
            PgError::BadCount {
                count: 21,
                world_size: 4
            }
        ));
    }
}

#[test]
fn reduce_scatter_leaves_owned_chunk_reduced() {
    let hosts = world(3);
    let count = 6;
    let chunk = count / 3;

    thread::scope(|scope| {
        for rank in 0..3 {
            let hosts = hosts.clone();
            scope.spawn(move || {
                let mut pg = PgHandle::connect(&hosts, rank, config(47190)).unwrap();
                pg.register(pg_ring::ElementType::Int32, count).unwrap();
                pg.send_slice_mut::<i32>()
                    .unwrap()
                    .fill(rank as i32 + 1);

                pg.reduce_scatter(pg_ring::ElementType::Int32, ReduceOp::Sum, count)
                    .unwrap();

                // Chunk (rank + 1) mod 3 is fully reduced: 1 + 2 + 3.
                let owned = (rank + 1) % 3;
                let data = pg.send_slice::<i32>().unwrap();
                assert_eq!(&data[owned * chunk..(owned + 1) * chunk], &[6, 6]);

                pg.close().unwrap();
            });
        }
    });
}

#[test]
fn close_is_idempotent() {
    let hosts = world(2);

    thread::scope(|scope| {
        for rank in 0..2 {
            let hosts = hosts.clone();
            scope.spawn(move || {
                let mut pg = PgHandle::connect(&hosts, rank, config(47220)).unwrap();
                pg.register(pg_ring::ElementType::Int32, 4).unwrap();
                pg.send_slice_mut::<i32>().unwrap().fill(1);
                pg.all_reduce(pg_ring::ElementType::Int32, ReduceOp::Sum, 4)
                    .unwrap();

                pg.close().unwrap();
                // Second close is a no-op that succeeds.
                pg.close().unwrap();
            });
        }
    });
}

#[test]
fn bootstrap_survives_launch_skew() {
    let hosts = world(4);

    let outputs: Vec<Vec<i32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let hosts = hosts.clone();
                scope.spawn(move || {
                    // Stagger the launches well past a connect round trip.
                    thread::sleep(Duration::from_millis(150 * rank as u64));

                    let mut pg = PgHandle::connect(&hosts, rank, config(47250)).unwrap();
                    pg.register(pg_ring::ElementType::Int32, 8).unwrap();
                    pg.send_slice_mut::<i32>().unwrap().fill(1);
                    pg.all_reduce(pg_ring::ElementType::Int32, ReduceOp::Sum, 8)
                        .unwrap();
                    let out = pg.send_slice::<i32>().unwrap().to_vec();
                    pg.close().unwrap();
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for out in outputs {
        assert_eq!(out, vec![4; 8]);
    }
}

#[test]
fn close_releases_every_transport_resource() {
    let hosts = world(2);

    thread::scope(|scope| {
        for rank in 0..2 {
            let hosts = hosts.clone();
            scope.spawn(move || {
                let mut pg = PgHandle::connect(&hosts, rank, config(47280)).unwrap();
                pg.register(pg_ring::ElementType::Int32, 4).unwrap();
                pg.send_slice_mut::<i32>().unwrap().fill(2);
                pg.all_reduce(pg_ring::ElementType::Int32, ReduceOp::Sum, 4)
                    .unwrap();

                let stats = pg.transport_stats().unwrap();
                assert!(!stats.snapshot().all_released());

                pg.close().unwrap();
                assert!(stats.snapshot().all_released());
            });
        }
    });
}

#[test]
fn default_pattern_matches_reference() {
    let hosts = world(4);
    let count = 16;

    let outputs: Vec<Vec<f32>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let hosts = hosts.clone();
                scope.spawn(move || {
                    let mut pg = PgHandle::connect(&hosts, rank, config(47310)).unwrap();
                    pg.register(pg_ring::ElementType::Float32, count).unwrap();
                    pattern::fill(rank, pg.send_slice_mut::<f32>().unwrap());
                    pg.all_reduce(pg_ring::ElementType::Float32, ReduceOp::Sum, count)
                        .unwrap();
                    let out = pg.send_slice::<f32>().unwrap().to_vec();
                    pg.close().unwrap();
                    out
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected = pattern::reference::<f32>(4, ReduceOp::Sum);
    for out in &outputs {
        assert_eq!(pattern::mismatches(out, expected), 0);
    }
}
