// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Launcher: joins the ring, runs one all-reduce over the default data
//! pattern, verifies the result, and exits 0 on success or 1 on any
//! failure.

use std::process;

use clap::{Parser, ValueEnum};
use log::info;

use pg_ring::{pattern, ConnectConfig, Element, PgHandle, ReduceOp};

#[derive(Parser)]
#[command(
    name = "allreduce",
    about = "Ring all-reduce over the emulated verbs fabric"
)]
struct Cli {
    /// This process's rank in the ring (`LOCAL_RANK` in the environment
    /// overrides it for multi-process-per-host launches).
    #[arg(long)]
    myindex: Option<usize>,

    /// Ordered list of participating hosts.
    #[arg(long, num_args = 1..)]
    list: Vec<String>,

    /// Elements per rank; must be a multiple of the world size.
    #[arg(long, default_value_t = 1024)]
    count: usize,

    #[arg(long, value_enum, default_value = "float32")]
    dtype: Dtype,

    #[arg(long, value_enum, default_value = "sum")]
    op: Op,

    /// Base TCP port for the bootstrap exchange; rank r listens on
    /// base + r.
    #[arg(long, default_value_t = 18515)]
    port: u16,

    /// Legacy form: the rank as the first positional argument...
    #[arg(value_name = "RANK")]
    rank_pos: Option<usize>,

    /// ...followed by the whole host list as one space-separated string.
    #[arg(value_name = "HOSTS")]
    hosts_pos: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Dtype {
    Int32,
    Float32,
    Float64,
}

#[derive(Clone, Copy, ValueEnum)]
enum Op {
    Sum,
    Min,
    Max,
    Prod,
    Mean,
}

impl Op {
    fn reduce_op(self) -> ReduceOp {
        match self {
            Op::Sum => ReduceOp::Sum,
            Op::Min => ReduceOp::Min,
            Op::Max => ReduceOp::Max,
            Op::Prod => ReduceOp::Prod,
            Op::Mean => ReduceOp::Mean,
        }
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("allreduce: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let hosts: Vec<String> = if !cli.list.is_empty() {
        cli.list.clone()
    } else if let Some(joined) = &cli.hosts_pos {
        joined.split_whitespace().map(str::to_string).collect()
    } else {
        return Err("no host list: pass --list or the legacy positional form".into());
    };

    let rank = match local_rank_override()? {
        Some(rank) => rank,
        None => cli
            .myindex
            .or(cli.rank_pos)
            .ok_or("no rank: pass --myindex or the legacy positional form")?,
    };

    let op = cli.op.reduce_op();
    match cli.dtype {
        Dtype::Int32 => run_typed::<i32>(&hosts, rank, cli.count, op, cli.port),
        Dtype::Float32 => run_typed::<f32>(&hosts, rank, cli.count, op, cli.port),
        Dtype::Float64 => run_typed::<f64>(&hosts, rank, cli.count, op, cli.port),
    }
}

fn local_rank_override() -> Result<Option<usize>, Box<dyn std::error::Error>> {
    match std::env::var("LOCAL_RANK") {
        Ok(value) => Ok(Some(
            value
                .parse()
                .map_err(|_| format!("LOCAL_RANK is not a rank: {value:?}"))?,
        )),
        Err(_) => Ok(None),
    }
}

fn run_typed<T: Element>(
    hosts: &[String],
    rank: usize,
    count: usize,
    op: ReduceOp,
    base_port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "starting rank {rank} of {}, {count} elements, {op:?}",
        hosts.len()
    );

    let config = ConnectConfig {
        base_port,
        ..ConnectConfig::default()
    };
    let mut pg = PgHandle::connect(hosts, rank, config)?;
    pg.register(T::KIND, count)?;

    pattern::fill(rank, pg.send_slice_mut::<T>()?);
    pg.all_reduce(T::KIND, op, count)?;

    let expected = pattern::reference::<T>(hosts.len(), op);
    let bad_cells = pattern::mismatches(pg.send_slice::<T>()?, expected);

    pg.close()?;

    if bad_cells != 0 {
        println!("{bad_cells} out of {count} cells don't have the same value as reference");
        return Err("verification failed".into());
    }

    println!("Success! All cells have the value of the reference!");
    Ok(())
}
