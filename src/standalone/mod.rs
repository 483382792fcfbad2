use clap::{Parser, Subcommand};

pub mod engine;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a priority-iteration job fully inside this process
    Run {
        /// Blob store location: a local directory, or s3://bucket
        #[arg(long, default_value = ".")]
        store: String,

        /// Input directory on the store (holds graph.txt or subgraph/)
        #[arg(short, long)]
        input: String,

        /// Name of the algorithm
        #[arg(short, long)]
        workload: String,

        /// Output directory on the store
        #[arg(short, long)]
        output: String,

        /// Partition count for both sides
        #[arg(short, long, default_value_t = 2)]
        partitions: u32,

        /// Snapshot row count
        #[arg(short = 'k', long, default_value_t = 100)]
        topk: usize,

        /// Activation fraction; selects the portion regime
        #[arg(long)]
        portion: Option<f32>,

        /// Fixed execution-queue length, used when no portion is given
        #[arg(long)]
        queue_len: Option<usize>,

        /// Convergence threshold on consecutive snapshots
        #[arg(long)]
        stop_difference: Option<f64>,

        /// Hard wall-clock cap in milliseconds
        #[arg(long)]
        stop_max_time: Option<u64>,

        /// Milliseconds between snapshots
        #[arg(long, default_value_t = 1000)]
        snapshot_interval: u64,

        /// Extra dotted options, `key=value`
        #[arg(short = 'D', long = "define")]
        defines: Vec<String>,
    },
}
