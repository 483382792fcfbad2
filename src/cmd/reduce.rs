use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Blob store location: a local directory, or s3://bucket
    #[clap(short, long, default_value = ".")]
    pub store: String,

    /// Key of the serialized job configuration on the store
    #[clap(short, long)]
    pub job: String,

    /// This reduce task's id (also its key partition id)
    #[clap(short, long)]
    pub task: u32,

    /// Restart from this snapshot id instead of a cold start
    #[clap(long)]
    pub rollback_snapshot: Option<u64>,

    /// Cursor checkpoint matching the rollback snapshot
    #[clap(long)]
    pub rollback_cursor: Option<i64>,
}
