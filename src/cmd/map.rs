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

    /// This map task's id (also its subgraph partition id)
    #[clap(short, long)]
    pub task: u32,
}
