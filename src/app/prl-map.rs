use std::sync::Arc;

use clap::Parser;
use prlite::cmd::map::Args;
use prlite::task::{ChannelUmbilical, DriverEvent, MapTask, Umbilical};
use prlite::{blob, JobConf};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let store = blob::open_store(&args.store).await?;
    let raw = store.get(&args.job).await?;
    let conf: JobConf = serde_json::from_slice(&raw)?;
    println!("map task {} joining job {}", args.task, conf.job_name);

    // Without a cluster parent the umbilical events are just logged.
    let (umbilical, mut events) = ChannelUmbilical::new();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let DriverEvent::TaskDone(id) = event {
                println!("task {id} done");
            }
        }
    });

    let umbilical: Arc<dyn Umbilical> = Arc::new(umbilical);
    MapTask::open(conf, args.task, store, umbilical)
        .await?
        .run()
        .await?;
    Ok(())
}
