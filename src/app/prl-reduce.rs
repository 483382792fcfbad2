use std::sync::Arc;

use clap::Parser;
use prlite::cmd::reduce::Args;
use prlite::task::{ChannelUmbilical, CheckPoint, DriverEvent, ReduceTask, Umbilical};
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
    println!("reduce task {} joining job {}", args.task, conf.job_name);

    let (umbilical, mut events) = ChannelUmbilical::new();
    if let (Some(snapshot), Some(iteration)) = (args.rollback_snapshot, args.rollback_cursor) {
        umbilical.schedule_rollback(args.task, CheckPoint { iteration, snapshot });
    }
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::IterationDone(event) => {
                    println!(
                        "iteration {} committed (snapshot {})",
                        event.iteration, event.snapshot_checkpoint
                    );
                }
                DriverEvent::TaskDone(id) => println!("task {id} done"),
                _ => {}
            }
        }
    });

    let umbilical: Arc<dyn Umbilical> = Arc::new(umbilical);
    ReduceTask::open(conf, args.task, store, umbilical)
        .await?
        .run()
        .await?;
    Ok(())
}
