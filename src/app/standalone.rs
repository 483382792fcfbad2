use clap::Parser;
use prlite::standalone::engine::{distribute_subgraph, latest_snapshot, IterativeJob};
use prlite::standalone::{Args, Commands};
use prlite::{blob, cmd, JobConf};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let Commands::Run {
        store,
        input,
        workload,
        output,
        partitions,
        topk,
        portion,
        queue_len,
        stop_difference,
        stop_max_time,
        snapshot_interval,
        defines,
    } = args.command;

    let mut conf = JobConf::new(format!("{workload}-{}", cmd::epoch_millis()));
    conf.priter_job = true;
    conf.workload = workload.clone();
    conf.input_dir = input.clone();
    conf.output_dir = output.clone();
    conf.partitions = partitions;
    conf.snapshot_topk = topk;
    conf.snapshot_interval_ms = snapshot_interval;
    conf.queue_portion = portion;
    conf.exec_queue_len = queue_len;
    conf.stop_difference = stop_difference;
    conf.stop_max_time_ms = stop_max_time;
    for define in &defines {
        let (key, value) = define
            .split_once('=')
            .ok_or_else(|| format!("bad -D option {define:?}, want key=value"))?;
        conf.set(key, value)?;
    }

    let store = blob::open_store(&store).await?;

    // A raw adjacency list is partitioned on the fly; a pre-partitioned
    // subgraph/ directory is used as-is.
    if store.exists(&format!("{input}/graph.txt")).await? {
        distribute_subgraph(&store, &input, partitions).await?;
        println!("partitioned {input}/graph.txt into {partitions} subgraphs");
    }

    let outcome = IterativeJob::init(conf, store.clone())?.submit().wait().await?;
    for failure in &outcome.failures {
        eprintln!("task failed: {failure}");
    }
    println!(
        "job finished: {} iteration commits, {} snapshots",
        outcome.iterations.len(),
        outcome.snapshots.len()
    );

    let mut rows: Vec<_> = latest_snapshot(&store, &output, partitions, &workload)
        .await?
        .into_iter()
        .collect();
    rows.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    println!("top results:");
    for (key, rank) in rows.iter().take(20) {
        println!("{key}\t{rank}");
    }

    if outcome.succeeded() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
