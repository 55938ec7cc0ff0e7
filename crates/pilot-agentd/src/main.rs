//! `pilot`: one consume-execute-acknowledge run against a local in-memory queue pair.
//!
//! Tasks are seeded from a JSON-lines file (`--seed`) and results are written as JSON lines
//! (`--results`, stdout by default). Ctrl-C stops intake; in-flight tasks get `--shutdown-grace`.

mod cli;
mod harness;

use std::sync::Arc;

use clap::Parser;
use pilot_core::{MemoryBroker, Pilot};
use pilot_exec::ProcRunner;
use pilot_observe::{Journal, logger_init};
use pilot_prometheus::PrometheusProgress;
use tracing::{info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger_init(&cli.logger())?;

    let mut runner = ProcRunner::new(cli.exec_config(), cli.task_spec()?);
    if let Some(init) = cli.init_spec()? {
        runner = runner.with_init(init);
    }

    let broker = MemoryBroker::new();
    match &cli.seed {
        Some(seed) => {
            let n = harness::load_seed(&broker, &cli.queue_incoming, seed).await?;
            info!(target: "pilot.agentd", n, seed = %seed.display(), "queue seeded");
        }
        None => warn!(target: "pilot.agentd", "no --seed given; the pilot will idle until its timeout"),
    }

    let metrics = Arc::new(PrometheusProgress::new()?);
    let pilot = Pilot::new(cli.pilot_config(), Arc::new(runner))?
        .with_sink(Arc::new(Journal::new()))
        .with_sink(metrics.clone());

    let cancel = pilot.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(target: "pilot.agentd", "interrupt received; stopping intake");
            cancel.cancel();
        }
    });

    let res = pilot.run(&broker).await;

    harness::write_results(&broker.payloads(&cli.queue_outgoing), cli.results.as_deref()).await?;
    if let Some(path) = &cli.metrics_file {
        tokio::fs::write(path, metrics.encode_text()?).await?;
    }

    let summary = res?;
    info!(
        target: "pilot.agentd",
        received = summary.received,
        succeeded = summary.succeeded,
        "done"
    );
    Ok(())
}
