//! `rdma-flow` binary: one client or server run per invocation.

use anyhow::Context;
use clap::Parser;
use rdma_flow::{
    cli::{Cli, Command},
    orchestrator::{run_client, run_server, ServerSummary},
    IbVerbs,
};
use std::{io, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let verbs = Arc::new(IbVerbs::new());
    match cli.command {
        Command::Client(args) => {
            let opts = args.into_options().context("invalid client options")?;
            let flows = run_client(&verbs, &opts, io::stdin().lock()).context("client failed")?;
            info!("client done, {} flow(s) sent", flows.len());
        }
        Command::Server(args) => {
            let opts = args.into_options().context("invalid server options")?;
            match run_server(&verbs, &opts).context("server failed")? {
                ServerSummary::Sweep(ports) => {
                    let failed = ports.iter().filter(|(_, ret)| ret.is_err()).count();
                    info!("sweep done, {} of {} port(s) failed", failed, ports.len());
                }
                ServerSummary::MultiQp(workers) => {
                    let failed = workers.iter().filter(|(_, ret)| ret.is_err()).count();
                    if failed > 0 {
                        warn!("{} of {} worker(s) failed", failed, workers.len());
                    }
                }
            }
        }
    }
    Ok(())
}
