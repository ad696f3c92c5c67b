//! Holds a bridge socket open on behalf of a virtiofs share until the
//! sibling container goes away.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sidecar_core::config::ServeArgs;
use sidecar_core::readiness::probe;
use sidecar_core::{
    BridgeServer, BridgeSocket, HoldOpen, LifecycleMonitor, Readiness, Result, SidecarError, cli,
    logging,
};

#[derive(Parser, Debug)]
#[command(name = "virtiofs-placeholder", version)]
struct Args {
    /// Bridge socket path
    #[arg(long, required_unless_present = "health_check")]
    socket: Option<PathBuf>,
    /// Readiness marker, created once the socket is accepting
    #[arg(long)]
    ready_file: Option<PathBuf>,
    /// Exit 0 if --ready-file exists, 1 otherwise; never serves
    #[arg(long, requires = "ready_file", conflicts_with = "socket")]
    health_check: bool,
    #[command(flatten)]
    serve: ServeArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args::<Args>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    logging::init();

    match run(args).await {
        Ok(code) => code,
        Err(e) => cli::fail(&e),
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    if args.health_check {
        let ready = args.ready_file.as_deref().is_some_and(probe);
        return Ok(if ready {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let serve = args.serve.validate()?;
    let Some(path) = args.socket else {
        return Err(SidecarError::Config("--socket is required".to_string()));
    };

    let monitor = LifecycleMonitor::install()?;
    let socket = BridgeSocket::bind(&path, serve.backlog)?;
    BridgeServer::new(socket, Arc::new(HoldOpen), monitor.shutdown())
        .with_readiness(Arc::new(Readiness::new(args.ready_file)))
        .with_drain_timeout(serve.drain_timeout)
        .serve()
        .await?;
    Ok(ExitCode::SUCCESS)
}
