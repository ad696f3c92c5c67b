//! Container-disk sidecar: keeps `<copy-path>.sock` open for as long as the
//! disk image container should stay alive, and answers health probes.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sidecar_core::config::ServeArgs;
use sidecar_core::readiness::probe;
use sidecar_core::{
    BridgeServer, BridgeSocket, HoldOpen, LifecycleMonitor, Readiness, Result, SidecarError, cli,
    logging,
};
use tracing::info;

const DEFAULT_HEALTHY_PATH: &str = "/healthy";

#[derive(Parser, Debug)]
#[command(name = "container-disk", version)]
struct Args {
    /// Path the disk is exposed under; the socket is `<copy-path>.sock`
    #[arg(long, conflicts_with = "health_check")]
    copy_path: Option<PathBuf>,
    /// Exit 0 if the readiness marker exists, 1 otherwise
    #[arg(long)]
    health_check: bool,
    /// Exit 0 immediately
    #[arg(long)]
    no_op: bool,
    #[arg(long, hide = true, default_value = DEFAULT_HEALTHY_PATH)]
    healthy_path: PathBuf,
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
    if args.no_op {
        return Ok(ExitCode::SUCCESS);
    }
    if args.health_check {
        return Ok(if probe(&args.healthy_path) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }
    let Some(copy_path) = args.copy_path else {
        return Err(SidecarError::Config(
            "one of --copy-path or --health-check is required".to_string(),
        ));
    };
    let serve = args.serve.validate()?;

    if let Some(parent) = copy_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| SidecarError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let socket_path = socket_path_for(&copy_path);
    info!(copy_path = %copy_path.display(), socket = %socket_path.display(), "serving container disk");

    let monitor = LifecycleMonitor::install()?;
    let socket = BridgeSocket::bind(&socket_path, serve.backlog)?;
    BridgeServer::new(socket, Arc::new(HoldOpen), monitor.shutdown())
        .with_readiness(Arc::new(Readiness::new(Some(args.healthy_path))))
        .with_drain_timeout(serve.drain_timeout)
        .serve()
        .await?;
    Ok(ExitCode::SUCCESS)
}

/// `<copy-path>.sock`, appended rather than substituted for any extension.
fn socket_path_for(copy_path: &Path) -> PathBuf {
    let mut name = OsString::from(copy_path.as_os_str());
    name.push(".sock");
    PathBuf::from(name)
}
