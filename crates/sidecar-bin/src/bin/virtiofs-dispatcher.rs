//! Joins the namespaces of a live sibling process, then exposes a bridge
//! socket in the caller's original filesystem view.
//!
//! With `--upstream-socket` every connection is forwarded to that socket,
//! optionally served by a resource daemon started inside the shared
//! directory. Without it the bridge only holds connections open.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sidecar_core::config::{ServeArgs, ServeConfig};
use sidecar_core::daemon::{
    DEFAULT_SOCKET_TIMEOUT, DEFAULT_STOP_TIMEOUT, DaemonSpec, ResourceDaemon, exited_with_failure,
};
use sidecar_core::namespace::{NamespaceJoiner, NamespaceKind, SetnsJoiner, TargetNamespace};
use sidecar_core::{
    BridgeServer, BridgeSocket, ConnectionHandler, Forward, HoldOpen, LifecycleMonitor, PathAnchor,
    Readiness, Result, SidecarError, cli, logging, readiness, socket,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "virtiofs-dispatcher", version)]
struct Args {
    /// Pid of a running process whose namespaces to join
    #[arg(long, value_parser = clap::value_parser!(i32).range(1..))]
    pid: i32,
    /// Resource root inside the target mount namespace
    #[arg(long)]
    shared_dir: PathBuf,
    /// Bridge socket path in the caller's mount namespace
    #[arg(long)]
    socket_path: PathBuf,
    /// Also join the target's PID namespace (affects the resource daemon)
    #[arg(long)]
    pid_namespace: bool,
    /// Forward every connection to this socket
    #[arg(long)]
    upstream_socket: Option<PathBuf>,
    /// Resource daemon that serves --upstream-socket
    #[arg(long, requires = "upstream_socket")]
    daemon: Option<PathBuf>,
    /// Argument passed to the resource daemon (repeatable)
    #[arg(long = "daemon-arg", allow_hyphen_values = true, requires = "daemon")]
    daemon_args: Vec<OsString>,
    /// Readiness marker, created once the bridge is accepting
    #[arg(long)]
    ready_file: Option<PathBuf>,
    #[command(flatten)]
    serve: ServeArgs,
}

fn main() -> ExitCode {
    let args = match cli::parse_args::<Args>() {
        Ok(args) => args,
        Err(code) => return code,
    };
    logging::init();

    match run(args) {
        Ok(code) => code,
        Err(e) => cli::fail(&e),
    }
}

/// Paths that must resolve in the caller's mount namespace.
struct Anchors {
    socket: PathAnchor,
    marker: Option<PathAnchor>,
}

/// Everything up to the namespace join runs on the main thread alone; the
/// runtime and its worker threads only exist afterwards.
fn run(args: Args) -> Result<ExitCode> {
    let serve = args.serve.validate()?;

    let mut kinds = vec![NamespaceKind::Mount];
    if args.pid_namespace {
        kinds.push(NamespaceKind::Pid);
    }
    let target = TargetNamespace::new(args.pid, kinds);
    // A vanished target is reported before any path is looked at.
    let prepared = SetnsJoiner.prepare(&target)?;

    let anchors = Anchors {
        socket: socket::capture_anchor(&args.socket_path)?,
        marker: args
            .ready_file
            .as_deref()
            .map(readiness::capture_anchor)
            .transpose()?,
    };

    let entered = prepared.enter()?;
    info!(pid = args.pid, entered = ?entered, "namespace entry complete");

    // clone(CLONE_THREAD) fails with EINVAL once our PID namespace for
    // children differs from our own.
    let mut builder = if entered.contains(&NamespaceKind::Pid) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        tokio::runtime::Builder::new_multi_thread()
    };
    let runtime = builder.enable_all().build()?;
    runtime.block_on(serve_bridge(args, serve, anchors, &entered))
}

async fn serve_bridge(
    args: Args,
    serve: ServeConfig,
    anchors: Anchors,
    entered: &[NamespaceKind],
) -> Result<ExitCode> {
    let monitor = LifecycleMonitor::install()?;

    std::fs::create_dir_all(&args.shared_dir).map_err(|source| SidecarError::CreateDir {
        path: args.shared_dir.clone(),
        source,
    })?;
    // Absolute before binding, which may change the working directory.
    let shared_dir =
        std::fs::canonicalize(&args.shared_dir).map_err(|source| SidecarError::CreateDir {
            path: args.shared_dir.clone(),
            source,
        })?;

    let socket = if entered.contains(&NamespaceKind::Mount) {
        BridgeSocket::bind_anchored(anchors.socket, serve.backlog)?
    } else {
        drop(anchors.socket);
        BridgeSocket::bind(&args.socket_path, serve.backlog)?
    };
    let readiness = match anchors.marker {
        Some(anchor) => Readiness::anchored(anchor),
        None => Readiness::new(None),
    };

    let mut daemon = match (&args.daemon, &args.upstream_socket) {
        (Some(program), Some(upstream)) => {
            let mut daemon = ResourceDaemon::spawn(&DaemonSpec {
                program: program.clone(),
                args: args.daemon_args.clone(),
                working_dir: shared_dir.clone(),
            })?;
            daemon
                .wait_for_socket(upstream, DEFAULT_SOCKET_TIMEOUT)
                .await?;
            Some(daemon)
        }
        _ => None,
    };

    let handler: Arc<dyn ConnectionHandler> = match &args.upstream_socket {
        Some(upstream) => Arc::new(Forward::new(upstream)),
        None => Arc::new(HoldOpen),
    };
    info!(
        shared_dir = %shared_dir.display(),
        upstream = ?args.upstream_socket,
        "bridge configured"
    );

    let served = BridgeServer::new(socket, handler, monitor.shutdown())
        .with_readiness(Arc::new(readiness))
        .with_drain_timeout(serve.drain_timeout)
        .serve()
        .await;

    let daemon_failed = match daemon.as_mut() {
        Some(daemon) => daemon
            .stop(DEFAULT_STOP_TIMEOUT)
            .await
            .map(exited_with_failure),
        None => Ok(false),
    };

    served?;
    if daemon_failed? {
        error!("resource daemon exited with failure");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
