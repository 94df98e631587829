//! Process lifecycle: startup, serving, and orderly shutdown.
//!
//! Startup opens everything in dependency order and fails fast on anything
//! the process cannot run without (configuration, schemas, queues). Shutdown
//! runs the reverse: stop accepting requests, let acknowledged webhooks
//! finish enqueueing, let drain workers finish their in-flight batch, fsync
//! and close the queues, release adapter connections.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use sluice_core::Config;
use sluice_ingest::system::CONNECT_TIMEOUT;
use sluice_ingest::{
    BuildContext, Drainers, Ingestor, QueueOptions, SchemaRegistry, Systems, consumers_by_object,
    plan_assignments,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::routes::router;
use crate::serve::{ConnectionLimits, serve};
use crate::state::AppState;

/// How long in-flight requests get after a shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Everything the supervisor needs from the command line.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub config_path: PathBuf,
    pub schemas_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub queue_options: QueueOptions,
    pub ack_after_write: bool,
    pub shutdown_grace: Duration,
}

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Clean,
    Failed,
    GraceExceeded,
}

impl Exit {
    pub fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Failed => 1,
            Self::GraceExceeded => 2,
        }
    }
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit.code())
    }
}

/// A started service.
pub struct Running {
    state: AppState,
    drainers: Drainers,
    server: JoinHandle<std::io::Result<()>>,
    stop_accepting: CancellationToken,
    local_addr: SocketAddr,
    grace: Duration,
}

/// Bring the service up.
pub async fn start(settings: &Settings) -> Result<Running> {
    let config = Config::load(&settings.config_path)
        .with_context(|| format!("loading {}", settings.config_path.display()))?;

    let schemas = SchemaRegistry::load_dir(&settings.schemas_dir).context("loading schemas")?;
    let assignments = plan_assignments(schemas.keys(), config.sinks()).context("assigning queues to sinks")?;
    let queues = schemas
        .open_queues_with(
            &settings.queue_dir,
            settings.queue_options,
            &consumers_by_object(&assignments),
        )
        .context("opening queues")?;
    info!(
        schemas = schemas.len(),
        queue_dir = %settings.queue_dir.display(),
        "schemas and queues open"
    );

    let ctx = BuildContext {
        listen_port: settings.port,
    };
    let systems = Systems::open(&config, &ctx, CONNECT_TIMEOUT)
        .await
        .context("opening systems")?;

    let ingestor = Ingestor::new(schemas, queues);
    let state = AppState::new(ingestor.clone(), systems.clone()).with_ack_after_write(settings.ack_after_write);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], settings.port)))
        .await
        .with_context(|| format!("binding port {}", settings.port))?;
    let local_addr = listener.local_addr()?;

    let stop_accepting = CancellationToken::new();
    let app = router(state.clone());
    let token = stop_accepting.clone();
    let server = tokio::spawn(serve(listener, app, ConnectionLimits::default(), token));
    for name in systems.source_names() {
        info!(route = %format!("/{name}"), "webhook route registered");
    }
    info!(addr = %local_addr, "server listening");

    let drainers = Drainers::spawn(&assignments, ingestor.queues(), systems.sinks(), CancellationToken::new());
    info!(workers = drainers.len(), "drain workers started");

    Ok(Running {
        state,
        drainers,
        server,
        stop_accepting,
        local_addr,
        grace: settings.shutdown_grace,
    })
}

impl Running {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop everything in reverse order of startup.
    pub async fn shutdown(self) -> Exit {
        let mut exit = Exit::Clean;
        let deadline = Instant::now() + self.grace;

        self.stop_accepting.cancel();
        let mut server = self.server;
        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(Ok(Ok(()))) => info!("server stopped"),
            Ok(Ok(Err(e))) => {
                error!(error = %e, "server failed");
                exit = Exit::Failed;
            }
            Ok(Err(e)) => {
                error!(error = %e, "server task panicked");
                exit = Exit::Failed;
            }
            Err(_) => {
                warn!(grace = ?self.grace, "in-flight requests outlived the shutdown grace");
                server.abort();
                exit = Exit::GraceExceeded;
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if self.state.wait_for_handlers(remaining).await {
            info!("webhook handlers finished");
        } else {
            warn!(
                in_flight = self.state.handlers_in_flight(),
                grace = ?self.grace,
                "webhook handlers outlived the shutdown grace"
            );
            exit = Exit::GraceExceeded;
        }

        let systems = self.state.systems();
        systems.begin_draining();
        if !self.drainers.stop().await && exit == Exit::Clean {
            exit = Exit::Failed;
        }

        if let Err(e) = self.state.ingestor().queues().close_all() {
            error!(error = %e, "failed to close queues");
            if exit == Exit::Clean {
                exit = Exit::Failed;
            }
        }

        systems.close_all().await;
        info!(exit_code = exit.code(), "shutdown complete");
        exit
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, stopping gracefully");
}

/// Start, serve until a signal arrives, then shut down.
pub async fn run(settings: Settings) -> Exit {
    let running = match start(&settings).await {
        Ok(running) => running,
        Err(e) => {
            error!("startup failed: {e:#}");
            return Exit::Failed;
        }
    };

    shutdown_signal().await;
    running.shutdown().await
}
