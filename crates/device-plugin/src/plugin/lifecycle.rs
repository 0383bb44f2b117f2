//! Startup and shutdown sequencing of the device plugin server.
//!
//! The kubelet only routes calls to a socket that exists and answers, so the
//! server is verified reachable before it is registered, and torn down again
//! if registration fails.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::device_plugin_server::DevicePluginServer;
use crate::config::PluginConfig;
use crate::device::DeviceRegistry;
use crate::error::DevicePluginError;
use crate::plugin::registration;
use crate::plugin::service::DevicePluginService;
use crate::plugin::uds;

/// How long a stopping server may take to drain before it is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Externally visible lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Phase {
    Idle,
    ServerStarting,
    ServerVerified,
    Registering,
    Running,
    Failed,
    Stopped,
}

/// A spawned gRPC server and the means to stop it.
///
/// Dropping it without `stop` still cancels the server, which then drains in
/// the background.
struct RunningServer {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
    watchers: Arc<AtomicUsize>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl RunningServer {
    async fn stop(mut self) {
        self.shutdown.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(Ok(Ok(()))) => info!("device plugin server stopped"),
            Ok(Ok(Err(e))) => warn!("device plugin server exited with error: {e}"),
            Ok(Err(e)) => warn!("device plugin server task failed: {e}"),
            Err(_) => {
                warn!("device plugin server did not stop within {SHUTDOWN_GRACE:?}, aborting");
                self.task.abort();
            }
        }
    }
}

/// Lifecycle state. The steps in progress (`ServerStarting`, `Registering`)
/// only exist inside a `&mut self` call, which holds the server meanwhile.
enum State {
    Idle,
    ServerStarting,
    ServerVerified(RunningServer),
    Registering,
    Running(RunningServer),
    Failed,
    Stopped,
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::ServerStarting => Phase::ServerStarting,
            State::ServerVerified(_) => Phase::ServerVerified,
            State::Registering => Phase::Registering,
            State::Running(_) => Phase::Running,
            State::Failed => Phase::Failed,
            State::Stopped => Phase::Stopped,
        }
    }

    fn into_server(self) -> Option<RunningServer> {
        match self {
            State::ServerVerified(server) | State::Running(server) => Some(server),
            State::Idle
            | State::ServerStarting
            | State::Registering
            | State::Failed
            | State::Stopped => None,
        }
    }
}

/// Owns the plugin server for its whole life: start, verify, register, stop.
pub struct V4l2lDevicePlugin {
    config: PluginConfig,
    registry: Arc<DeviceRegistry>,
    state: State,
}

impl V4l2lDevicePlugin {
    pub fn new(config: PluginConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            registry,
            state: State::Idle,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Number of ListAndWatch subscriptions currently held open.
    pub fn active_watchers(&self) -> usize {
        match &self.state {
            State::ServerVerified(server) | State::Running(server) => {
                server.watchers.load(Ordering::SeqCst)
            }
            _ => 0,
        }
    }

    fn transition(&mut self, next: State) -> State {
        debug!("device plugin phase -> {}", next.phase());
        std::mem::replace(&mut self.state, next)
    }

    /// Move the current state out, leaving `Failed` until the next transition.
    fn take(&mut self) -> State {
        std::mem::replace(&mut self.state, State::Failed)
    }

    /// Start the server and register it with the kubelet.
    ///
    /// On a registration failure the server is stopped and its socket removed
    /// before the error is returned.
    pub async fn serve(&mut self) -> Result<(), Report<DevicePluginError>> {
        self.start_server().await?;
        self.register().await
    }

    /// Bind the plugin socket, spawn the gRPC server and check that it answers.
    pub async fn start_server(&mut self) -> Result<(), Report<DevicePluginError>> {
        match self.phase() {
            Phase::Idle | Phase::Failed | Phase::Stopped => {}
            phase => {
                return Err(Report::new(DevicePluginError::InvalidTransition {
                    action: "start server",
                    phase,
                }))
            }
        }
        self.transition(State::ServerStarting);

        let socket_path = self.config.socket_path();
        info!("start device plugin server: {}", socket_path.display());

        let server = match self.spawn_server(&socket_path) {
            Ok(server) => server,
            Err(e) => {
                self.transition(State::Failed);
                return Err(e);
            }
        };

        // make sure the server answers before anyone is told about it
        self.verify_server(server, &socket_path, &socket_path).await
    }

    /// Dial `dial_path` and keep the server only if it answers; otherwise stop
    /// it and remove `socket_path`.
    async fn verify_server(
        &mut self,
        server: RunningServer,
        socket_path: &Path,
        dial_path: &Path,
    ) -> Result<(), Report<DevicePluginError>> {
        if let Err(e) = uds::connect(dial_path, self.config.connect_timeout).await {
            server.stop().await;
            if let Err(cleanup) = remove_socket(socket_path) {
                warn!("failed to remove socket {}: {cleanup}", socket_path.display());
            }
            self.transition(State::Failed);
            return Err(Report::new(e).change_context(DevicePluginError::ServerUnreachable {
                path: dial_path.display().to_string(),
            }));
        }

        info!("device plugin server is reachable at {}", socket_path.display());
        self.transition(State::ServerVerified(server));
        Ok(())
    }

    fn spawn_server(&self, socket_path: &Path) -> Result<RunningServer, Report<DevicePluginError>> {
        let bind_context = || DevicePluginError::SocketBind {
            path: socket_path.display().to_string(),
        };

        // a previous unclean shutdown may have left the socket behind
        remove_socket(socket_path).change_context_lazy(bind_context)?;
        let listener = UnixListener::bind(socket_path).change_context_lazy(bind_context)?;

        let shutdown = CancellationToken::new();
        let service = DevicePluginService::new(self.registry.clone(), shutdown.clone());
        let watchers = service.watcher_count();
        let server_shutdown = shutdown.clone();

        let task = tokio::spawn(async move {
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    server_shutdown.cancelled().await;
                    info!("shutting down gRPC server");
                })
                .await
        });

        Ok(RunningServer {
            shutdown,
            task,
            watchers,
        })
    }

    /// Announce the verified server to the kubelet, exactly once.
    pub async fn register(&mut self) -> Result<(), Report<DevicePluginError>> {
        let server = match self.take() {
            State::ServerVerified(server) => server,
            other => {
                let phase = other.phase();
                self.state = other;
                return Err(Report::new(DevicePluginError::InvalidTransition {
                    action: "register",
                    phase,
                }));
            }
        };
        self.transition(State::Registering);

        let request =
            registration::register_request(&self.config.socket_name, &self.config.resource_name);
        let result = registration::register_with_kubelet(
            &self.config.kubelet_socket_path(),
            request,
            self.config.connect_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                self.transition(State::Running(server));
                info!(
                    "device plugin for {} is running on {}",
                    self.config.resource_name,
                    self.config.socket_path().display()
                );
                Ok(())
            }
            Err(e) => {
                error!("registration failed, stopping device plugin server");
                server.stop().await;
                if let Err(cleanup) = remove_socket(&self.config.socket_path()) {
                    warn!("failed to remove socket: {cleanup}");
                }
                self.transition(State::Failed);
                Err(e)
            }
        }
    }

    /// Stop the server, if any, and remove the socket file.
    ///
    /// Safe to call in any phase and any number of times.
    pub async fn stop(&mut self) -> Result<(), Report<DevicePluginError>> {
        if let Some(server) = self.transition(State::Stopped).into_server() {
            server.stop().await;
        }

        let socket_path = self.config.socket_path();
        remove_socket(&socket_path).change_context_lazy(|| DevicePluginError::SocketCleanup {
            path: socket_path.display().to_string(),
        })?;
        debug!("removed socket {}", socket_path.display());
        Ok(())
    }

    /// Tear down and run the whole startup sequence again.
    pub async fn restart(&mut self) -> Result<(), Report<DevicePluginError>> {
        info!("restarting device plugin");
        self.stop().await?;
        self.serve().await
    }
}

/// Remove a socket file; a missing file is fine.
fn remove_socket(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
