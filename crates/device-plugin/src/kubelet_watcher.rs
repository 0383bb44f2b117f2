//! Detects kubelet restarts through re-creation of its registration socket.

use std::ffi::OsString;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use notify::Config;
use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::error::DevicePluginError;

/// Watches the device plugin directory for a new kubelet socket.
pub struct KubeletWatcher {
    // kept alive for the lifetime of the receiver
    _watcher: RecommendedWatcher,
    restarts: mpsc::Receiver<()>,
}

impl KubeletWatcher {
    pub fn new(
        device_plugin_dir: &Path,
        kubelet_socket_name: &str,
    ) -> Result<Self, Report<DevicePluginError>> {
        let context = || DevicePluginError::KubeletWatch {
            message: format!("cannot watch {}", device_plugin_dir.display()),
        };

        // bursts of events collapse into a single pending restart
        let (tx, restarts) = mpsc::channel(1);
        let socket_name = OsString::from(kubelet_socket_name);

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if is_socket_created(&event, &socket_name) {
                        debug!("kubelet socket event: {:?}", event);
                        let _ = tx.try_send(());
                    }
                }
                Err(e) => error!("Filesystem watch error: {:?}", e),
            },
            Config::default(),
        )
        .change_context_lazy(context)?;

        watcher
            .watch(device_plugin_dir, RecursiveMode::NonRecursive)
            .change_context_lazy(context)?;

        info!(
            "watching {} for kubelet restarts",
            device_plugin_dir.join(kubelet_socket_name).display()
        );

        Ok(Self {
            _watcher: watcher,
            restarts,
        })
    }

    /// Resolve once the kubelet socket has been created again.
    pub async fn restarted(&mut self) {
        if self.restarts.recv().await.is_none() {
            // the sender lives inside the watcher, so this never ends
            std::future::pending::<()>().await;
        }
    }
}

fn is_socket_created(event: &Event, socket_name: &OsString) -> bool {
    matches!(event.kind, EventKind::Create(_))
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(socket_name.as_os_str()))
}
