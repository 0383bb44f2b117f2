use std::io;
use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

/// Open a gRPC channel over a Unix domain socket, giving up after `timeout`.
pub async fn connect(socket_path: &Path, timeout: Duration) -> io::Result<Channel> {
    let target = socket_path.to_path_buf();

    // The URI is a placeholder, the connector always dials the socket.
    let endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connecting = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let target = target.clone();
        async move { UnixStream::connect(target).await.map(TokioIo::new) }
    }));

    match tokio::time::timeout(timeout, connecting).await {
        Ok(channel) => channel.map_err(io::Error::other),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "timed out after {timeout:?} connecting to {}",
                socket_path.display()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use test_log::test;
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;
    use tokio_util::sync::CancellationToken;
    use tonic::transport::Server;

    use super::*;
    use crate::api::device_plugin_client::DevicePluginClient;
    use crate::api::device_plugin_server::DevicePluginServer;
    use crate::api::Empty;
    use crate::device::DeviceRegistry;
    use crate::plugin::service::DevicePluginService;

    #[test(tokio::test)]
    async fn connect_fails_without_listener() {
        let dir = TempDir::new().expect("should create temp dir");
        let result = connect(&dir.path().join("absent.sock"), Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[test(tokio::test)]
    async fn connects_to_listening_server() {
        let dir = TempDir::new().expect("should create temp dir");
        let socket_path = dir.path().join("plugin.sock");
        let listener = UnixListener::bind(&socket_path).expect("should bind socket");

        let shutdown = CancellationToken::new();
        let service =
            DevicePluginService::new(Arc::new(DeviceRegistry::default()), shutdown.clone());
        let server = tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    shutdown.clone().cancelled_owned(),
                ),
        );

        let channel = connect(&socket_path, Duration::from_secs(2))
            .await
            .expect("should connect to listening server");
        let options = DevicePluginClient::new(channel)
            .get_device_plugin_options(Empty {})
            .await
            .expect("call over the channel should succeed")
            .into_inner();
        assert!(!options.pre_start_required);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
    }
}
