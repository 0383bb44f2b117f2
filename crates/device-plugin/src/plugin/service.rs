use std::pin::Pin;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::api::device_plugin_server::DevicePlugin;
use crate::api::AllocateRequest;
use crate::api::AllocateResponse;
use crate::api::ContainerAllocateResponse;
use crate::api::DevicePluginOptions;
use crate::api::Empty;
use crate::api::ListAndWatchResponse;
use crate::api::PreStartContainerRequest;
use crate::api::PreStartContainerResponse;
use crate::api::PreferredAllocationRequest;
use crate::api::PreferredAllocationResponse;
use crate::device::DeviceRegistry;
use crate::error::DevicePluginError;

/// Options announced at registration and returned by GetDevicePluginOptions.
pub const PLUGIN_OPTIONS: DevicePluginOptions = DevicePluginOptions {
    pre_start_required: false,
    get_preferred_allocation_available: false,
};

/// DevicePlugin service implementation backed by the device registry.
#[derive(Debug, Clone)]
pub struct DevicePluginService {
    registry: Arc<DeviceRegistry>,
    /// ends every open ListAndWatch stream when cancelled
    shutdown: CancellationToken,
    watchers: Arc<AtomicUsize>,
}

impl DevicePluginService {
    pub fn new(registry: Arc<DeviceRegistry>, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            shutdown,
            watchers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of ListAndWatch handlers that are still parked.
    pub fn watcher_count(&self) -> Arc<AtomicUsize> {
        self.watchers.clone()
    }
}

/// Keeps the live watcher count accurate however the handler exits.
struct WatcherGuard(Arc<AtomicUsize>);

impl WatcherGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(PLUGIN_OPTIONS))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the device list once, then hold the stream open until the kubelet
    /// goes away or the server shuts down.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        let response = self.registry.list_response();
        info!("starting to watch device list: {} devices", response.devices.len());

        let (tx, rx) = mpsc::channel(1);
        let shutdown = self.shutdown.clone();
        let guard = WatcherGuard::new(self.watchers.clone());

        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = tx.send(Ok(response)).await {
                error!("failed to send initial device list: {e}");
                return;
            }

            // device health never changes, so there is nothing more to send
            tokio::select! {
                _ = tx.closed() => info!("kubelet closed the device list stream"),
                _ = shutdown.cancelled() => info!("device list stream stopped by shutdown"),
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        debug!("getting preferred device allocation: {:?}", request.get_ref());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    /// Map every requested device to its host path.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!("allocating devices: {:?}", req.container_requests);

        let container_responses = req
            .container_requests
            .iter()
            .map(|container_req| {
                self.registry
                    .device_specs(container_req.devices_ids.as_slice())
                    .map(|devices| ContainerAllocateResponse {
                        devices,
                        ..Default::default()
                    })
            })
            .collect::<Result<Vec<_>, DevicePluginError>>()
            .map_err(|e| {
                warn!("rejecting allocate request: {e}");
                Status::from(e)
            })?;

        debug!("allocate response: {:?}", container_responses);
        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container: {:?}", request.get_ref().devices_ids);
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use test_log::test;
    use tonic::Code;

    use super::*;
    use crate::api::ContainerAllocateRequest;
    use crate::api::DeviceSpec;
    use crate::device::DeviceRecord;

    fn service() -> DevicePluginService {
        let registry = DeviceRegistry::new(vec![
            DeviceRecord::new("video0", "/dev/video0"),
            DeviceRecord::new("video1", "/dev/video1"),
        ]);
        DevicePluginService::new(Arc::new(registry), CancellationToken::new())
    }

    fn allocate_request(groups: &[&[&str]]) -> AllocateRequest {
        AllocateRequest {
            container_requests: groups
                .iter()
                .map(|ids| ContainerAllocateRequest {
                    devices_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        }
    }

    async fn wait_for_watchers(counter: &AtomicUsize, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.load(Ordering::SeqCst) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("watcher count should settle");
    }

    #[test(tokio::test)]
    async fn options_declare_no_pre_start() {
        let options = service()
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .expect("should return options")
            .into_inner();

        assert!(!options.pre_start_required);
        assert!(!options.get_preferred_allocation_available);
    }

    #[test(tokio::test)]
    async fn allocate_returns_host_path() {
        let response = service()
            .allocate(Request::new(allocate_request(&[&["video1"]])))
            .await
            .expect("allocate should succeed")
            .into_inner();

        assert_eq!(response.container_responses.len(), 1);
        assert_eq!(
            response.container_responses[0].devices,
            vec![DeviceSpec {
                container_path: "/dev/video1".to_string(),
                host_path: "/dev/video1".to_string(),
                permissions: "rw".to_string(),
            }]
        );
    }

    #[test(tokio::test)]
    async fn allocate_preserves_group_shape_and_order() {
        let response = service()
            .allocate(Request::new(allocate_request(&[
                &["video1", "video0"],
                &[],
                &["video0"],
            ])))
            .await
            .expect("allocate should succeed")
            .into_inner();

        let paths: Vec<Vec<&str>> = response
            .container_responses
            .iter()
            .map(|r| r.devices.iter().map(|d| d.host_path.as_str()).collect())
            .collect();
        assert_eq!(
            paths,
            vec![vec!["/dev/video1", "/dev/video0"], vec![], vec!["/dev/video0"]]
        );
    }

    #[test(tokio::test)]
    async fn allocate_is_idempotent() {
        let service = service();
        let request = allocate_request(&[&["video0", "video1"]]);

        let first = service
            .allocate(Request::new(request.clone()))
            .await
            .expect("first allocate should succeed")
            .into_inner();
        let second = service
            .allocate(Request::new(request))
            .await
            .expect("second allocate should succeed")
            .into_inner();

        assert_eq!(first, second);
    }

    #[test(tokio::test)]
    async fn allocate_empty_request() {
        let response = service()
            .allocate(Request::new(AllocateRequest::default()))
            .await
            .expect("allocate should succeed")
            .into_inner();

        assert!(response.container_responses.is_empty());
    }

    #[test(tokio::test)]
    async fn allocate_unknown_device_fails() {
        let status = service()
            .allocate(Request::new(allocate_request(&[&["video0"], &["video5"]])))
            .await
            .expect_err("unknown device should be rejected");

        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "unknown device identity: video5");
    }

    #[test(tokio::test)]
    async fn pre_start_container_is_noop() {
        let result = service()
            .pre_start_container(Request::new(PreStartContainerRequest {
                devices_ids: vec!["video0".to_string()],
            }))
            .await;
        assert!(result.is_ok());
    }

    #[test(tokio::test)]
    async fn preferred_allocation_is_empty() {
        let response = service()
            .get_preferred_allocation(Request::new(PreferredAllocationRequest::default()))
            .await
            .expect("should succeed")
            .into_inner();
        assert!(response.container_responses.is_empty());
    }

    #[test(tokio::test)]
    async fn list_and_watch_sends_devices_once_and_stays_open() {
        let service = service();
        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("should open stream")
            .into_inner();

        let first = stream
            .next()
            .await
            .expect("stream should yield")
            .expect("first message should be ok");
        let ids: Vec<&str> = first.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["video0", "video1"]);
        assert!(first.devices.iter().all(|d| d.health == "Healthy"));

        let next = tokio::time::timeout(Duration::from_millis(200), stream.next()).await;
        assert!(next.is_err(), "stream should stay open without new messages");
        assert_eq!(service.watcher_count().load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn list_and_watch_handler_ends_when_client_leaves() {
        let service = service();
        let counter = service.watcher_count();

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("should open stream")
            .into_inner();
        let first = stream.next().await.expect("stream should yield");
        assert!(first.is_ok());
        wait_for_watchers(&counter, 1).await;

        drop(stream);
        wait_for_watchers(&counter, 0).await;
    }

    #[test(tokio::test)]
    async fn list_and_watch_stream_ends_on_shutdown() {
        let shutdown = CancellationToken::new();
        let registry = DeviceRegistry::new(vec![DeviceRecord::new("video0", "/dev/video0")]);
        let service = DevicePluginService::new(Arc::new(registry), shutdown.clone());

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .expect("should open stream")
            .into_inner();
        let first = stream.next().await.expect("stream should yield");
        assert!(first.is_ok());

        shutdown.cancel();
        let end = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end after shutdown");
        assert!(end.is_none());
        wait_for_watchers(&service.watcher_count(), 0).await;
    }
}
