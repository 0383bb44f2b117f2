use std::io;
use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tonic::Request;
use tracing::debug;
use tracing::info;

use crate::api::registration_client::RegistrationClient;
use crate::api::RegisterRequest;
use crate::error::DevicePluginError;
use crate::plugin::service::PLUGIN_OPTIONS;
use crate::plugin::uds;

/// Device plugin API version this plugin implements.
pub const API_VERSION: &str = "v1beta1";

/// Build the request announcing `endpoint` (a socket file name inside the
/// device plugin directory) under `resource_name`.
pub fn register_request(endpoint: &str, resource_name: &str) -> RegisterRequest {
    RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(PLUGIN_OPTIONS),
    }
}

/// Register once with the kubelet listening on `kubelet_socket`.
///
/// Both the dial and the call are bounded by `timeout`; there is no retry.
pub async fn register_with_kubelet(
    kubelet_socket: &Path,
    request: RegisterRequest,
    timeout: Duration,
) -> Result<(), Report<DevicePluginError>> {
    let context = || DevicePluginError::Registration {
        endpoint: kubelet_socket.display().to_string(),
    };

    info!("registering device plugin with kubelet: {}", kubelet_socket.display());
    debug!("register request: {:?}", request);

    let channel = uds::connect(kubelet_socket, timeout)
        .await
        .change_context_lazy(context)?;
    let mut client = RegistrationClient::new(channel);

    match tokio::time::timeout(timeout, client.register(Request::new(request))).await {
        Ok(Ok(_)) => {
            info!("successfully registered device plugin with kubelet");
            Ok(())
        }
        Ok(Err(status)) => Err(Report::new(context())
            .attach_printable(format!("kubelet rejected registration: {status}"))),
        Err(_) => Err(Report::new(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("register call timed out after {timeout:?}"),
        ))
        .change_context(context())),
    }
}
