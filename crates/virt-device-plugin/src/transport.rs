//! gRPC client channels over Unix domain sockets.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out after {timeout:?} connecting to {}", path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("failed to connect to {}: {source}", path.display())]
    Transport {
        path: PathBuf,
        #[source]
        source: tonic::transport::Error,
    },
}

/// Connects a gRPC channel to the socket at `socket_path`, failing when the
/// connection is not established within `timeout`.
pub async fn connect_uds(socket_path: &Path, timeout: Duration) -> Result<Channel, ConnectError> {
    let path = socket_path.to_path_buf();
    let connector_path = path.clone();

    // The HTTP URL is a placeholder since we're using Unix socket connector
    let endpoint = Endpoint::from_static("http://tonic").connect_timeout(timeout);
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let socket_path = connector_path.clone();
        async move {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => Ok(TokioIo::new(stream)),
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => Ok(channel),
        Ok(Err(source)) => Err(ConnectError::Transport { path, source }),
        Err(_) => Err(ConnectError::Timeout { path, timeout }),
    }
}
