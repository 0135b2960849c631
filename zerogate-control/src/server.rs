use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info};
use zerogate_rpc::{read_frame, write_frame, RequestEnvelope, ResponseEnvelope};

use crate::service::ControlPlane;

/// Accept loop for the gateway RPC listener. Each connection is one
/// gateway; each bidirectional stream is one call.
pub async fn serve(
    endpoint: quinn::Endpoint,
    service: Arc<ControlPlane>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?endpoint.local_addr(), "control plane listening");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let service = service.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => handle_connection(connection, service).await,
                        Err(err) => debug!(%err, "handshake failed"),
                    }
                });
            }
        }
    }
    endpoint.close(0u32.into(), b"shutdown");
    info!("control plane stopped");
}

async fn handle_connection(connection: quinn::Connection, service: Arc<ControlPlane>) {
    debug!(remote = %connection.remote_address(), "gateway connected");
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let service = service.clone();
                tokio::spawn(handle_stream(send, recv, service));
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                debug!(remote = %connection.remote_address(), "gateway disconnected");
                break;
            }
            Err(err) => {
                debug!(%err, "connection error");
                break;
            }
        }
    }
}

async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    service: Arc<ControlPlane>,
) {
    let envelope: RequestEnvelope = match read_frame(&mut recv).await {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(%err, "bad request frame");
            return;
        }
    };
    let result = service.handle(envelope).await;
    let response = ResponseEnvelope { result };
    if let Err(err) = write_frame(&mut send, &response).await {
        error!(%err, "response write failed");
        return;
    }
    let _ = send.finish();
}
