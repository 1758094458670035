//! Service process: dials the broker websocket, instantiates a hub and a
//! client-side server protocol, loops reading frames; on disconnect,
//! reconnects with a one-second backoff until interrupted
//! (`SPEC_FULL.md` §2.7, §5, §6 CLI surface).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::client::protocol::ClientProtocol;
use crate::config::ServiceConfig;
use crate::hub::transport::ClientWebSocketTransport;
use crate::hub::Hub;

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

enum DialOutcome {
    /// The broker connection ended (error or clean close); reconnect.
    Disconnected,
    /// `Ctrl+C` was received; the caller should stop retrying.
    Interrupted,
}

/// Dials `config.server` and reconnects with a fixed one-second backoff
/// until `Ctrl+C` is received.
pub async fn run(config: ServiceConfig) -> crate::error::Result<()> {
    loop {
        match dial_once(&config.server).await {
            Ok(DialOutcome::Interrupted) => return Ok(()),
            Ok(DialOutcome::Disconnected) => {}
            Err(err) => tracing::warn!(error = %err, "failed to connect to broker"),
        }

        tracing::info!(seconds = RECONNECT_BACKOFF.as_secs(), "reconnecting after backoff");

        tokio::select! {
            _ = sleep(RECONNECT_BACKOFF) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Dials once, runs the client-side server protocol until the socket
/// closes, errors, or the process is interrupted.
async fn dial_once(server_url: &str) -> crate::error::Result<DialOutcome> {
    let (stream, _) = connect_async(server_url).await?;
    tracing::info!(server = server_url, "connected to broker");

    let (sink, mut source) = stream.split();
    let transport = Arc::new(ClientWebSocketTransport::new(sink));
    let hub = Hub::new(Arc::clone(&transport));
    let protocol = ClientProtocol::new(Arc::clone(&hub));

    // `start` does a `request_sync("connect", ..)` on this hub; its
    // response only arrives once the read loop below is pumping frames
    // into `process_message`, so the handshake runs on its own task
    // instead of blocking here before any reader exists to complete it.
    let connect_handshake = {
        let protocol = Arc::clone(&protocol);
        tokio::spawn(async move { protocol.start().await })
    };

    let outcome = loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    if let Err(err) = hub.process_message(text.as_bytes()).await {
                        tracing::warn!(error = %err, "protocol error from broker");
                        break DialOutcome::Disconnected;
                    }
                }
                Some(Ok(TungsteniteMessage::Binary(bytes))) => {
                    if let Err(err) = hub.process_message(&bytes).await {
                        tracing::warn!(error = %err, "protocol error from broker");
                        break DialOutcome::Disconnected;
                    }
                }
                Some(Ok(TungsteniteMessage::Close(_))) | None => break DialOutcome::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "websocket read error");
                    break DialOutcome::Disconnected;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, closing connection");
                if timeout(CLOSE_WRITE_TIMEOUT, transport.send_close()).await.is_err() {
                    tracing::warn!("close frame did not complete within one second");
                }
                break DialOutcome::Interrupted;
            }
        }
    };

    hub.shut_down("broker connection closed");
    protocol.shutdown().await;

    if let Ok(Err(err)) = connect_handshake.await {
        tracing::warn!(error = %err, "connect handshake did not complete");
    }

    Ok(outcome)
}
