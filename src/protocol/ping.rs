//! Peer-hub application protocol (supplemental, `SPEC_FULL.md` §4.6).
//!
//! The distilled spec leaves the data-channel-side application protocol
//! unspecified beyond "it runs". `ping` is the smallest concrete
//! instantiation of it: echo the payload back. Registered on the peer
//! hub by the service side (`peer::PeerConnection::new`) once the data
//! channel's hub is built; a user-side endpoint wanting to exercise the
//! same peer hub registers the identical handler.

use crate::error::Result;
use crate::hub::Hub;

pub fn register_ping_handler(hub: &Hub) -> crate::hub::Unregister {
    hub.handle("ping", |w, r| async move { w.write(r.payload).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::message::Message;
    use crate::hub::transport::Transport;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: &Message) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn ping_echoes_payload() {
        let transport = std::sync::Arc::new(RecordingTransport {
            sent: Mutex::new(Vec::new()),
        });
        let hub = Hub::new(transport.clone());
        register_ping_handler(&hub);

        let bytes = serde_json::to_vec(&Message::request(
            "ping",
            1,
            serde_json::json!({"n": 1}),
        ))
        .unwrap();
        hub.process_message(&bytes).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload, Some(serde_json::json!({"n": 1})));
    }
}
