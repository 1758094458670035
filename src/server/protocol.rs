//! Server-side session protocol: one instance per websocket connection
//! accepted by the broker. Handles `connect`, `ice-candidate`,
//! `delete-peer`, and drives `create-peer` / `announce` / `answer`
//! against the paired service and user hubs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::hub::{Hub, Request, ResponseWriter, Unregister};
use crate::protocol::{
    ConnectRequest, ConnectResponse, ConnectType, CreatePeerRequest, CreatePeerResponse,
    DeletePeerRequest, IceCandidatePayload,
};

use super::registry::{PeerRecord, Registry};

pub struct SessionProtocol {
    pub hub: Arc<Hub>,
    registry: Registry,
    connect_request: Mutex<Option<ConnectRequest>>,
    connected: AtomicBool,
    // `pub(super)`: `Registry::insert_peer`/`remove_peer` update this set
    // and the global peer map under the same critical section (P1/P2),
    // so the registry needs direct access to it.
    pub(super) peer_ids: Mutex<HashSet<String>>,
    // Closures registered on our own hub close over an `Arc<Self>`, which
    // would otherwise keep hub and session alive in a reference cycle
    // forever. `done()` unregisters these, the same way a peer connection
    // wrapper unregisters its signaling-hub handlers on close.
    own_handlers: Mutex<Vec<Unregister>>,
}

impl SessionProtocol {
    pub fn new(hub: Arc<Hub>, registry: Registry) -> Arc<Self> {
        let session = Arc::new(Self {
            hub,
            registry,
            connect_request: Mutex::new(None),
            connected: AtomicBool::new(false),
            peer_ids: Mutex::new(HashSet::new()),
            own_handlers: Mutex::new(Vec::new()),
        });
        session.register_handlers();
        session
    }

    fn register_handlers(self: &Arc<Self>) {
        let mut tokens = Vec::with_capacity(3);

        let s = Arc::clone(self);
        tokens.push(self.hub.handle("connect", move |w, r| {
            let s = Arc::clone(&s);
            async move { s.on_connect(w, r).await }
        }));

        let s = Arc::clone(self);
        tokens.push(self.hub.handle("ice-candidate", move |w, r| {
            let s = Arc::clone(&s);
            async move { s.on_ice_candidate(w, r).await }
        }));

        let s = Arc::clone(self);
        tokens.push(self.hub.handle("delete-peer", move |w, r| {
            let s = Arc::clone(&s);
            async move { s.on_delete_peer(w, r).await }
        }));

        *self.own_handlers.lock().unwrap() = tokens;
    }

    pub fn connect_type(&self) -> Option<ConnectType> {
        self.connect_request
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.connect_type)
    }

    async fn on_connect(self: &Arc<Self>, w: ResponseWriter, r: Request) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(Error::Application("already connected".to_string()));
        }

        let req: ConnectRequest = serde_json::from_value(r.payload)?;

        // Only mark connected once the payload is known-good — a
        // malformed `connect` must not permanently wedge the session in
        // an "already connected" state with nothing registered.
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(Error::Application("already connected".to_string()));
        }
        *self.connect_request.lock().unwrap() = Some(req.clone());

        match req.connect_type {
            ConnectType::Service => self
                .registry
                .register_service(&self.hub.id, Arc::clone(self)),
            ConnectType::User => self.registry.register_user(&self.hub.id, Arc::clone(self)),
        }

        tracing::info!(session_type = ?req.connect_type, hub_id = %self.hub.id, "connected");

        w.write(serde_json::to_value(ConnectResponse {
            ice_servers: vec![],
        })?)
        .await?;

        match req.connect_type {
            ConnectType::User => {
                for service in self.registry.services() {
                    if let Err(err) = service.announce(self).await {
                        tracing::error!(error = %err, "announce failed");
                    }
                }
            }
            ConnectType::Service => {
                for user in self.registry.users() {
                    if let Err(err) = self.announce(&user).await {
                        tracing::error!(error = %err, "announce failed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Drives a single (service=self, user) pairing through
    /// `create-peer` → `announce` → `answer`, minting a fresh peer id
    /// at the broker (see `SPEC_FULL.md` §9 on peer-id generation).
    async fn announce(self: &Arc<Self>, user: &Arc<SessionProtocol>) -> Result<()> {
        let peer_id = uuid::Uuid::new_v4().to_string();

        let create_peer_payload = serde_json::to_value(CreatePeerRequest {
            id: peer_id.clone(),
        })?;
        let res = self.hub.request_sync("create-peer", create_peer_payload).await?;
        let create_peer_response: CreatePeerResponse = serde_json::from_value(res)?;

        // Inserts into the global map and both sessions' local sets as
        // one critical section (P1) — see `Registry::insert_peer`.
        self.registry.insert_peer(
            &peer_id,
            PeerRecord {
                service: Arc::clone(self),
                user: Arc::clone(user),
            },
        );

        let announce_payload = serde_json::to_value(&create_peer_response)?;
        let answer = user.hub.request_sync("announce", announce_payload).await?;

        self.hub.request_sync("answer", answer).await?;

        tracing::info!(peer_id = %peer_id, "peer paired");
        Ok(())
    }

    async fn on_ice_candidate(self: &Arc<Self>, _w: ResponseWriter, r: Request) -> Result<()> {
        let candidate: IceCandidatePayload = serde_json::from_value(r.payload.clone())?;
        let record = self
            .registry
            .get_peer(&candidate.id)
            .ok_or_else(|| Error::PeerNotFound(candidate.id.clone()))?;

        let target = if Arc::ptr_eq(self, &record.service) {
            &record.user.hub
        } else {
            &record.service.hub
        };

        target
            .request_without_response("ice-candidate", r.payload)
            .await?;
        Ok(())
    }

    async fn on_delete_peer(self: &Arc<Self>, _w: ResponseWriter, r: Request) -> Result<()> {
        let req: DeletePeerRequest = serde_json::from_value(r.payload)?;
        self.delete_peer(&req.id).await
    }

    /// Removes the peer record atomically from the global map and both
    /// sessions' local sets (P2 — see `Registry::remove_peer`), then
    /// forwards `delete-peer` to the *other* side of the pair — corrected
    /// per the REDESIGN flag in `SPEC_FULL.md` §9 (the reference broker
    /// forwards to the user hub unconditionally, which is a latent bug).
    async fn delete_peer(self: &Arc<Self>, peer_id: &str) -> Result<()> {
        let record = self
            .registry
            .remove_peer(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        let target = if Arc::ptr_eq(self, &record.service) {
            &record.user.hub
        } else {
            &record.service.hub
        };

        target
            .request_without_response(
                "delete-peer",
                serde_json::to_value(DeletePeerRequest {
                    id: peer_id.to_string(),
                })?,
            )
            .await?;

        Ok(())
    }

    /// Session teardown: removes every peer this session still owns,
    /// then drops the session from the global directory. Safe against
    /// concurrent deletes driven by peer-connection close events on the
    /// other side — `delete_peer` on an already-removed id is a no-op
    /// error we log and swallow here.
    pub async fn done(self: &Arc<Self>) {
        let peer_ids: Vec<String> = self.peer_ids.lock().unwrap().iter().cloned().collect();
        for peer_id in peer_ids {
            if let Err(err) = self.delete_peer(&peer_id).await {
                tracing::debug!(peer_id = %peer_id, error = %err, "delete_peer during teardown");
            }
        }

        match self.connect_type() {
            Some(ConnectType::Service) => self.registry.unregister_service(&self.hub.id),
            Some(ConnectType::User) => self.registry.unregister_user(&self.hub.id),
            None => {}
        }

        self.hub.shut_down("session terminated");

        for token in self.own_handlers.lock().unwrap().drain(..) {
            token.unregister();
        }

        tracing::info!(hub_id = %self.hub.id, "disconnected");
    }

    #[cfg(test)]
    pub fn peer_ids_snapshot(&self) -> HashSet<String> {
        self.peer_ids.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::message::Message;
    use crate::hub::transport::Transport;
    use std::sync::Mutex as StdMutex;

    struct RecordingTransport {
        sent: StdMutex<Vec<Message>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, message: &Message) -> Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_rejects_second_attempt() {
        let registry = Registry::new();
        let hub = Hub::new(RecordingTransport::new());
        let session = SessionProtocol::new(hub.clone(), registry);

        let bytes = serde_json::to_vec(&Message::request(
            "connect",
            1,
            serde_json::json!({"type": "service"}),
        ))
        .unwrap();
        hub.process_message(&bytes).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(session.connect_type(), Some(ConnectType::Service));

        let bytes2 = serde_json::to_vec(&Message::request(
            "connect",
            2,
            serde_json::json!({"type": "service"}),
        ))
        .unwrap();
        hub.process_message(&bytes2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        // second attempt is rejected; connect_type is unchanged (still Some from the first).
        assert_eq!(session.connect_type(), Some(ConnectType::Service));
    }

    #[tokio::test]
    async fn ice_candidate_for_unknown_peer_is_an_error() {
        let registry = Registry::new();
        let hub = Hub::new(RecordingTransport::new());
        let session = SessionProtocol::new(hub.clone(), registry);

        let bytes = serde_json::to_vec(&Message::request(
            "connect",
            1,
            serde_json::json!({"type": "service"}),
        ))
        .unwrap();
        hub.process_message(&bytes).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let ice_bytes = serde_json::to_vec(&Message::request(
            "ice-candidate",
            2,
            serde_json::json!({"id": "missing", "candidate": {"candidate": ""}}),
        ))
        .unwrap();
        hub.process_message(&ice_bytes).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let _ = session.peer_ids_snapshot();
    }
}

/// End-to-end pairing scenarios from `SPEC_FULL.md` §8, run against two
/// in-process [`SessionProtocol`]s sharing one [`Registry`] — no real
/// websocket or WebRTC transport, just a loopback pipe standing in for
/// "the wire" on each side, with the far end of each pipe driven by a
/// bare test double that plays the part of the service/user client.
#[cfg(test)]
mod pairing_e2e {
    use super::*;
    use crate::hub::message::Message;
    use crate::hub::transport::Transport;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

    struct PipeTransport {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait::async_trait]
    impl Transport for PipeTransport {
        async fn send(&self, message: &Message) -> Result<()> {
            let bytes = serde_json::to_vec(message)?;
            self.tx
                .send(bytes)
                .map_err(|_| Error::Transport("pipe closed".to_string()))
        }
    }

    /// Two hubs wired back to back: writes on one are delivered to the
    /// other's `process_message`. `broker_side` is what a `SessionProtocol`
    /// is built on; `far_side` stands in for the real service/user client
    /// and is driven directly by the test.
    fn linked_hubs() -> (Arc<Hub>, Arc<Hub>) {
        let (tx_to_far, mut rx_on_far) = mpsc::unbounded_channel::<Vec<u8>>();
        let (tx_to_broker, mut rx_on_broker) = mpsc::unbounded_channel::<Vec<u8>>();

        let broker_side = Hub::new(Arc::new(PipeTransport { tx: tx_to_far }));
        let far_side = Hub::new(Arc::new(PipeTransport { tx: tx_to_broker }));

        let far_clone = Arc::clone(&far_side);
        tokio::spawn(async move {
            while let Some(bytes) = rx_on_far.recv().await {
                let _ = far_clone.process_message(&bytes).await;
            }
        });

        let broker_clone = Arc::clone(&broker_side);
        tokio::spawn(async move {
            while let Some(bytes) = rx_on_broker.recv().await {
                let _ = broker_clone.process_message(&bytes).await;
            }
        });

        (broker_side, far_side)
    }

    fn offer_sdp() -> RTCSessionDescription {
        RTCSessionDescription::offer("v=0\r\n".to_string()).unwrap()
    }

    fn answer_sdp() -> RTCSessionDescription {
        RTCSessionDescription::answer("v=0\r\n".to_string()).unwrap()
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition did not become true in time");
    }

    /// Registers the canned `create-peer`/`answer` responders a real
    /// service endpoint would provide, and drives its `connect`.
    async fn connect_service(far_side: &Arc<Hub>) {
        far_side.handle("create-peer", |w, r| async move {
            let req: CreatePeerRequest = serde_json::from_value(r.payload)?;
            w.write(serde_json::to_value(CreatePeerResponse {
                id: req.id,
                session_description: offer_sdp(),
            })?)
            .await
        });
        far_side.handle("answer", |w, _r| async move { w.write(serde_json::Value::Null).await });

        let payload = serde_json::to_value(ConnectRequest {
            connect_type: ConnectType::Service,
        })
        .unwrap();
        far_side.request_sync("connect", payload).await.unwrap();
    }

    /// Registers the canned `announce` responder a real user endpoint
    /// would provide, and drives its `connect`.
    async fn connect_user(far_side: &Arc<Hub>) {
        far_side.handle("announce", |w, r| async move {
            let req: CreatePeerResponse = serde_json::from_value(r.payload)?;
            w.write(serde_json::to_value(CreatePeerResponse {
                id: req.id,
                session_description: answer_sdp(),
            })?)
            .await
        });

        let payload = serde_json::to_value(ConnectRequest {
            connect_type: ConnectType::User,
        })
        .unwrap();
        far_side.request_sync("connect", payload).await.unwrap();
    }

    #[tokio::test]
    async fn pairs_on_service_first_ordering() {
        let registry = Registry::new();

        let (service_broker_side, service_far_side) = linked_hubs();
        let _service_session = SessionProtocol::new(service_broker_side, registry.clone());
        connect_service(&service_far_side).await;

        let (user_broker_side, user_far_side) = linked_hubs();
        let _user_session = SessionProtocol::new(user_broker_side, registry.clone());
        connect_user(&user_far_side).await;

        wait_until(|| registry.peer_count() == 1).await;
        assert_eq!(registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn pairs_on_user_first_ordering() {
        let registry = Registry::new();

        let (user_broker_side, user_far_side) = linked_hubs();
        let _user_session = SessionProtocol::new(user_broker_side, registry.clone());
        connect_user(&user_far_side).await;

        let (service_broker_side, service_far_side) = linked_hubs();
        let _service_session = SessionProtocol::new(service_broker_side, registry.clone());
        connect_service(&service_far_side).await;

        wait_until(|| registry.peer_count() == 1).await;
        assert_eq!(registry.peer_count(), 1);
    }

    #[tokio::test]
    async fn two_users_one_service_yields_two_distinct_peers() {
        let registry = Registry::new();

        let (service_broker_side, service_far_side) = linked_hubs();
        let _service_session = SessionProtocol::new(service_broker_side, registry.clone());
        connect_service(&service_far_side).await;

        let (user_a_broker_side, user_a_far_side) = linked_hubs();
        let _user_a_session = SessionProtocol::new(user_a_broker_side, registry.clone());
        connect_user(&user_a_far_side).await;

        let (user_b_broker_side, user_b_far_side) = linked_hubs();
        let _user_b_session = SessionProtocol::new(user_b_broker_side, registry.clone());
        connect_user(&user_b_far_side).await;

        wait_until(|| registry.peer_count() == 2).await;
        assert_eq!(registry.peer_count(), 2);
    }

    #[tokio::test]
    async fn ice_candidate_relays_between_paired_sides() {
        let registry = Registry::new();

        let (service_broker_side, service_far_side) = linked_hubs();
        let _service_session = SessionProtocol::new(service_broker_side, registry.clone());
        connect_service(&service_far_side).await;

        let (user_broker_side, user_far_side) = linked_hubs();
        let _user_session = SessionProtocol::new(user_broker_side, registry.clone());

        let received: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
        let received_clone = Arc::clone(&received);
        user_far_side.handle("ice-candidate", move |w, r| {
            let received_clone = Arc::clone(&received_clone);
            async move {
                *received_clone.lock().unwrap() = Some(r.payload.clone());
                w.write(serde_json::Value::Null).await
            }
        });

        connect_user(&user_far_side).await;
        wait_until(|| registry.peer_count() == 1).await;

        let candidate = serde_json::json!({
            "candidate": "candidate:0 1 UDP 2122252543 127.0.0.1 1 typ host",
            "sdpMid": null,
            "sdpMLineIndex": 0,
            "usernameFragment": null,
        });
        let peer_id = registry.services()[0].peer_ids_snapshot().iter().next().unwrap().clone();
        let payload = serde_json::json!({"id": peer_id, "candidate": candidate});
        service_far_side
            .request_without_response("ice-candidate", payload)
            .await
            .unwrap();

        wait_until(|| received.lock().unwrap().is_some()).await;
        let forwarded = received.lock().unwrap().clone().unwrap();
        assert_eq!(forwarded["id"], serde_json::json!(peer_id));
        assert_eq!(forwarded["candidate"]["candidate"], candidate["candidate"]);
    }

    #[tokio::test]
    async fn delete_peer_from_service_removes_state_and_notifies_user() {
        let registry = Registry::new();

        let (service_broker_side, service_far_side) = linked_hubs();
        let service_session = SessionProtocol::new(service_broker_side, registry.clone());
        connect_service(&service_far_side).await;

        let (user_broker_side, user_far_side) = linked_hubs();
        let user_session = SessionProtocol::new(user_broker_side, registry.clone());

        let notified = Arc::new(Mutex::new(false));
        let notified_clone = Arc::clone(&notified);
        user_far_side.handle("delete-peer", move |w, _r| {
            let notified_clone = Arc::clone(&notified_clone);
            async move {
                *notified_clone.lock().unwrap() = true;
                w.write(serde_json::Value::Null).await
            }
        });

        connect_user(&user_far_side).await;
        wait_until(|| registry.peer_count() == 1).await;

        let peer_id = service_session.peer_ids_snapshot().iter().next().unwrap().clone();
        let payload = serde_json::to_value(DeletePeerRequest {
            id: peer_id.clone(),
        })
        .unwrap();
        service_far_side
            .request_without_response("delete-peer", payload)
            .await
            .unwrap();

        wait_until(|| registry.peer_count() == 0).await;
        wait_until(|| *notified.lock().unwrap()).await;

        assert!(!service_session.peer_ids_snapshot().contains(&peer_id));
        assert!(!user_session.peer_ids_snapshot().contains(&peer_id));
    }
}
