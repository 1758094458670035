//! Peer connection wrapper — the offerer side of one (service, user) pair.
//!
//! Couples a WebRTC peer connection, its one data channel (named `"hub"`),
//! the signaling hub (the websocket hub this wrapper was built on) and a
//! peer hub built on the data channel. See `SPEC_FULL.md` §4.2.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Result;
use crate::hub::transport::DataChannelTransport;
use crate::hub::{Hub, ResponseWriter};
use crate::protocol::ping::register_ping_handler;
use crate::protocol::IceCandidatePayload;

/// Label of the one data channel every peer connection creates.
pub const DATA_CHANNEL_LABEL: &str = "hub";

struct PendingIce {
    answer_received: bool,
    pending: Vec<RTCIceCandidate>,
}

/// Invoked exactly once, from `close`, after internal teardown is done.
/// The client-side server protocol uses this to drop the wrapper from its
/// local peer map and notify the broker with a fire-and-forget
/// `delete-peer` (§4.4) — kept out of the wrapper itself since the core
/// `webrtc` API only allows one peer-connection-state-change handler per
/// connection, and the wrapper's own `Closed`-state reaction (§4.2) must
/// run regardless of whether an owner is listening.
type ClosedCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// The offerer-side peer connection wrapper described in §4.2.
///
/// Owns the WebRTC peer connection and its data channel, a queued-write
/// transport for that channel (`DataChannelTransport`, which breaks the
/// wrapper/hub ownership cycle per `SPEC_FULL.md` §9 — it holds only the
/// channel handle and a write queue, never a reference back to `self`),
/// the peer hub built on that transport, the enclosing signaling hub, and
/// the ICE-candidate buffering state.
pub struct PeerConnection {
    pub peer_id: String,
    pub connection: Arc<RTCPeerConnection>,
    pub peer_hub: Arc<Hub>,
    signaling_hub: Arc<Hub>,
    ice: Mutex<PendingIce>,
    closed: AtomicBool,
    answer_unregister: Mutex<Option<crate::hub::Unregister>>,
    ice_unregister: Mutex<Option<crate::hub::Unregister>>,
    on_closed: ClosedCallback,
}

impl PeerConnection {
    /// Creates the WebRTC peer connection, the `"hub"` data channel, and
    /// the peer hub bound to it. Registers `answer` and `ice-candidate`
    /// handlers on `signaling_hub` scoped to this `peer_id`. `on_closed`
    /// runs once, after internal teardown, when the connection reaches
    /// `Closed` or the data channel closes.
    pub async fn new(
        peer_id: String,
        ice_server_urls: &[String],
        signaling_hub: Arc<Hub>,
        on_closed: impl Fn(String) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: ice_server_urls.to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(config).await?);
        let data_channel = connection.create_data_channel(DATA_CHANNEL_LABEL, None).await?;

        let transport = Arc::new(DataChannelTransport::new());
        let peer_hub = Hub::new(transport.clone());
        register_ping_handler(&peer_hub);

        let wrapper = Arc::new(Self {
            peer_id,
            connection: Arc::clone(&connection),
            peer_hub,
            signaling_hub,
            ice: Mutex::new(PendingIce {
                answer_received: false,
                pending: Vec::new(),
            }),
            closed: AtomicBool::new(false),
            answer_unregister: Mutex::new(None),
            ice_unregister: Mutex::new(None),
            on_closed: Arc::new(on_closed),
        });

        {
            let transport = Arc::clone(&transport);
            let d = Arc::clone(&data_channel);
            data_channel
                .on_open(Box::new(move || {
                    let transport = Arc::clone(&transport);
                    let d = Arc::clone(&d);
                    Box::pin(async move { transport.open(d).await })
                }))
                .await;
        }

        {
            let wrapper = Arc::clone(&wrapper);
            data_channel
                .on_close(Box::new(move || {
                    let wrapper = Arc::clone(&wrapper);
                    Box::pin(async move { wrapper.close().await })
                }))
                .await;
        }

        {
            let wrapper = Arc::clone(&wrapper);
            connection
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let wrapper = Arc::clone(&wrapper);
                    Box::pin(async move {
                        if let Some(candidate) = candidate {
                            wrapper.on_local_ice_candidate(candidate).await;
                        }
                    })
                }))
                .await;
        }

        {
            let wrapper = Arc::clone(&wrapper);
            connection
                .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                    let wrapper = Arc::clone(&wrapper);
                    Box::pin(async move {
                        if state == RTCPeerConnectionState::Closed
                            || state == RTCPeerConnectionState::Failed
                        {
                            wrapper.close().await;
                        }
                    })
                }))
                .await;
        }

        wrapper.register_signaling_handlers();

        Ok(wrapper)
    }

    fn register_signaling_handlers(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let unregister = self.signaling_hub.handle("answer", move |w, r| {
            let this = Arc::clone(&this);
            async move { this.on_answer(w, r).await }
        });
        *self.answer_unregister.lock().unwrap() = Some(unregister);

        let this = Arc::clone(self);
        let unregister = self.signaling_hub.handle("ice-candidate", move |w, r| {
            let this = Arc::clone(&this);
            async move { this.on_remote_ice_candidate(w, r).await }
        });
        *self.ice_unregister.lock().unwrap() = Some(unregister);
    }

    /// Creates the offer, sets it as the local description, and returns
    /// it to the caller (the client-side `create-peer` handler).
    pub async fn create_offer(&self) -> Result<RTCSessionDescription> {
        let offer = self.connection.create_offer(None).await?;
        self.connection.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    async fn on_local_ice_candidate(&self, candidate: RTCIceCandidate) {
        let init = match candidate.to_json() {
            Ok(init) => init,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize local ICE candidate");
                return;
            }
        };

        let send_now = {
            let mut ice = self.ice.lock().unwrap();
            if ice.answer_received {
                true
            } else {
                ice.pending.push(candidate);
                false
            }
        };

        if send_now {
            self.send_ice_candidate(init).await;
        }
    }

    async fn send_ice_candidate(&self, candidate: RTCIceCandidateInit) {
        let payload = match serde_json::to_value(IceCandidatePayload {
            id: self.peer_id.clone(),
            candidate,
        }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode ice-candidate payload");
                return;
            }
        };

        if let Err(err) = self
            .signaling_hub
            .request_without_response("ice-candidate", payload)
            .await
        {
            tracing::error!(peer_id = %self.peer_id, error = %err, "failed to send ice-candidate");
        }
    }

    /// Handles the broker's `answer` request for this peer. Every peer on
    /// the connection registers its own `answer` handler on the same
    /// shared signaling hub, and the hub runs all of them, in order,
    /// against one single-shot `ResponseWriter` per incoming request
    /// (`SPEC_FULL.md` §4.1). Never write here — on mismatch or match
    /// alike, returning `Ok(())` without writing lets the chain continue
    /// to the handler for the request's actual peer, and the hub's
    /// chain-end `write_null_if_unwritten` emits the single response once
    /// the chain completes.
    async fn on_answer(self: &Arc<Self>, _w: ResponseWriter, r: crate::hub::Request) -> Result<()> {
        let payload: crate::protocol::CreatePeerResponse = serde_json::from_value(r.payload)?;
        if payload.id != self.peer_id {
            return Ok(());
        }

        self.connection
            .set_remote_description(payload.session_description)
            .await?;

        let pending: Vec<RTCIceCandidate> = {
            let mut ice = self.ice.lock().unwrap();
            ice.answer_received = true;
            std::mem::take(&mut ice.pending)
        };

        for candidate in pending {
            if let Ok(init) = candidate.to_json() {
                self.send_ice_candidate(init).await;
            }
        }

        Ok(())
    }

    /// Handles an inbound `ice-candidate` from the signaling hub. Same
    /// shared-writer reasoning as `on_answer`: never write, on mismatch or
    /// match.
    async fn on_remote_ice_candidate(
        self: &Arc<Self>,
        _w: ResponseWriter,
        r: crate::hub::Request,
    ) -> Result<()> {
        let payload: IceCandidatePayload = serde_json::from_value(r.payload)?;
        if payload.id != self.peer_id {
            return Ok(());
        }

        self.connection.add_ice_candidate(payload.candidate).await?;
        Ok(())
    }

    /// Tears the wrapper down: unregisters the `answer`/`ice-candidate`
    /// handlers on the signaling hub and closes the WebRTC connection.
    /// Idempotent — safe to invoke from both the data channel's `close`
    /// event and the peer connection's `closed` state callback.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(unregister) = self.answer_unregister.lock().unwrap().take() {
            unregister.unregister();
        }
        if let Some(unregister) = self.ice_unregister.lock().unwrap().take() {
            unregister.unregister();
        }

        self.peer_hub.shut_down("peer connection closed");

        if let Err(err) = self.connection.close().await {
            tracing::warn!(peer_id = %self.peer_id, error = %err, "error closing peer connection");
        }

        (self.on_closed)(self.peer_id.clone()).await;
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}
