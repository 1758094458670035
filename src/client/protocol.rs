//! Client-side server protocol: one instance per outbound websocket
//! connection on a service endpoint (`SPEC_FULL.md` §4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::hub::{Hub, Request, ResponseWriter, Unregister};
use crate::peer::PeerConnection;
use crate::protocol::{
    ConnectRequest, ConnectResponse, ConnectType, CreatePeerRequest, CreatePeerResponse,
    DeletePeerRequest,
};

/// Drives `create-peer` / `delete-peer` against the broker and owns this
/// connection's live peer connection wrappers, keyed by peer id.
pub struct ClientProtocol {
    hub: Arc<Hub>,
    ice_servers: Mutex<Vec<String>>,
    peers: Mutex<HashMap<String, Arc<PeerConnection>>>,
    // See the matching field on `server::SessionProtocol`: breaks the
    // hub/protocol reference cycle these closures would otherwise form.
    own_handlers: Mutex<Vec<Unregister>>,
}

impl ClientProtocol {
    pub fn new(hub: Arc<Hub>) -> Arc<Self> {
        let protocol = Arc::new(Self {
            hub,
            ice_servers: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            own_handlers: Mutex::new(Vec::new()),
        });
        protocol.register_handlers();
        protocol
    }

    fn register_handlers(self: &Arc<Self>) {
        let mut tokens = Vec::with_capacity(2);

        let p = Arc::clone(self);
        tokens.push(self.hub.handle("create-peer", move |w, r| {
            let p = Arc::clone(&p);
            async move { p.on_create_peer(w, r).await }
        }));

        let p = Arc::clone(self);
        tokens.push(self.hub.handle("delete-peer", move |w, r| {
            let p = Arc::clone(&p);
            async move { p.on_delete_peer(w, r).await }
        }));

        *self.own_handlers.lock().unwrap() = tokens;
    }

    /// Tears this connection's side down: closes every live peer
    /// connection wrapper and unregisters this protocol's own handlers
    /// from its hub, breaking the hub/protocol reference cycle. Called
    /// once the dial loop's socket read ends, mirroring
    /// `server::SessionProtocol::done`.
    pub async fn shutdown(&self) {
        let peers: Vec<Arc<PeerConnection>> =
            self.peers.lock().unwrap().drain().map(|(_, v)| v).collect();
        for peer in peers {
            peer.close().await;
        }

        for token in self.own_handlers.lock().unwrap().drain(..) {
            token.unregister();
        }
    }

    /// Sends the initial `connect {type: service}` and records the
    /// returned ICE server URLs. Must complete before the broker will
    /// pair this connection with any user.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let payload = serde_json::to_value(ConnectRequest {
            connect_type: ConnectType::Service,
        })?;
        let response = self.hub.request_sync("connect", payload).await?;
        let response: ConnectResponse = serde_json::from_value(response)?;
        *self.ice_servers.lock().unwrap() = response.ice_servers;
        tracing::info!(hub_id = %self.hub.id, "connected to broker as service");
        Ok(())
    }

    async fn on_create_peer(self: &Arc<Self>, w: ResponseWriter, r: Request) -> Result<()> {
        let req: CreatePeerRequest = serde_json::from_value(r.payload)?;
        let ice_servers = self.ice_servers.lock().unwrap().clone();

        let this = Arc::clone(self);
        let wrapper = PeerConnection::new(
            req.id.clone(),
            &ice_servers,
            Arc::clone(&self.hub),
            move |peer_id| {
                let this = Arc::clone(&this);
                Box::pin(async move { this.on_peer_closed(peer_id).await })
            },
        )
        .await?;

        self.peers
            .lock()
            .unwrap()
            .insert(req.id.clone(), Arc::clone(&wrapper));

        let offer = wrapper.create_offer().await?;
        w.write(serde_json::to_value(CreatePeerResponse {
            id: req.id,
            session_description: offer,
        })?)
        .await
    }

    /// Removes the wrapper from the local map and tells the broker the
    /// peer is gone, fire-and-forget. Runs on whatever task drives the
    /// wrapper's close path, so this keeps its own work non-blocking.
    ///
    /// Only notifies the broker if the wrapper was still in the map: a
    /// broker-initiated teardown (`on_delete_peer`) already removed it
    /// before calling `wrapper.close()`, and re-notifying here would
    /// send a spurious second `delete-peer` for an id the broker already
    /// dropped, matching the reference client's `if err == nil` guard.
    async fn on_peer_closed(self: &Arc<Self>, peer_id: String) {
        if self.peers.lock().unwrap().remove(&peer_id).is_none() {
            return;
        }

        let payload = match serde_json::to_value(DeletePeerRequest {
            id: peer_id.clone(),
        }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode delete-peer payload");
                return;
            }
        };

        if let Err(err) = self.hub.request_without_response("delete-peer", payload).await {
            tracing::error!(peer_id = %peer_id, error = %err, "failed to notify broker of peer close");
        }
    }

    async fn on_delete_peer(self: &Arc<Self>, w: ResponseWriter, r: Request) -> Result<()> {
        let req: DeletePeerRequest = serde_json::from_value(r.payload)?;
        let wrapper = self
            .peers
            .lock()
            .unwrap()
            .remove(&req.id)
            .ok_or_else(|| Error::PeerNotFound(req.id.clone()))?;

        wrapper.close().await;
        w.write(serde_json::Value::Null).await
    }
}
