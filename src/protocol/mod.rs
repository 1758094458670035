//! Broker RPC payload types (see `SPEC_FULL.md` §6).
//!
//! These are the structured payloads carried in [`crate::hub::Message`]'s
//! `payload` field; the hub itself is agnostic to their shape.

pub mod ping;

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectType {
    Service,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(rename = "type")]
    pub connect_type: ConnectType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePeerRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePeerResponse {
    pub id: String,
    #[serde(rename = "sessionDescription")]
    pub session_description: RTCSessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePeerRequest {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub id: String,
    pub candidate: webrtc::ice_transport::ice_candidate::RTCIceCandidateInit,
}
