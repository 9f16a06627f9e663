//! Wire protocol: one JSON object per frame, tagged on `type`. Decoding never
//! fails softly into a disconnect — an unparsable frame becomes an `error`
//! response further up the stack (see `session::connection`).

use serde::Deserialize;

use crate::error::ProtocolError;

/// Frames a client may send. Registration-gating (which of these are legal
/// before `register`) is enforced by the dispatcher, not here.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "register")]
    Register { #[serde(rename = "pairingCode")] pairing_code: String, #[serde(rename = "publicKey")] public_key: String },

    #[serde(rename = "pair_request")]
    PairRequest { #[serde(rename = "targetCode")] target_code: String },

    #[serde(rename = "pair_response")]
    PairResponse { #[serde(rename = "targetCode")] target_code: String, accepted: bool },

    #[serde(rename = "signal_forward")]
    SignalForward { #[serde(rename = "peerCode")] peer_code: String, payload: serde_json::Value },

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "heartbeat")]
    Heartbeat,

    #[serde(rename = "register_rendezvous")]
    RegisterRendezvous {
        #[serde(default)]
        points: Vec<String>,
        #[serde(default)]
        tokens: Vec<String>,
        #[serde(rename = "deadDrops", default)]
        dead_drops: std::collections::HashMap<String, String>,
        #[serde(rename = "deadDrop", default)]
        dead_drop: Option<String>,
        #[serde(rename = "relayId")]
        relay_id: String,
    },

    #[serde(rename = "channel-owner-register")]
    ChannelOwnerRegister { #[serde(rename = "channelId")] channel_id: String },

    #[serde(rename = "channel-subscribe")]
    ChannelSubscribe { #[serde(rename = "channelId")] channel_id: String },

    #[serde(rename = "upstream-message")]
    UpstreamMessage {
        #[serde(rename = "channelId")] channel_id: String,
        message: serde_json::Value,
        #[serde(rename = "ephemeralPublicKey")] ephemeral_public_key: String,
    },

    #[serde(rename = "stream-start")]
    StreamStart { #[serde(rename = "channelId")] channel_id: String, #[serde(default)] title: Option<String> },

    #[serde(rename = "stream-frame")]
    StreamFrame { #[serde(rename = "channelId")] channel_id: String, frame: serde_json::Value },

    #[serde(rename = "stream-end")]
    StreamEnd { #[serde(rename = "channelId")] channel_id: String },

    #[serde(rename = "chunk_announce")]
    ChunkAnnounce { #[serde(rename = "peerId")] peer_id: String, chunks: Vec<ChunkAnnounceEntry> },

    #[serde(rename = "chunk_request")]
    ChunkRequest { #[serde(rename = "chunkId")] chunk_id: String, #[serde(rename = "channelId")] channel_id: String },

    #[serde(rename = "chunk_push")]
    ChunkPush { #[serde(rename = "chunkId")] chunk_id: String, #[serde(rename = "channelId")] channel_id: String, data: String },

    #[serde(rename = "attest_request")]
    AttestRequest { build_token: String, device_id: String },

    #[serde(rename = "attest_response")]
    AttestResponse { nonce: String, responses: Vec<AttestResponseEntry> },
}

/// `chunk_id` is optional at the wire level: an entry with a missing
/// `chunkId` is skipped (not a frame-level parse error), same as one with
/// an empty string.
#[derive(Debug, Deserialize)]
pub struct ChunkAnnounceEntry {
    #[serde(rename = "chunkId", default)]
    pub chunk_id: Option<String>,
    #[serde(rename = "channelId", default)]
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AttestResponseEntry {
    pub region_index: u32,
    pub hmac: String,
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)
    }
}

/// The 6-character pairing code alphabet, excluding visually-ambiguous
/// characters (0/O, 1/I).
pub const PAIRING_CODE_ALPHABET: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn is_valid_pairing_code(code: &str) -> bool {
    code.len() == 6 && code.chars().all(|c| PAIRING_CODE_ALPHABET.contains(c))
}

pub fn is_valid_public_key(key: &str) -> bool {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .map(|b| b.len() == 32)
        .unwrap_or(false)
}
