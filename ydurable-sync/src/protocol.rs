//! Binary sync protocol spoken by Yjs WebSocket clients.
//!
//! Every frame starts with a lib0 variable-length unsigned opcode:
//! ```text
//! ┌────────────┬──────────────────────────────────────────────┐
//! │ 0 (sync)   │ varuint sub-type (0 step1 │ 1 step2 │ 2 upd) │
//! │            │ varbuf  state vector or update               │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ 1 (aware.) │ varbuf  encoded awareness update             │
//! ├────────────┼──────────────────────────────────────────────┤
//! │ 2 (auth)   │ permission result                            │
//! │ 3 (query)  │ awareness query, no payload                  │
//! └────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Framing and message types are the ones `yrs::sync` ships; this module
//! screens opcodes and runs the document side of the sync exchange.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, Transact, Update};

pub use yrs::sync::awareness::{AwarenessUpdate, AwarenessUpdateEntry};
pub use yrs::sync::{Message, SyncMessage};

pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;
pub const MSG_AUTH: u64 = 2;
pub const MSG_QUERY_AWARENESS: u64 = 3;

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame does not follow the lib0 layout
    #[error("Malformed frame: {0}")]
    Decode(String),
    /// The CRDT rejected an update
    #[error("CRDT error: {0}")]
    Crdt(String),
    #[error("Invalid JSON: {0}")]
    Json(String),
}

impl From<read::Error> for ProtocolError {
    fn from(e: read::Error) -> Self {
        ProtocolError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Json(e.to_string())
    }
}

pub fn encode(msg: &Message) -> Vec<u8> {
    msg.encode_v1()
}

/// Decode one frame.
///
/// Resolves to `None` for opcodes outside the y-protocols set; receivers
/// ignore those.
pub fn decode(frame: &[u8]) -> Result<Option<Message>, ProtocolError> {
    let opcode: u64 = Cursor::new(frame).read_var()?;
    if opcode > MSG_QUERY_AWARENESS {
        return Ok(None);
    }
    Ok(Some(Message::decode_v1(frame)?))
}

/// Step 1 frame advertising `doc`'s state vector.
pub fn sync_step1(doc: &Doc) -> SyncMessage {
    SyncMessage::SyncStep1(doc.transact().state_vector())
}

/// Answer one sync message against `doc`.
///
/// Step 1 is answered with the diff the peer is missing. Step 2 and updates
/// are applied to `doc` and produce no reply.
pub fn handle_sync(doc: &Doc, message: &SyncMessage) -> Result<Option<SyncMessage>, ProtocolError> {
    match message {
        SyncMessage::SyncStep1(sv) => {
            let diff = doc.transact().encode_diff_v1(sv);
            Ok(Some(SyncMessage::SyncStep2(diff)))
        }
        SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
            let update = Update::decode_v1(update)?;
            doc.transact_mut()
                .apply_update(update)
                .map_err(|e| ProtocolError::Crdt(e.to_string()))?;
            Ok(None)
        }
    }
}
