//! Wire messages exchanged between Glacier nodes.
//!
//! Every message travels inside an [`Envelope`] carrying a per-sender unique
//! id, the sender and the intended destination. The payload is a closed
//! [`Message`] enum, so the dispatcher matches every variant exhaustively.
//!
//! ## Exchanges
//!
//! ```text
//! Query(key)                    -> Response(key, have_it)
//! Insert(key, fragment, ...)    -> Receipt(key)
//! Status(report)                   (gossip, unacknowledged)
//! Sticky(origin, dest, report)     (status relayed for an unreachable node)
//! Fetch(key)                    -> Data(key, fragment, manifest)
//! ```

use crate::directory::HistoryEvent;
use crate::erasure::Fragment;
use crate::id::{FragmentKey, Id, NodeId};
use crate::manifest::Manifest;
use crate::serialization::{from_cbor, to_cbor, SerializationError};
use serde::{Deserialize, Serialize};

/// Addressing header around every wire message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub uid: u64,
    pub source: NodeId,
    /// Node (or ring point, for placement queries) the message is meant for.
    pub destination: Id,
    pub message: Message,
}

impl Envelope {
    pub fn new(uid: u64, source: NodeId, destination: Id, message: Message) -> Self {
        Self {
            uid,
            source,
            destination,
            message,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        to_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        from_cbor(bytes)
    }
}

/// Another node known to hold a fragment of the same object, sent along
/// with an Insert so the receiver can seed its directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownHolder {
    pub index: usize,
    pub holder: NodeId,
    pub certain: bool,
}

/// Body of a status-cast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub seq: i64,
    /// Highest sequence number the sender has received from the destination.
    pub ack_seq: i64,
    pub full: bool,
    pub events: Vec<HistoryEvent>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Query {
        key: FragmentKey,
    },
    Response {
        key: FragmentKey,
        have_it: bool,
    },
    Insert {
        key: FragmentKey,
        manifest: Manifest,
        fragment: Fragment,
        known_holders: Vec<KnownHolder>,
    },
    Receipt {
        key: FragmentKey,
    },
    Status(StatusReport),
    Sticky {
        origin: NodeId,
        destination: NodeId,
        report: StatusReport,
        ttl: u32,
    },
    Fetch {
        key: FragmentKey,
    },
    Data {
        key: FragmentKey,
        fragment: Fragment,
        manifest: Manifest,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Query { .. } => "query",
            Message::Response { .. } => "response",
            Message::Insert { .. } => "insert",
            Message::Receipt { .. } => "receipt",
            Message::Status(_) => "status",
            Message::Sticky { .. } => "sticky",
            Message::Fetch { .. } => "fetch",
            Message::Data { .. } => "data",
        }
    }
}
