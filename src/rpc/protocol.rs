//! Leader RPC Protocol
//!
//! Request/response messages for the leader-side replication surface.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::job::LockId;
use crate::leader::{AddFollowerRequest, LockGrant, LockRequest};

/// Requests sent by a follower to a leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ask for a fresh lock id
    NewLockId { database: String },

    /// Acquire a lock under an id
    AcquireLock { request: LockRequest },

    /// Release a lock
    CancelLock { database: String, lock_id: LockId, client_id: String },

    /// Register as in-sync follower
    AddFollower { request: AddFollowerRequest },

    /// Read a shard's document count
    CollectionCount { database: String, shard: String },

    /// Recount a shard's documents
    RecalculateCount { database: String, shard: String },
}

impl Request {
    /// Get the request type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Request::NewLockId { .. } => "NewLockId",
            Request::AcquireLock { .. } => "AcquireLock",
            Request::CancelLock { .. } => "CancelLock",
            Request::AddFollower { .. } => "AddFollower",
            Request::CollectionCount { .. } => "CollectionCount",
            Request::RecalculateCount { .. } => "RecalculateCount",
        }
    }
}

/// Responses sent by a leader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    LockId { id: LockId },
    LockGranted { grant: LockGrant },
    Ok,
    Count { count: u64 },
    Error { code: ErrorCode, message: String },
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Upper bound for a frame body
    pub const MAX_LENGTH: u32 = 16 * 1024 * 1024;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}
