//! Wire records for the session's channels

use serde::{Deserialize, Serialize};

use tandem_core::delta::{Operation, Signature};
use tandem_core::model::{Change, Problem};

/// First message on the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRequest {
    /// Session identifier, non-empty
    pub session: String,
    /// Wire version number; selects the hash algorithm and defaults
    pub version: u32,
    /// Synchronization root, possibly tilde-prefixed
    pub root: String,
    /// Ignore patterns, gitignore syntax
    pub ignores: Vec<String>,
    /// Whether this endpoint is the session's alpha side
    pub alpha: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResponse {
    pub preserves_executability: bool,
}

/// A control-channel request. Requests are strictly FIFO; responses are
/// emitted in request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EndpointRequest {
    Scan { base_signature: Signature },
    Stage { transitions: Vec<Change> },
    Transition { transitions: Vec<Change> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    /// Set when the scan hit presumed-concurrent modification; the
    /// controller should retry
    pub try_again: bool,
    /// Compressed operation stream transforming the base snapshot
    /// encoding into the current one
    pub snapshot_delta: Vec<u8>,
}

/// Empty on success; staging failures surface as control-stream errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionResponse {
    /// Changes that were applied successfully
    pub changes: Vec<Change>,
    /// Per-entry failures; never aborts the batch
    pub problems: Vec<Problem>,
}

/// Request on the rsync channels: transmit `path` as a delta against the
/// receiver's base signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub path: String,
    pub base_signature: Signature,
}

/// One step of a transfer: a delta operation, or the end marker with an
/// optional transmitter-side error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferFrame {
    Op(Operation),
    End { error: Option<String> },
}

/// Staging progress snapshot, tagged with a monotonically increasing
/// index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingStatus {
    pub path: String,
    pub index: u64,
    pub received: u64,
    pub total: u64,
}

/// Coalesced "something changed" tick; carries no payload.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WatchEvent {}
