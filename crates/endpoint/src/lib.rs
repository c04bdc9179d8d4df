//! tandem-endpoint: the served side of a synchronization session
//!
//! Multiplexes one duplex byte stream into the session's logical channels
//! and serves scan, stage, and transition requests against a local root.

pub mod codec;
pub mod messages;
pub mod mux;
pub mod paths;
pub mod serve;
pub mod transfer;
pub mod watch;

pub use codec::{CodecError, MessageStream};
pub use messages::{
    EndpointRequest, InitializeRequest, InitializeResponse, ScanResponse, StageResponse,
    StagingStatus, TransferFrame, TransferRequest, TransitionResponse, WatchEvent,
};
pub use mux::{multiplex, Channels, MuxError, Substream};
pub use serve::{serve, serve_with_options, EndpointOptions};
