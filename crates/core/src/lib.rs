//! tandem-core: Core synchronization engine
//!
//! Provides incremental scanning, content digests, rsync-style deltas,
//! content-addressed staging, and filesystem transitions.

pub mod cache;
pub mod delta;
pub mod digest;
pub mod ignore;
pub mod model;
pub mod scan;
pub mod stage;
pub mod transition;
pub mod version;

pub use cache::{Cache, CacheEntry};
pub use delta::{Engine, Operation, Signature};
pub use digest::{Algorithm, Digest};
pub use ignore::{IgnoreCache, IgnoreMatcher};
pub use model::{Change, Entry, Problem};
pub use scan::{scan, ScanOutcome, SymlinkMode};
pub use stage::{Stager, StagingSlot};
pub use transition::transition;
pub use version::Version;
