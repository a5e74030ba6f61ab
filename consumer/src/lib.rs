//! The cluster metrics consumer.
//!
//! Three asynchronous sources share this crate's state:
//!
//! 1. The **resource syncer** watches the orchestrator, upserts object
//!    identity into the [`identity_catalog`] and maintains the in-memory
//!    UID → id caches.
//! 2. The **ingest endpoint** accepts collector batches, resolves each raw
//!    metric through the caches and appends samples to the
//!    [`ring_window::RingWindow`].
//! 3. The **flush worker** drains the window into the [`sample_store`] on a
//!    fixed cadence.
//!
//! ## Locking discipline
//!
//! Ingest must never block on the orchestrator watch or on disk: it takes
//! only the window lock and the cache read lock. The syncer takes the cache
//! write lock strictly after a successful catalog upsert, so a resolved id
//! always has a durable row behind it. No lock is held across I/O.
//!
//! ## Loss model
//!
//! Overflowing the window drops the newest sample; a failed flush drops the
//! whole batch; samples whose owner UID is unknown are recorded against the
//! sentinel id `0` and excluded from query results. All three are deliberate
//! trade-offs on a monitoring path.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::todo,
    missing_debug_implementations,
    missing_docs
)]

mod cache;
pub use cache::ResolverCache;

mod flush;

/// Consumer initialisation methods & types.
///
/// This module defines the public API boundary of the consumer crate.
mod init;
pub use init::*;

mod server;
pub use server::HttpDelegate;

mod sync;
pub use sync::ResourceSyncer;
