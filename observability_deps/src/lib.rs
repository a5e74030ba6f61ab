//! This crate exists to coordinate versions of `tracing` within the workspace.
//!
//! All other crates use `observability_deps::tracing` rather than depending on
//! the facade directly, so swapping or pinning the logging stack is a
//! one-crate change.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]

pub use tracing;
