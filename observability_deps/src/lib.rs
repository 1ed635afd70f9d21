//! Log observability dependencies for the tephra workspace.
//!
//! Crates in this workspace import `tracing` through this crate so that the
//! version (and compile-time level filtering) is decided in exactly one place.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;
