//! Building blocks for CLIs of the tephra services.
//!
//! Each block groups the flags of one subsystem; service binaries `flatten`
//! the blocks they need. Every flag can also be set through its environment
//! variable.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod bucket_index;
pub mod querier;
pub mod ruler;
