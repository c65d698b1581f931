//! staticplus: an incremental site builder driven by a CouchDB change feed.
//!
//! The crate is layered the same way as the binary uses it:
//!
//! - [`domain`]: documents, attachments, change events and build policies.
//! - [`infra`]: the document store contract and its CouchDB/in-memory
//!   implementations, output writers, directory scanning and telemetry.
//! - [`application`]: the build pipeline (feed, cache, stubs, render,
//!   orchestration), promotion and the staged site workflow.
//! - [`config`]: layered settings for the binary.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub(crate) mod util;
