//! # traceline-datastore
//!
//! OpenSearch-compatible index adapter. [`IndexStore`] implements the
//! [`traceline_core::EventBackend`] trait over HTTP: search and scroll,
//! document stats, bulk import with a queued action buffer, and scripted
//! label updates.
//!
//! The transport layer is a trait seam ([`transport::Transport`]) so every
//! store behavior is testable against canned responses without a live
//! backend.

pub mod scripts;
pub mod store;
pub mod transport;

pub use scripts::{label_script, TOGGLE_LABEL_SCRIPT, UPDATE_LABEL_SCRIPT};
pub use store::{IndexStore, LabelCount, StoreConfig, DEFAULT_FLUSH_INTERVAL};
pub use transport::{
    BackendRequest, BackendResponse, Body, HttpTransport, Method, Transport, TransportConfig,
};
