//! `one-core`: identity, trust, connection, pairing, and channel
//! synchronization for a content-addressed personal data store.
//!
//! No global state lives here — every component is constructed with
//! its dependencies as explicit `Arc` arguments (an `Arc<dyn
//! ObjectStore>`, an `Arc<TrustGraph>`, and so on) rather than reached
//! for through a singleton, so tests and embedding applications can
//! run several independent instances in one process.

pub mod canonical;
pub mod channel;
pub mod config;
pub mod connection;
pub mod directory_cache;
pub mod error;
pub mod identity;
pub mod object_store;
pub mod pairing;
pub mod tls;
pub mod trust;
