//! cluster-sync - mirrors Kubernetes resources between clusters
//!
//! A `ResourceSyncRule` names a kind in a remote (source) cluster. Matching
//! objects are mutated, stripped of source-only metadata and written into
//! the local (destination) cluster. An ownership annotation on every written
//! object picks a single writer when several clusters mirror the same
//! object: a claim holds until the claimant is no longer alive.
//!
//! # Modules
//!
//! - [`crd`] - The ResourceSyncRule custom resource and its spec types
//! - [`sync`] - Request codec, ownership arbitration, sanitizer, rule engine,
//!   overlays and rate limiting
//! - [`controller`] - Reconciliation pipeline, kube-runtime controller, reverse watches
//!   and the controller runner
//! - [`transport`] - Generic cluster API access over kube-rs
//! - [`clusters`] - Cluster liveness registry
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Runtime tunables
//! - [`retry`] - Backoff configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod clusters;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod retry;
pub mod sync;
pub mod transport;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
