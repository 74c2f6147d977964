//! Purpose: Library crate behind the `redump` CLI and its integration tests.
//! Exports: `api` (dump and restore pipelines, Redis client, errors).
//! Role: Pipelines are generic over `StoreClient`; the binary supplies a pooled Redis client.
//! Invariants: `core` stays private; everything callers need is re-exported from `api`.
//! Invariants: Library code logs through `tracing` and never installs a subscriber.
pub mod api;
mod core;
