//! Authentication and authorization at the edge.
//!
//! - [`relay`]: the two-gate `authorize` pipeline (verdict, then budget).
//! - [`cache`]: fingerprinting and the shared verdict store.
//! - [`circuit`]: breaker guarding the credential authority.
//! - [`context`]: signed identity context for downstream services.
//! - [`middleware`]: request-side glue (bearer extraction, detached authorize).

pub mod cache;
pub mod circuit;
pub mod context;
pub mod error;
pub mod middleware;
pub mod relay;
pub mod verdict;
