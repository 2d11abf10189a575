//! # Thunder Shared Crate
//!
//! Cross-cutting building blocks used by the server: configuration loading,
//! the service-error model, database pools and the transaction manager,
//! JWT/credential crypto, tracing bootstrap, the in-process TTL cache, and
//! the observability event bus.
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`config`] | Layered configuration (defaults ⊕ YAML ⊕ env) |
//! | [`errors`] | `ServiceError {kind, code, description}` |
//! | [`database`] | Datasource pools, dialected query records |
//! | [`transaction`] | Nestable transactional scopes |
//! | [`crypto`] | JWT sign/verify/decode, credential hashing |
//! | [`cache`] | In-process TTL cache |
//! | [`observability`] | Category-routed event bus + subscribers |
//! | [`tracing_config`] | Structured-logging bootstrap |

pub mod cache;
pub mod config;
pub mod crypto;
pub mod database;
pub mod errors;
pub mod observability;
pub mod tracing_config;
pub mod transaction;

pub use errors::{ErrorKind, ServiceError, ServiceResult};
