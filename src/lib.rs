//! # Enclave - Transit Encryption Service
//!
//! An in-process transit-secrets engine built in Rust.
//!
//! ## Architecture
//!
//! - `keys`: polymorphic transit keys (ML-KEM/Kyber and RSA-OAEP) with
//!   self-describing binary envelopes and block-chunked encrypt/decrypt
//! - `storage`: TTL-evicting key cache with a peer-shared read-through
//!   group-cache facade and a background sweeper
//! - `server`: REST surface under `/transit`, bearer auth, request-scoped
//!   logging, and a two-server lifecycle with graceful shutdown
//! - `urlcache`: TTL-bounded HTTP GET cache with singleflight request
//!   coalescing and bounded retry
//! - `config`: defaults with environment overrides

#![warn(missing_docs)]
#![warn(clippy::all)]

// Service configuration
pub mod config;

// Transit key variants, factory, and envelope codec
pub mod keys;

// TTL key cache and group-cache facade
pub mod storage;

// HTTP API and server lifecycle
pub mod server;

// Coalescing URL fetch cache
pub mod urlcache;

// Re-export commonly used types
pub use config::Config;
pub use keys::{KeyError, TransitKey};
pub use server::Server;
pub use storage::{KeyStore, StorageError};
pub use urlcache::{UrlCache, UrlCacheError};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
