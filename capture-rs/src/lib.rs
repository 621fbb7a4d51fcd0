//! capture-rs: disposable-mailbox SMTP capture server
//!
//! Accepts mail over SMTP for any address and files it into a per-recipient
//! mailbox instead of relaying it. Old messages are evicted by a background
//! retention scanner.
//!
//! # Example
//!
//! ```no_run
//! use capture_rs::alias::AliasSnapshot;
//! use capture_rs::config::Config;
//! use capture_rs::metrics::Metrics;
//! use capture_rs::smtp::{ServerContext, SmtpServer};
//! use capture_rs::storage::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ServerContext::new(
//!         Config::default(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(AliasSnapshot::new()),
//!         Arc::new(Metrics::new()),
//!     );
//!
//!     let server = SmtpServer::new(ctx);
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types and handling
//! - [`smtp`]: SMTP protocol implementation
//! - [`storage`]: Mailbox storage backends
//! - [`alias`]: Group alias expansion
//! - [`retention`]: Expired message eviction
//! - [`metrics`]: Counters for monitoring
//! - [`utils`]: Address grammar

pub mod alias;
pub mod config;
pub mod error;
pub mod metrics;
pub mod retention;
pub mod smtp;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{MailError, Result};
