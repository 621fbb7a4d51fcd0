//! SMTP capture server (RFC 5321 subset)
//!
//! - [`commands`]: command line and envelope address parsing
//! - [`session`]: per-connection state machine and DATA transfer
//! - [`server`]: listener, shared context and drain-on-shutdown

pub mod commands;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use server::{ServerContext, SmtpServer};
pub use session::{SessionState, SmtpSession};
