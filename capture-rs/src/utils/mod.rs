//! Utility modules
//!
//! - [`email`]: Email address grammar (RFC 5321 local-part and domain)

pub mod email;

pub use email::{parse_email_address, validate_domain, EmailAddress};
