use crate::error::{MailError, Result};
use std::fmt;

/// Characters permitted in an unquoted local-part besides letters and digits
const UNQUOTED_SPECIALS: &[u8] = b"!#$%&'*+-/=?^_`{|}~";

const MAX_ADDRESS_LENGTH: usize = 320;
const MAX_LOCAL_LENGTH: usize = 128;
const MAX_DOMAIN_LENGTH: usize = 255;
const MAX_LABEL_LENGTH: usize = 63;

/// A parsed mailbox address with quoting and escapes removed from the local-part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Lower-cased `local@domain`, used as the mailbox name
    pub fn normalized(&self) -> String {
        format!(
            "{}@{}",
            self.local.to_lowercase(),
            self.domain.trim_end_matches('.').to_lowercase()
        )
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Parse an address into local-part and domain.
///
/// The local-part is either a quoted string or a dot-atom in which any
/// character may be escaped with a backslash. Exactly one `@` outside quotes
/// and escapes separates it from the domain; anything after that `@` must be a
/// valid domain, so `first@last@host.com` is rejected while
/// `user\@internal@host.com` and `"user@internal"@host.com` are accepted.
pub fn parse_email_address(address: &str) -> Result<EmailAddress> {
    if address.is_empty() {
        return Err(invalid("Email is empty"));
    }
    if address.len() > MAX_ADDRESS_LENGTH {
        return Err(invalid("Address exceeds 320 characters"));
    }

    let bytes = address.as_bytes();
    if bytes[0] == b'@' {
        return Err(invalid("Address cannot start with @"));
    }
    if bytes[0] == b'.' {
        return Err(invalid("Address cannot start with a period"));
    }

    let mut local = Vec::with_capacity(address.len());
    let mut domain = None;
    let mut prev = b'.';
    let mut in_char_quote = false;
    let mut in_string_quote = false;

    for (i, &c) in bytes.iter().enumerate() {
        match c {
            c if c.is_ascii_alphanumeric() || UNQUOTED_SPECIALS.contains(&c) => {
                local.push(c);
                in_char_quote = false;
            }
            b'.' => {
                if prev == b'.' && !in_string_quote {
                    return Err(invalid("Sequence of periods is not permitted"));
                }
                local.push(b'.');
                in_char_quote = false;
            }
            b'\\' => {
                if in_char_quote {
                    local.push(b'\\');
                    in_char_quote = false;
                } else {
                    in_char_quote = true;
                }
            }
            b'"' => {
                if in_char_quote {
                    local.push(b'"');
                    in_char_quote = false;
                } else if in_string_quote {
                    in_string_quote = false;
                } else if i == 0 {
                    in_string_quote = true;
                } else {
                    return Err(invalid("Quoted string can only begin at start of address"));
                }
            }
            b'@' => {
                if in_char_quote || in_string_quote {
                    local.push(b'@');
                    in_char_quote = false;
                } else {
                    if i > MAX_LOCAL_LENGTH {
                        return Err(invalid("Local part must not exceed 128 characters"));
                    }
                    if prev == b'.' {
                        return Err(invalid("Local part cannot end with a period"));
                    }
                    domain = Some(&address[i + 1..]);
                    break;
                }
            }
            c if c > 127 && !in_string_quote => {
                return Err(invalid("Characters outside of US-ASCII range not permitted"));
            }
            c => {
                if in_char_quote || in_string_quote {
                    local.push(c);
                    in_char_quote = false;
                } else {
                    return Err(MailError::InvalidEmail(format!(
                        "Character {:?} must be quoted",
                        c as char
                    )));
                }
            }
        }
        prev = c;
    }

    if in_char_quote {
        return Err(invalid("Cannot end address with unterminated quoted-pair"));
    }
    if in_string_quote {
        return Err(invalid("Cannot end address with unterminated string quote"));
    }

    let domain = domain.ok_or_else(|| invalid("Email must contain @"))?;
    if !validate_domain(domain) {
        return Err(MailError::InvalidEmail(format!(
            "Domain part validation failed: {:?}",
            domain
        )));
    }

    // Only whole multi-byte sequences inside quotes reach `local`
    let local = String::from_utf8(local).map_err(|_| invalid("Local part is not valid UTF-8"))?;

    Ok(EmailAddress {
        local,
        domain: domain.to_string(),
    })
}

/// Check a domain against RFC 1035 label rules (underscores tolerated).
pub fn validate_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LENGTH {
        return false;
    }

    let terminator: &[u8] = if domain.ends_with('.') { b"" } else { b"." };
    let mut prev = b'.';
    let mut label_len = 0;
    let mut has_alnum = false;

    for &c in domain.as_bytes().iter().chain(terminator) {
        match c {
            c if c.is_ascii_alphanumeric() || c == b'_' => {
                has_alnum = true;
                label_len += 1;
            }
            b'-' => {
                if prev == b'.' {
                    return false;
                }
                label_len += 1;
            }
            b'.' => {
                if prev == b'.' || prev == b'-' || label_len > MAX_LABEL_LENGTH || !has_alnum {
                    return false;
                }
                label_len = 0;
                has_alnum = false;
            }
            _ => return false,
        }
        prev = c;
    }

    true
}

fn invalid(reason: &str) -> MailError {
    MailError::InvalidEmail(reason.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_email() {
        assert!(parse_email_address("test@example.com").is_ok());
        assert!(parse_email_address("user.name@example.co.uk").is_ok());
        assert!(parse_email_address("host!host!user/data@foo.com").is_ok());
        assert!(parse_email_address("john@localhost").is_ok());
        assert!(parse_email_address("helo@127.0.0.1").is_ok());
    }

    #[test]
    fn test_invalid_email() {
        assert!(parse_email_address("").is_err());
        assert!(parse_email_address("test").is_err());
        assert!(parse_email_address("test@").is_err());
        assert!(parse_email_address("@example.com").is_err());
        assert!(parse_email_address(".user@example.com").is_err());
        assert!(parse_email_address("user.@example.com").is_err());
        assert!(parse_email_address("us..er@example.com").is_err());
        assert!(parse_email_address("first last@gmail.com").is_err());
        assert!(parse_email_address("first@last@gmail.com").is_err());
        assert!(parse_email_address("user@-bad.com").is_err());
        assert!(parse_email_address("user@bad-.com").is_err());
        assert!(parse_email_address("pâté@example.com").is_err());
    }

    #[test]
    fn test_quoted_local_part() {
        let addr = parse_email_address("\"first last\"@space.com").unwrap();
        assert_eq!(addr.local, "first last");
        assert_eq!(addr.domain, "space.com");

        let addr = parse_email_address("\"user@internal\"@external.com").unwrap();
        assert_eq!(addr.local, "user@internal");
        assert_eq!(addr.domain, "external.com");

        let addr = parse_email_address("\"user>name\"@host.com").unwrap();
        assert_eq!(addr.local, "user>name");

        let addr = parse_email_address("\"pâté chaud\"@host.com").unwrap();
        assert_eq!(addr.local, "pâté chaud");
        assert_eq!(addr.normalized(), "pâté chaud@host.com");

        assert!(parse_email_address("\"unterminated@host.com").is_err());
        assert!(parse_email_address("mid\"quote\"@host.com").is_err());
    }

    #[test]
    fn test_escaped_local_part() {
        let addr = parse_email_address("user\\@internal@external.com").unwrap();
        assert_eq!(addr.local, "user@internal");
        assert_eq!(addr.domain, "external.com");

        let addr = parse_email_address("user\\>name@host.com").unwrap();
        assert_eq!(addr.local, "user>name");

        let addr = parse_email_address("first\\ last@host.com").unwrap();
        assert_eq!(addr.local, "first last");

        assert!(parse_email_address("trailing\\").is_err());
    }

    #[test]
    fn test_normalized() {
        let addr = parse_email_address("John.Doe@Example.COM.").unwrap();
        assert_eq!(addr.normalized(), "john.doe@example.com");
    }

    #[test]
    fn test_validate_domain() {
        assert!(validate_domain("example.com"));
        assert!(validate_domain("example.com."));
        assert!(validate_domain("a_b.example"));
        assert!(!validate_domain(""));
        assert!(!validate_domain("exa mple.com"));
        assert!(!validate_domain("example..com"));
        assert!(!validate_domain(&format!("{}.com", "a".repeat(64))));
    }
}
