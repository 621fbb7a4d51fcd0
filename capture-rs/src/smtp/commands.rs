use crate::utils::email::{parse_email_address, EmailAddress};
use thiserror::Error;
use tracing::debug;

/// Command verbs this server recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    Expn,
    Send,
    Soml,
    Saml,
    Turn,
}

impl Verb {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HELO" => Some(Self::Helo),
            "EHLO" => Some(Self::Ehlo),
            "MAIL" => Some(Self::Mail),
            "RCPT" => Some(Self::Rcpt),
            "DATA" => Some(Self::Data),
            "RSET" => Some(Self::Rset),
            "NOOP" => Some(Self::Noop),
            "QUIT" => Some(Self::Quit),
            "VRFY" => Some(Self::Vrfy),
            "HELP" => Some(Self::Help),
            "EXPN" => Some(Self::Expn),
            "SEND" => Some(Self::Send),
            "SOML" => Some(Self::Soml),
            "SAML" => Some(Self::Saml),
            "TURN" => Some(Self::Turn),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Helo => "HELO",
            Self::Ehlo => "EHLO",
            Self::Mail => "MAIL",
            Self::Rcpt => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::Vrfy => "VRFY",
            Self::Help => "HELP",
            Self::Expn => "EXPN",
            Self::Send => "SEND",
            Self::Soml => "SOML",
            Self::Saml => "SAML",
            Self::Turn => "TURN",
        }
    }
}

/// Why a command line could not be turned into a [`SmtpCommand`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Not a verb we know (reply 500)
    #[error("Syntax error, command unrecognized: {0:?}")]
    Unrecognized(String),

    /// Known verb, malformed arguments (reply 501, or 503 when the verb is out of sequence)
    #[error("{verb:?}: {reason}")]
    Syntax { verb: Verb, reason: String },
}

/// BODY= parameter of MAIL FROM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    SevenBit,
    EightBitMime,
}

/// An envelope path: the text between the brackets and its parsed form
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopePath {
    pub raw: String,
    pub address: EmailAddress,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MailFrom {
    pub path: EnvelopePath,
    /// Declared size; informational only
    pub size: Option<u64>,
    pub body: Option<BodyType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(MailFrom),
    RcptTo(EnvelopePath),
    Data,
    Rset,
    Quit,
    Noop,
    Vrfy(String),
    /// Recognized but not implemented (reply 502)
    NotImplemented(Verb),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathMode {
    /// MAIL FROM: closing bracket required, bare address only after whitespace
    Strict,
    /// RCPT TO: brackets optional, missing closing bracket tolerated
    Lenient,
}

impl SmtpCommand {
    /// Split a command line into verb and arguments and parse the arguments.
    ///
    /// The verb is the first four characters, case-insensitive, followed by
    /// end of line or a single space.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let (verb, args) = split_verb(line)?;
        let syntax = |reason: &str| CommandError::Syntax {
            verb,
            reason: reason.to_string(),
        };

        match verb {
            Verb::Helo | Verb::Ehlo => {
                let mut tokens = args.split_whitespace();
                let domain = match (tokens.next(), tokens.next()) {
                    (Some(domain), None) => domain.to_string(),
                    _ => return Err(syntax("Domain name required")),
                };
                if verb == Verb::Helo {
                    Ok(SmtpCommand::Helo(domain))
                } else {
                    Ok(SmtpCommand::Ehlo(domain))
                }
            }
            Verb::Mail => Self::parse_mail_from(args).map_err(|r| syntax(&r)),
            Verb::Rcpt => Self::parse_rcpt_to(args).map_err(|r| syntax(&r)),
            Verb::Data | Verb::Rset | Verb::Quit => {
                if !args.is_empty() {
                    return Err(syntax("No parameters allowed"));
                }
                Ok(match verb {
                    Verb::Data => SmtpCommand::Data,
                    Verb::Rset => SmtpCommand::Rset,
                    _ => SmtpCommand::Quit,
                })
            }
            Verb::Noop => Ok(SmtpCommand::Noop),
            Verb::Vrfy => Ok(SmtpCommand::Vrfy(args.to_string())),
            other => Ok(SmtpCommand::NotImplemented(other)),
        }
    }

    pub fn verb(&self) -> Verb {
        match self {
            SmtpCommand::Helo(_) => Verb::Helo,
            SmtpCommand::Ehlo(_) => Verb::Ehlo,
            SmtpCommand::MailFrom(_) => Verb::Mail,
            SmtpCommand::RcptTo(_) => Verb::Rcpt,
            SmtpCommand::Data => Verb::Data,
            SmtpCommand::Rset => Verb::Rset,
            SmtpCommand::Quit => Verb::Quit,
            SmtpCommand::Noop => Verb::Noop,
            SmtpCommand::Vrfy(_) => Verb::Vrfy,
            SmtpCommand::NotImplemented(verb) => *verb,
        }
    }

    fn parse_mail_from(args: &str) -> Result<Self, String> {
        let (raw, params) = split_path(args, "FROM", PathMode::Strict)?;
        let path = envelope_path(raw)?;

        let mut size = None;
        let mut body = None;
        for (key, value) in parse_params(params)? {
            match key.as_str() {
                "SIZE" => {
                    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(format!("Unable to parse SIZE {:?} as an integer", value));
                    }
                    size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| format!("SIZE {:?} out of range", value))?,
                    );
                }
                "BODY" => {
                    body = Some(match value.to_ascii_uppercase().as_str() {
                        "7BIT" => BodyType::SevenBit,
                        "8BITMIME" => BodyType::EightBitMime,
                        _ => return Err(format!("Unsupported BODY type {:?}", value)),
                    });
                }
                _ => debug!("Ignoring MAIL parameter {}={}", key, value),
            }
        }

        Ok(SmtpCommand::MailFrom(MailFrom { path, size, body }))
    }

    fn parse_rcpt_to(args: &str) -> Result<Self, String> {
        let (raw, params) = split_path(args, "TO", PathMode::Lenient)?;
        let path = envelope_path(raw)?;
        for (key, value) in parse_params(params)? {
            debug!("Ignoring RCPT parameter {}={}", key, value);
        }
        Ok(SmtpCommand::RcptTo(path))
    }
}

fn split_verb(line: &str) -> Result<(Verb, &str), CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let unrecognized = || CommandError::Unrecognized(line.to_string());

    if line.len() < 4 || !line.is_char_boundary(4) {
        return Err(unrecognized());
    }
    let (head, rest) = line.split_at(4);
    let args = if rest.is_empty() {
        ""
    } else if let Some(stripped) = rest.strip_prefix(' ') {
        stripped.trim()
    } else {
        return Err(unrecognized());
    };

    let verb = Verb::from_str(head).ok_or_else(unrecognized)?;
    Ok((verb, args))
}

/// Split `KEYWORD:<path> params` into the path text and the parameter text.
fn split_path<'a>(args: &'a str, keyword: &str, mode: PathMode) -> Result<(&'a str, &'a str), String> {
    let expected = || format!("Was expecting {}:<address>", keyword);

    let has_keyword = args.len() >= keyword.len()
        && args.is_char_boundary(keyword.len())
        && args[..keyword.len()].eq_ignore_ascii_case(keyword);
    if !has_keyword {
        return Err(expected());
    }

    let rest = args[keyword.len()..]
        .trim_start()
        .strip_prefix(':')
        .ok_or_else(expected)?;
    let spaced = rest.starts_with(char::is_whitespace);
    let rest = rest.trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        if let Some(end) = find_unquoted(inner, |b| b == b'>') {
            let params = &inner[end + 1..];
            if !params.is_empty() && !params.starts_with(char::is_whitespace) {
                return Err("Unexpected text after closing bracket".to_string());
            }
            return Ok((inner[..end].trim(), params.trim()));
        }
        if mode == PathMode::Strict {
            return Err("Missing closing bracket".to_string());
        }
        return Ok(split_bare(inner.trim_start()));
    }

    if mode == PathMode::Strict && !spaced {
        return Err(expected());
    }
    Ok(split_bare(rest))
}

/// A bare path runs until the first whitespace outside quotes and escapes.
fn split_bare(text: &str) -> (&str, &str) {
    let end = find_unquoted(text, |b| b.is_ascii_whitespace()).unwrap_or(text.len());
    (&text[..end], text[end..].trim())
}

/// Index of the first byte matching `pred` that is neither quoted nor escaped.
fn find_unquoted(text: &str, pred: impl Fn(u8) -> bool) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (i, b) in text.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'"' => in_quote = !in_quote,
            b if !in_quote && pred(b) => return Some(i),
            _ => {}
        }
    }
    None
}

fn envelope_path(raw: &str) -> Result<EnvelopePath, String> {
    let address = parse_email_address(raw).map_err(|e| e.to_string())?;
    Ok(EnvelopePath {
        raw: raw.to_string(),
        address,
    })
}

fn parse_params(params: &str) -> Result<Vec<(String, String)>, String> {
    params
        .split_whitespace()
        .map(|param| match param.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                Ok((key.to_ascii_uppercase(), value.to_string()))
            }
            _ => Err(format!("Unable to parse ESMTP parameter {:?}", param)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail_from(line: &str) -> MailFrom {
        match SmtpCommand::parse(line).unwrap() {
            SmtpCommand::MailFrom(m) => m,
            other => panic!("expected MAIL FROM, got {:?}", other),
        }
    }

    fn rcpt_to(line: &str) -> EnvelopePath {
        match SmtpCommand::parse(line).unwrap() {
            SmtpCommand::RcptTo(p) => p,
            other => panic!("expected RCPT TO, got {:?}", other),
        }
    }

    fn is_syntax(line: &str) -> bool {
        matches!(SmtpCommand::parse(line), Err(CommandError::Syntax { .. }))
    }

    #[test]
    fn test_parse_helo() {
        let cmd = SmtpCommand::parse("HELO example.com").unwrap();
        assert_eq!(cmd, SmtpCommand::Helo("example.com".to_string()));
    }

    #[test]
    fn test_parse_ehlo_case_insensitive() {
        let cmd = SmtpCommand::parse("EhlO 127.0.0.1").unwrap();
        assert_eq!(cmd, SmtpCommand::Ehlo("127.0.0.1".to_string()));
    }

    #[test]
    fn test_helo_requires_exactly_one_domain() {
        assert!(is_syntax("HELO"));
        assert!(is_syntax("EHLO"));
        assert!(is_syntax("HELO one two"));
    }

    #[test]
    fn test_unrecognized_verbs() {
        for line in ["HELLO", "HELL", "hello", "Outlook", "FOOB", "", "QU"] {
            assert!(
                matches!(SmtpCommand::parse(line), Err(CommandError::Unrecognized(_))),
                "{:?} should be unrecognized",
                line
            );
        }
    }

    #[test]
    fn test_parse_data_rset_quit_noop() {
        assert_eq!(SmtpCommand::parse("DATA").unwrap(), SmtpCommand::Data);
        assert_eq!(SmtpCommand::parse("rset").unwrap(), SmtpCommand::Rset);
        assert_eq!(SmtpCommand::parse("QUIT\r\n").unwrap(), SmtpCommand::Quit);
        assert_eq!(SmtpCommand::parse("NOOP hi").unwrap(), SmtpCommand::Noop);
        assert!(is_syntax("DATA now"));
    }

    #[test]
    fn test_not_implemented_and_vrfy() {
        assert_eq!(
            SmtpCommand::parse("HELP").unwrap(),
            SmtpCommand::NotImplemented(Verb::Help)
        );
        assert_eq!(
            SmtpCommand::parse("VRFY bob").unwrap(),
            SmtpCommand::Vrfy("bob".to_string())
        );
    }

    #[test]
    fn test_parse_mail_from() {
        let m = mail_from("MAIL FROM:<sender@example.com>");
        assert_eq!(m.path.raw, "sender@example.com");
        assert_eq!(m.size, None);

        let m = mail_from("mail from: <john@gmail.com> BODY=8BITMIME");
        assert_eq!(m.path.raw, "john@gmail.com");
        assert_eq!(m.body, Some(BodyType::EightBitMime));

        let m = mail_from("MAIL FROM:<john@gmail.com> SIZE=1024");
        assert_eq!(m.size, Some(1024));

        let m = mail_from("MAIL FROM : < john@gmail.com>");
        assert_eq!(m.path.address.domain, "gmail.com");
    }

    #[test]
    fn test_mail_from_quoted_and_escaped() {
        assert_eq!(
            mail_from("MAIL FROM:<host!host!user/data@foo.com>").path.raw,
            "host!host!user/data@foo.com"
        );
        assert_eq!(
            mail_from("MAIL FROM:<\"first last\"@space.com>").path.raw,
            "\"first last\"@space.com"
        );
        assert_eq!(
            mail_from("MAIL FROM:<user\\@internal@external.com>").path.raw,
            "user\\@internal@external.com"
        );
        assert_eq!(
            mail_from("MAIL FROM:<user\\>name@host.com>").path.raw,
            "user\\>name@host.com"
        );
        assert_eq!(
            mail_from("MAIL FROM:<\"user>name\"@host.com>").path.raw,
            "\"user>name\"@host.com"
        );
        assert_eq!(
            mail_from("MAIL FROM:<\"user@internal\"@external.com>").path.address.local,
            "user@internal"
        );
    }

    #[test]
    fn test_mail_from_bare_address_needs_space_after_colon() {
        assert_eq!(mail_from("MAIL FROM: john@gmail.com").path.raw, "john@gmail.com");
        assert!(is_syntax("MAIL FROM:john@gmail.com"));
        assert!(is_syntax("MAIL FROM john@gmail.com"));
    }

    #[test]
    fn test_mail_from_rejections() {
        for line in [
            "MAIL",
            "MAIL FROM",
            "MAIL FROM:<john@gmail.com",
            "MAIL FROM:<john@gmail.com> SIZE=147KB",
            "MAIL FROM: <john@gmail.com> SIZE147",
            "MAIL FROM:<john@gmail.com> BODY=BINARYMIME",
            "MAIL FROM:<first@last@gmail.com>",
            "MAIL FROM:<first last@gmail.com>",
            "MAIL FROM:<john@gmail.com>SIZE=10",
        ] {
            assert!(is_syntax(line), "{:?} should be a syntax error", line);
        }
    }

    #[test]
    fn test_mail_from_ignores_unknown_params() {
        let m = mail_from("MAIL FROM:<a@b.com> AUTH=<> SIZE=10");
        assert_eq!(m.size, Some(10));
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(rcpt_to("RCPT TO:<u1@gmail.com>").raw, "u1@gmail.com");
        assert_eq!(rcpt_to("RCPT TO: <u2@gmail.com>").raw, "u2@gmail.com");
        assert_eq!(rcpt_to("RCPT TO:u3@gmail.com").raw, "u3@gmail.com");
        assert_eq!(rcpt_to("RCPT TO: u4@gmail.com").raw, "u4@gmail.com");
        assert_eq!(
            rcpt_to("RCPT TO:<user\\@internal@external.com").address.local,
            "user@internal"
        );
        assert_eq!(
            rcpt_to("RCPT TO:<\"first last\"@host.com").address.local,
            "first last"
        );
        assert_eq!(rcpt_to("RCPT TO:<\"user>name\"@host.com>").address.local, "user>name");
    }

    #[test]
    fn test_rcpt_to_rejections() {
        for line in [
            "RCPT",
            "RCPT TO",
            "RCPT TO james@gmail.com",
            "RCPT TO:<first last@host.com>",
            "RCPT TO:<fred@fish@host.com",
        ] {
            assert!(is_syntax(line), "{:?} should be a syntax error", line);
        }
    }

    #[test]
    fn test_syntax_error_carries_verb() {
        match SmtpCommand::parse("RCPT TO") {
            Err(CommandError::Syntax { verb, .. }) => assert_eq!(verb, Verb::Rcpt),
            other => panic!("unexpected {:?}", other),
        }
    }
}
