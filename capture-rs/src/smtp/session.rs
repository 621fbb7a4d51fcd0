use crate::error::Result;
use crate::smtp::commands::{CommandError, EnvelopePath, SmtpCommand, Verb};
use crate::smtp::server::ServerContext;
use crate::storage::{Message, MessageWriter};
use crate::utils::{parse_email_address, EmailAddress};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum command line length including CRLF (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// DATA lines longer than this are read in pieces
const DATA_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for HELO/EHLO
    Greet,
    /// Greeted, no transaction open
    Ready,
    /// Sender accepted
    Mail,
    /// At least one recipient accepted
    Rcpt,
    /// Receiving message content
    Data,
    /// Connection is closing
    Quit,
}

impl SessionState {
    /// Verbs that may be issued in this state
    fn allows(self, verb: Verb) -> bool {
        match verb {
            Verb::Noop | Verb::Quit | Verb::Rset | Verb::Vrfy => true,
            Verb::Helo | Verb::Ehlo => self == SessionState::Greet,
            Verb::Mail => self == SessionState::Ready,
            Verb::Rcpt => matches!(self, SessionState::Mail | SessionState::Rcpt),
            Verb::Data => self == SessionState::Rcpt,
            Verb::Help | Verb::Expn | Verb::Send | Verb::Soml | Verb::Saml | Verb::Turn => true,
        }
    }
}

/// An accepted recipient
#[derive(Debug, Clone)]
struct Recipient {
    address: EmailAddress,
    /// Normalized address, the mailbox name
    mailbox: String,
    /// False for the no-store domain or when storage is turned off
    store: bool,
}

enum LineRead {
    Line,
    TooLong,
    Timeout,
    Eof,
}

/// How a DATA transfer ended
enum Transfer {
    Complete,
    TooLarge,
    StorageFailed,
    Disconnected,
    TimedOut,
}

/// One SMTP conversation. Owns its envelope; shares only the server context.
pub struct SmtpSession {
    ctx: Arc<ServerContext>,
    peer: Option<SocketAddr>,
    state: SessionState,
    helo_domain: Option<String>,
    from: Option<EnvelopePath>,
    recipients: Vec<Recipient>,
}

impl SmtpSession {
    pub fn new(ctx: Arc<ServerContext>, peer: Option<SocketAddr>) -> Self {
        Self {
            ctx,
            peer,
            state: SessionState::Greet,
            helo_domain: None,
            from: None,
            recipients: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn hostname(&self) -> &str {
        &self.ctx.config.server.hostname
    }

    fn idle(&self) -> Duration {
        self.ctx.config.smtp.max_idle()
    }

    /// Run the session until QUIT, disconnect or idle timeout
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let greeting = format!("220 {} ESMTP Service Ready", self.hostname());
        send(&mut reader, &greeting).await?;

        let mut line = Vec::new();
        while self.state != SessionState::Quit {
            match read_line(&mut reader, &mut line, MAX_LINE_LENGTH, self.idle()).await? {
                LineRead::Line => {}
                LineRead::TooLong => {
                    warn!("Command line too long, {} bytes read", line.len());
                    send(&mut reader, "500 5.5.2 Line too long").await?;
                    continue;
                }
                LineRead::Timeout => {
                    self.idle_timeout(&mut reader).await?;
                    break;
                }
                LineRead::Eof => {
                    debug!("Client disconnected in state {:?}", self.state);
                    break;
                }
            }

            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            debug!("Received: {}", text);
            self.dispatch(&text, &mut reader).await?;
        }

        reader.flush().await?;
        Ok(())
    }

    async fn dispatch<S>(&mut self, line: &str, io: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cmd = match SmtpCommand::parse(line) {
            Ok(cmd) => cmd,
            Err(CommandError::Unrecognized(_)) => {
                warn!("Unrecognized command: {:?}", line);
                return send(io, "500 5.5.2 Syntax error, command unrecognized").await;
            }
            Err(CommandError::Syntax { verb, reason }) => {
                if !self.state.allows(verb) {
                    return self.bad_sequence(verb, io).await;
                }
                warn!("Bad {} arguments: {}", verb.as_str(), reason);
                return send(io, &format!("501 5.5.4 {}", reason)).await;
            }
        };

        if !self.state.allows(cmd.verb()) {
            return self.bad_sequence(cmd.verb(), io).await;
        }

        match cmd {
            SmtpCommand::Helo(domain) => {
                info!("HELO from {}", domain);
                let reply = format!("250 {} Hello {}", self.hostname(), domain);
                self.greet(domain);
                send(io, &reply).await
            }
            SmtpCommand::Ehlo(domain) => {
                info!("EHLO from {}", domain);
                let reply = format!(
                    "250-{} Hello {}\r\n250-8BITMIME\r\n250 SIZE {}",
                    self.hostname(),
                    domain,
                    self.ctx.config.smtp.max_message_bytes
                );
                self.greet(domain);
                send(io, &reply).await
            }
            SmtpCommand::MailFrom(mail) => {
                if let Some(size) = mail.size {
                    debug!("Client declared message size {}", size);
                }
                info!("MAIL FROM: {}", mail.path.raw);
                self.from = Some(mail.path);
                self.recipients.clear();
                self.state = SessionState::Mail;
                send(io, "250 2.1.0 Ok").await
            }
            SmtpCommand::RcptTo(path) => self.handle_rcpt(path, io).await,
            SmtpCommand::Data => self.handle_data(io).await,
            SmtpCommand::Rset => {
                debug!("RSET in state {:?}", self.state);
                self.reset();
                send(io, "250 2.0.0 Ok").await
            }
            SmtpCommand::Noop => send(io, "250 2.0.0 Ok").await,
            SmtpCommand::Quit => {
                info!("QUIT");
                self.state = SessionState::Quit;
                let reply = format!("221 2.0.0 {} Service closing transmission channel", self.hostname());
                send(io, &reply).await
            }
            SmtpCommand::Vrfy(_) => send(io, "252 2.5.2 Cannot VRFY user, but will accept message").await,
            SmtpCommand::NotImplemented(verb) => {
                debug!("{} is not implemented", verb.as_str());
                send(io, "502 5.5.1 Command not implemented").await
            }
        }
    }

    async fn bad_sequence<W>(&self, verb: Verb, io: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        warn!("{} not allowed in state {:?}", verb.as_str(), self.state);
        send(io, "503 5.5.1 Bad sequence of commands").await
    }

    fn greet(&mut self, domain: String) {
        self.helo_domain = Some(domain);
        self.from = None;
        self.recipients.clear();
        self.state = SessionState::Ready;
    }

    /// Drop the envelope; a session that has not greeted yet stays in GREET
    fn reset(&mut self) {
        self.from = None;
        self.recipients.clear();
        if self.state != SessionState::Greet {
            self.state = SessionState::Ready;
        }
    }

    fn recipient(&self, address: EmailAddress) -> Recipient {
        let smtp = &self.ctx.config.smtp;
        let store = smtp.store_messages && !smtp.is_no_store(address.domain.trim_end_matches('.'));
        Recipient {
            mailbox: address.normalized(),
            address,
            store,
        }
    }

    async fn handle_rcpt<W>(&mut self, path: EnvelopePath, io: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let max = self.ctx.config.smtp.max_recipients;

        if let Some(members) = self.ctx.aliases.resolve_address(&path.address) {
            let mut expanded = Vec::with_capacity(members.len());
            for member in &members {
                match parse_email_address(member) {
                    Ok(address) => expanded.push(self.recipient(address)),
                    Err(e) => warn!("Skipping member {:?} of group {}: {}", member, path.raw, e),
                }
            }
            if expanded.is_empty() {
                return send(io, &format!("501 5.1.3 Group {} has no valid members", path.raw)).await;
            }
            if self.recipients.len() + expanded.len() > max {
                self.ctx.metrics.inc_recipients_rejected();
                warn!(
                    "Group {} ({} members) exceeds recipient limit {}",
                    path.raw,
                    expanded.len(),
                    max
                );
                return send(io, &format!("552 5.5.3 Maximum limit of {} recipients reached", max)).await;
            }

            info!("RCPT TO: {} expands to {} members", path.raw, expanded.len());
            self.recipients.extend(expanded);
            self.state = SessionState::Rcpt;
            return send(io, "250 2.1.5 Ok").await;
        }

        let domain = path.address.domain.trim_end_matches('.').to_string();
        if !self.ctx.config.smtp.accepts_domain(&domain) {
            self.ctx.metrics.inc_recipients_rejected();
            warn!("Refusing recipient {} for foreign domain", path.raw);
            return send(io, &format!("550 5.7.1 Relaying denied for {}", domain)).await;
        }
        if self.recipients.len() >= max {
            self.ctx.metrics.inc_recipients_rejected();
            warn!("Too many recipients: {}", self.recipients.len());
            return send(io, &format!("552 5.5.3 Maximum limit of {} recipients reached", max)).await;
        }

        info!("RCPT TO: {}", path.raw);
        let recipient = self.recipient(path.address);
        self.recipients.push(recipient);
        self.state = SessionState::Rcpt;
        send(io, "250 2.1.5 Ok").await
    }

    /// Open one writer per distinct mailbox that stores mail
    async fn open_writers(&self) -> Result<Vec<(String, Box<dyn MessageWriter>)>> {
        let mut writers: Vec<(String, Box<dyn MessageWriter>)> = Vec::new();
        for recipient in self.recipients.iter().filter(|r| r.store) {
            if writers.iter().any(|(name, _)| *name == recipient.mailbox) {
                continue;
            }
            let opened = async {
                let mailbox = self.ctx.store.mailbox_for(&recipient.mailbox).await?;
                let mut writer = mailbox.new_message().await?;
                writer.append(self.delivery_headers(recipient).as_bytes()).await?;
                Ok::<_, crate::error::MailError>(writer)
            }
            .await;

            match opened {
                Ok(writer) => writers.push((recipient.mailbox.clone(), writer)),
                Err(e) => {
                    discard_all(&mut writers).await;
                    return Err(e);
                }
            }
        }
        Ok(writers)
    }

    fn delivery_headers(&self, recipient: &Recipient) -> String {
        let sender = self.from.as_ref().map(|p| p.raw.as_str()).unwrap_or("");
        let helo = self.helo_domain.as_deref().unwrap_or("unknown");
        let peer = self
            .peer
            .map(|p| p.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "Return-Path: <{}>\r\nReceived: from {} ([{}]) by {}\r\n  for <{}>; {}\r\n",
            sender,
            helo,
            peer,
            self.hostname(),
            recipient.address,
            Utc::now().to_rfc2822()
        )
    }

    async fn handle_data<S>(&mut self, io: &mut BufReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut writers = match self.open_writers().await {
            Ok(writers) => writers,
            Err(e) => {
                error!("Failed to open message for delivery: {}", e);
                self.reset();
                return send(io, "451 4.3.0 Failed to store message").await;
            }
        };

        self.state = SessionState::Data;
        send(io, "354 Start mail input; end with <CRLF>.<CRLF>").await?;

        let transfer = self.receive_data(io, &mut writers).await?;
        match transfer {
            Transfer::Complete => {}
            Transfer::TooLarge => {
                self.reset();
                let max = self.ctx.config.smtp.max_message_bytes;
                return send(io, &format!("552 5.3.4 Maximum message size of {} bytes exceeded", max)).await;
            }
            Transfer::StorageFailed => {
                self.reset();
                return send(io, "451 4.3.0 Failed to store message").await;
            }
            Transfer::Disconnected => {
                warn!("Client disconnected during DATA");
                self.state = SessionState::Quit;
                return Ok(());
            }
            Transfer::TimedOut => {
                self.state = SessionState::Quit;
                return self.idle_timeout(io).await;
            }
        }

        let mut sealed: Vec<Arc<dyn Message>> = Vec::with_capacity(writers.len());
        let mut failed = false;
        for (name, writer) in writers.iter_mut() {
            if failed {
                discard(name, writer).await;
                continue;
            }
            match writer.close().await {
                Ok(message) => sealed.push(message),
                Err(e) => {
                    error!("Failed to seal message for {}: {}", name, e);
                    discard(name, writer).await;
                    failed = true;
                }
            }
        }

        if failed {
            for message in sealed {
                if let Err(e) = message.delete().await {
                    warn!("Failed to roll back message {}: {}", message.id(), e);
                }
            }
            self.reset();
            return send(io, "451 4.3.0 Failed to store message").await;
        }

        let queue_id = Uuid::new_v4().simple().to_string();
        info!(
            "Message {} accepted for {} recipients ({} stored)",
            queue_id,
            self.recipients.len(),
            sealed.len()
        );
        self.ctx.metrics.inc_messages_accepted();
        self.reset();
        send(io, &format!("250 2.0.0 Ok: queued as {}", queue_id)).await
    }

    /// Read DATA lines up to the terminator, unstuffing leading dots.
    ///
    /// After a size or storage failure the writers are discarded and the rest
    /// of the content is read and dropped, so the client sees a single reply.
    async fn receive_data<R>(
        &self,
        reader: &mut R,
        writers: &mut Vec<(String, Box<dyn MessageWriter>)>,
    ) -> Result<Transfer>
    where
        R: AsyncBufRead + Unpin,
    {
        let max = self.ctx.config.smtp.max_message_bytes;
        let mut size = 0usize;
        let mut outcome = Transfer::Complete;
        let mut line = Vec::new();
        let mut line_start = true;

        loop {
            let read = read_line(reader, &mut line, DATA_CHUNK, self.idle()).await?;
            let complete_line = line.ends_with(b"\n");
            match read {
                LineRead::Line | LineRead::TooLong => {}
                LineRead::Timeout => {
                    discard_all(writers).await;
                    return Ok(Transfer::TimedOut);
                }
                LineRead::Eof => {
                    discard_all(writers).await;
                    return Ok(Transfer::Disconnected);
                }
            }

            let mut content: &[u8] = &line;
            if line_start {
                if content == b".\r\n" || content == b".\n" {
                    break;
                }
                if content.starts_with(b".") {
                    content = &content[1..];
                }
            }
            line_start = complete_line;

            if !matches!(outcome, Transfer::Complete) {
                continue;
            }

            size += content.len();
            if size > max {
                warn!("Message too large: over {} bytes", max);
                discard_all(writers).await;
                outcome = Transfer::TooLarge;
                continue;
            }

            for (name, writer) in writers.iter_mut() {
                if let Err(e) = writer.append(content).await {
                    error!("Failed to write message for {}: {}", name, e);
                    outcome = Transfer::StorageFailed;
                    break;
                }
            }
            if matches!(outcome, Transfer::StorageFailed) {
                discard_all(writers).await;
            }
        }

        debug!("End of DATA, {} bytes", size);
        Ok(outcome)
    }

    async fn idle_timeout<W>(&mut self, io: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        warn!("Idle timeout after {:?}, disconnecting", self.idle());
        self.state = SessionState::Quit;
        let reply = format!("421 4.4.2 {} Idle timeout, closing connection", self.hostname());
        send(io, &reply).await
    }
}

/// Write one reply (possibly multi-line) terminated by CRLF
async fn send<W>(io: &mut W, reply: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!("Sending: {}", reply);
    io.write_all(reply.as_bytes()).await?;
    io.write_all(b"\r\n").await?;
    io.flush().await?;
    Ok(())
}

/// Read up to `limit` bytes or the end of a line, whichever comes first.
///
/// For command lines (`limit == MAX_LINE_LENGTH`) the rest of an oversized
/// line is consumed and `TooLong` returned; for DATA the partial line is
/// handed back and the caller keeps reading.
async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize, idle: Duration) -> Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = timeout(idle, (&mut *reader).take(limit as u64 + 1).read_until(b'\n', buf)).await;
    let n = match read {
        Ok(n) => n?,
        Err(_) => return Ok(LineRead::Timeout),
    };
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if buf.len() <= limit {
        return Ok(LineRead::Line);
    }
    if limit != MAX_LINE_LENGTH {
        return Ok(LineRead::TooLong);
    }

    // Consume the remainder of the command line
    let mut rest = Vec::new();
    while !buf.ends_with(b"\n") && !rest.ends_with(b"\n") {
        rest.clear();
        let read = timeout(idle, (&mut *reader).take(limit as u64).read_until(b'\n', &mut rest)).await;
        match read {
            Ok(Ok(0)) => return Ok(LineRead::Eof),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(LineRead::Timeout),
        }
    }
    Ok(LineRead::TooLong)
}

async fn discard(name: &str, writer: &mut Box<dyn MessageWriter>) {
    if let Err(e) = writer.discard().await {
        warn!("Failed to discard message for {}: {}", name, e);
    }
}

async fn discard_all(writers: &mut Vec<(String, Box<dyn MessageWriter>)>) {
    for (name, writer) in writers.iter_mut() {
        discard(name, writer).await;
    }
    writers.clear();
}
