use crate::config::ServerConfig;
use crate::data;
use crate::envelope::Envelope;
use crate::mailbox::Mailbox;
use crate::ratelimiter::RateLimiter;
use crate::reply::{
    Response, AUTH_FAILED, AUTH_SUCCESS, BAD_ARGUMENT, CONNECTION_CLOSE, MAIL_START, OK,
    SERVER_READY, SERVICE_UNAVAILABLE, UNKNOWN_COMMAND, WAIT_INPUT, WRONG_SEQUENCE,
};
use crate::session::{Greeting, SmtpSession, Transaction};
use crate::utils::Logger;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

const EHLO_EXTENSIONS: [&str; 4] = ["AUTH LOGIN", "AUTH=LOGIN", "PIPELINING", "8BITMIME"];

pub struct SmtpServer {
    config: ServerConfig,
    mailbox: Mailbox,
    logger: Arc<Logger>,
    rate_limiter: Option<Arc<Mutex<RateLimiter>>>,
    mail_from: Regex,
    rcpt_to: Regex,
    address: Regex,
}

/// Running acceptor. Dropping the handle stops accepting as well.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listening socket. Sessions already running finish on their own.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub async fn join(self) {
        let _ = self.acceptor.await;
    }
}

enum Flow {
    Continue,
    Quit,
}

/// Blocking-style line I/O for one session, with the per-line timeout.
struct Conversation<R, W> {
    reader: R,
    writer: W,
    client_addr: SocketAddr,
    logger: Arc<Logger>,
    timeout: std::time::Duration,
}

impl<R, W> Conversation<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn read_line(&mut self) -> io::Result<String> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let read = time::timeout(self.timeout, self.reader.read_until(b'\n', &mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "command timed out"))??;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by client",
                ));
            }
            let line = String::from_utf8_lossy(&buf)
                .trim_end_matches(&['\r', '\n'][..])
                .to_string();
            if !line.is_empty() {
                return Ok(line);
            }
        }
    }

    async fn next_line(&mut self) -> io::Result<String> {
        let line = self.read_line().await?;
        self.logger.log(self.client_addr, &format!(">> {}", line)).await;
        Ok(line)
    }

    async fn next_secret(&mut self) -> io::Result<String> {
        let line = self.read_line().await?;
        self.logger.log_redacted(self.client_addr, ">> ").await;
        Ok(line)
    }

    async fn reply(&mut self, response: Response) -> io::Result<()> {
        let wire = response.to_wire();
        self.writer.write_all(wire.as_bytes()).await?;
        self.writer.flush().await?;
        for line in wire.lines() {
            self.logger.log(self.client_addr, &format!("<< {}", line)).await;
        }
        Ok(())
    }
}

fn split_command(line: &str) -> (String, &str) {
    let line = line.trim();
    match line.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

fn decode_credential(line: &str) -> Option<String> {
    let bytes = STANDARD.decode(line.trim()).ok()?;
    String::from_utf8(bytes).ok()
}

impl SmtpServer {
    pub fn new(config: ServerConfig, mailbox: Mailbox, logger: Arc<Logger>) -> Result<Self> {
        let rate_limiter = config
            .max_connections_per_minute
            .map(|max| Arc::new(Mutex::new(RateLimiter::new(max))));

        Ok(Self {
            config,
            mailbox,
            logger,
            rate_limiter,
            mail_from: Regex::new(r"(?i)^mail\s+from:\s*<(.*)>\s*$")?,
            rcpt_to: Regex::new(r"(?i)^rcpt\s+to:\s*<(.*)>\s*$")?,
            address: Regex::new(r"^(?-u:\w)+(?:\.(?-u:\w)+)*@(?-u:\w)+(?:\.(?-u:\w)+)+$")?,
        })
    }

    /// Binds the listening socket and spawns the accept loop.
    pub async fn start(self) -> Result<ServerHandle> {
        let addr = format!("{}:{}", self.config.address, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let local_addr = listener.local_addr()?;

        self.logger
            .log(local_addr, &format!("{} listening", self.config.name))
            .await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(Arc::new(self).run_acceptor(listener, shutdown_rx));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            acceptor,
        })
    }

    async fn run_acceptor(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let local_addr = listener.local_addr().ok();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        let this = self.clone();
                        tokio::spawn(async move {
                            this.handle_client(stream, client_addr).await;
                        });
                    }
                    Err(e) => {
                        self.logger
                            .log(self.origin(local_addr), &format!("Accept error: {}", e))
                            .await;
                    }
                }
            }
        }
        drop(listener);
        self.logger.log(self.origin(local_addr), "Listener closed").await;
    }

    fn origin(&self, local_addr: Option<SocketAddr>) -> String {
        local_addr.map_or_else(|| self.config.name.clone(), |addr| addr.to_string())
    }

    pub async fn handle_client(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Some(limiter) = &self.rate_limiter {
            let allowed = limiter.lock().await.check_and_add(client_addr.ip());
            if !allowed {
                let mut stream = stream;
                self.refuse(&mut stream, client_addr).await;
                return;
            }
        }

        self.logger.log(client_addr, "New connection").await;

        if !self.config.banner_delay.is_zero() {
            time::sleep(self.config.banner_delay).await;
        }

        let (reader, writer) = stream.into_split();
        if let Err(e) = self.serve(BufReader::new(reader), writer, client_addr).await {
            self.logger
                .log(client_addr, &format!("Session ended: {}", e))
                .await;
        }
        self.logger.log(client_addr, "Connection closed").await;
    }

    /// Answers 421 to a rate-limited client. Write failures are logged only.
    async fn refuse<W>(&self, writer: &mut W, client_addr: SocketAddr)
    where
        W: AsyncWrite + Unpin,
    {
        self.logger
            .log(client_addr, "Rate limit exceeded, connection refused")
            .await;
        let refusal = Response::new(SERVICE_UNAVAILABLE, "Too many connections from your IP");
        let sent = async {
            writer.write_all(refusal.to_wire().as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = sent.await {
            self.logger
                .log(client_addr, &format!("Error while refusing connection: {}", e))
                .await;
        }
    }

    /// Runs one SMTP session until QUIT or a fatal I/O condition.
    pub async fn serve<R, W>(&self, reader: R, writer: W, client_addr: SocketAddr) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut conv = Conversation {
            reader,
            writer,
            client_addr,
            logger: self.logger.clone(),
            timeout: self.config.command_timeout,
        };
        let mut session = SmtpSession::new(client_addr);

        let banner = format!("{} SMTP simulator ready", self.config.name);
        conv.reply(Response::new(SERVER_READY, banner)).await?;

        loop {
            let line = conv.next_line().await?;
            if let Flow::Quit = self.process_command(&line, &mut session, &mut conv).await? {
                return Ok(());
            }
        }
    }

    async fn process_command<R, W>(
        &self,
        line: &str,
        session: &mut SmtpSession,
        conv: &mut Conversation<R, W>,
    ) -> io::Result<Flow>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (verb, args) = split_command(line);

        let response = match verb.as_str() {
            "HELO" => {
                if args.is_empty() {
                    Response::new(BAD_ARGUMENT, "Syntax: HELO hostname")
                } else {
                    session.greeting = Greeting::Helo(args.to_string());
                    Response::new(OK, self.config.name.clone())
                }
            }

            "EHLO" => {
                if args.is_empty() {
                    Response::new(BAD_ARGUMENT, "Syntax: EHLO hostname")
                } else {
                    session.greeting = Greeting::Ehlo(args.to_string());
                    self.logger.log_verbose(session.client_addr, "EHLO", args).await;
                    let mut lines = vec![self.config.name.clone()];
                    lines.extend(EHLO_EXTENSIONS.iter().map(|ext| ext.to_string()));
                    Response::multi(OK, lines)
                }
            }

            "QUIT" => {
                conv.reply(Response::new(CONNECTION_CLOSE, "BYE")).await?;
                return Ok(Flow::Quit);
            }

            _ if !session.is_greeted() => {
                Response::new(WRONG_SEQUENCE, "Error: send HELO/EHLO first")
            }

            "AUTH" => {
                if !args.eq_ignore_ascii_case("login") {
                    Response::new(UNKNOWN_COMMAND, "Error: auth command not implemented")
                } else {
                    self.do_auth(session, conv).await?
                }
            }

            "MAIL" => self.do_mail(line, session).await,

            "RCPT" => self.do_rcpt(line, session).await,

            "DATA" => {
                if !session.ready_for_data() {
                    Response::new(WRONG_SEQUENCE, "Error: need RCPT command")
                } else {
                    conv.reply(Response::new(MAIL_START, "End data with <CR><LF>.<CR><LF>"))
                        .await?;
                    self.do_data(session, conv).await?
                }
            }

            _ => Response::new(UNKNOWN_COMMAND, "Error: command not implemented"),
        };

        conv.reply(response).await?;
        Ok(Flow::Continue)
    }

    async fn do_auth<R, W>(&self, session: &mut SmtpSession, conv: &mut Conversation<R, W>) -> io::Result<Response>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let failed = || Response::new(AUTH_FAILED, "Error: authentication failed");
        let credentials = self.config.credentials.as_ref();
        session.authenticated = false;

        conv.reply(Response::new(WAIT_INPUT, STANDARD.encode("Username:"))).await?;
        let username = decode_credential(&conv.next_line().await?);
        if username.is_none() || username.as_deref() != credentials.map(|c| c.username.as_str()) {
            return Ok(failed());
        }

        conv.reply(Response::new(WAIT_INPUT, STANDARD.encode("Password:"))).await?;
        let password = decode_credential(&conv.next_secret().await?);
        if password.is_none() || password.as_deref() != credentials.map(|c| c.password.as_str()) {
            return Ok(failed());
        }

        session.authenticated = true;
        Ok(Response::new(AUTH_SUCCESS, "Authentication successful"))
    }

    /// Validates the address captured by `pattern`, or explains why not.
    fn parse_address(&self, pattern: &Regex, line: &str, syntax: &str) -> Result<String, Response> {
        let address = pattern
            .captures(line.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .ok_or_else(|| Response::new(BAD_ARGUMENT, syntax))?;

        if !self.address.is_match(&address) {
            return Err(Response::new(BAD_ARGUMENT, "Bad address syntax"));
        }
        Ok(address)
    }

    async fn do_mail(&self, line: &str, session: &mut SmtpSession) -> Response {
        if self.config.needs_auth() && !session.authenticated {
            return Response::new(WRONG_SEQUENCE, "Error: need EHLO and AUTH first !");
        }

        match self.parse_address(&self.mail_from, line, "Syntax: MAIL FROM: <address>") {
            Ok(from) => {
                self.logger.log_verbose(session.client_addr, "MAIL FROM", &from).await;
                session.begin_mail(from);
                Response::new(OK, "Ok")
            }
            Err(response) => response,
        }
    }

    async fn do_rcpt(&self, line: &str, session: &mut SmtpSession) -> Response {
        if session.transaction == Transaction::Idle {
            return Response::new(WRONG_SEQUENCE, "Error: need MAIL command");
        }

        match self.parse_address(&self.rcpt_to, line, "Syntax: RCPT TO: <address>") {
            Ok(to) => {
                self.logger.log_verbose(session.client_addr, "RCPT TO", &to).await;
                session.set_recipient(to);
                Response::new(OK, "Ok")
            }
            Err(response) => response,
        }
    }

    async fn do_data<R, W>(&self, session: &mut SmtpSession, conv: &mut Conversation<R, W>) -> io::Result<Response>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let content = data::read_data(&mut conv.reader, self.config.command_timeout).await?;
        let content = String::from_utf8_lossy(&content);
        self.logger
            .log_verbose(session.client_addr, "EMAIL DATA", &content)
            .await;

        let (from, to) = match session.take_envelope() {
            Some(pair) => pair,
            None => return Ok(Response::new(WRONG_SEQUENCE, "Error: need RCPT command")),
        };
        let envelope = Envelope::from_message(&from, &to, &content);
        self.mailbox.deliver(&envelope);
        self.logger
            .log(session.client_addr, &format!("Delivered {}", envelope))
            .await;

        Ok(Response::new(OK, "Ok: queued"))
    }
}
