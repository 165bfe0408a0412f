//! Step-synchronized SMTP client.
//!
//! A driver task owns the current [`ClientStep`] behind the step lock and
//! performs exactly one step per wake-up. [`SmtpClient::advance`],
//! [`SmtpClient::send`] and [`SmtpClient::quit`] are best-effort nudges: they
//! only take effect when the step lock is free, i.e. while the driver is idle
//! waiting for a wake-up. A nudge that finds the driver busy is dropped and
//! the caller is expected to nudge again (see [`SmtpClient::run_until`]).

use crate::config::ClientConfig;
use crate::envelope::Envelope;
use crate::reader::{self, ReplyQueue};
use crate::reply::{
    Response, AUTH_SUCCESS, CONNECTION_CLOSE, LINE_END, MAIL_START, OK, SERVER_READY, WAIT_INPUT,
};
use crate::utils::Logger;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

const NUDGE_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStep {
    Connecting,
    Helo,
    Ehlo,
    Auth,
    AuthUser,
    AuthPassword,
    Ready,
    Quit,
    Stopped,
    MailFrom,
    RcptTo,
    Data,
}

impl fmt::Display for ClientStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },
    #[error("connection lost: {0}")]
    Io(#[from] std::io::Error),
    #[error("{step}: expected reply {expected}, got {got}")]
    ReplyMismatch {
        step: ClientStep,
        expected: i32,
        got: Response,
    },
    #[error("{0} has no active connection")]
    NotConnected(ClientStep),
    #[error("{0} has no mail to send")]
    NoMail(ClientStep),
}

fn expect(step: ClientStep, reply: &Response, expected: i32) -> Result<(), ClientError> {
    if reply.is(expected) {
        Ok(())
    } else {
        Err(ClientError::ReplyMismatch {
            step,
            expected,
            got: reply.clone(),
        })
    }
}

impl ClientStep {
    /// The step that follows `self` once `reply` was received for the command
    /// this step sent. Pure; a mismatch aborts the session.
    ///
    /// `needs_auth` selects the EHLO/AUTH path after the greeting.
    pub fn next(self, reply: &Response, needs_auth: bool) -> Result<ClientStep, ClientError> {
        use ClientStep::*;
        match self {
            Connecting => {
                expect(self, reply, SERVER_READY)?;
                Ok(if needs_auth { Ehlo } else { Helo })
            }
            Helo if reply.is_error() => Ok(Stopped),
            Helo => Ok(Ready),
            Ehlo => expect(self, reply, OK).map(|_| Auth),
            Auth => expect(self, reply, WAIT_INPUT).map(|_| AuthUser),
            AuthUser => expect(self, reply, WAIT_INPUT).map(|_| AuthPassword),
            AuthPassword => expect(self, reply, AUTH_SUCCESS).map(|_| Ready),
            MailFrom => expect(self, reply, OK).map(|_| RcptTo),
            RcptTo => expect(self, reply, OK).map(|_| Data),
            Data => expect(self, reply, OK).map(|_| Ready),
            Quit => Ok(Stopped),
            Ready | Stopped => Ok(self),
        }
    }
}

/// True when some `AUTH ...` line of an EHLO reply offers LOGIN.
pub fn advertises_login(ehlo: &Response) -> bool {
    ehlo.lines
        .iter()
        .map(|line| line.to_ascii_lowercase())
        .find(|line| line.starts_with("auth "))
        .map_or(false, |line| line.split_whitespace().any(|token| token == "login"))
}

struct StepState {
    step: ClientStep,
    mail: Option<Envelope>,
}

struct Shared {
    state: Mutex<StepState>,
    wake: Notify,
    steps: watch::Sender<ClientStep>,
    abandoned: AtomicBool,
}

impl Shared {
    fn publish(&self, step: ClientStep) {
        self.steps.send_replace(step);
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

/// Handle on one client session. Dropping it closes the connection once the
/// step in progress, if any, has finished.
pub struct SmtpClient {
    shared: Arc<Shared>,
    steps: watch::Receiver<ClientStep>,
    driver: Option<JoinHandle<()>>,
}

impl SmtpClient {
    /// Spawns the driver. Nothing happens on the wire until the first
    /// `advance()`.
    pub fn start(config: ClientConfig, logger: Arc<Logger>) -> Self {
        let (steps_tx, steps) = watch::channel(ClientStep::Connecting);
        let shared = Arc::new(Shared {
            state: Mutex::new(StepState {
                step: ClientStep::Connecting,
                mail: None,
            }),
            wake: Notify::new(),
            steps: steps_tx,
            abandoned: AtomicBool::new(false),
        });

        let driver = Driver {
            origin: format!("{}:{}", config.address, config.port),
            config,
            logger,
            shared: shared.clone(),
            connection: None,
            login_advertised: false,
        };

        Self {
            shared,
            steps,
            driver: Some(tokio::spawn(driver.run())),
        }
    }

    pub fn step(&self) -> ClientStep {
        *self.steps.borrow()
    }

    /// Wakes the driver if it is idle. Returns false when the nudge was dropped.
    pub fn advance(&self) -> bool {
        match self.shared.state.try_lock() {
            Ok(_state) => {
                self.shared.wake.notify_waiters();
                true
            }
            Err(_) => false,
        }
    }

    /// Queues a copy of `envelope` for delivery. Only honoured in `Ready`.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let mut state = match self.shared.state.try_lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        if state.step != ClientStep::Ready {
            return false;
        }
        state.step = ClientStep::MailFrom;
        state.mail = Some(envelope.clone());
        self.shared.publish(state.step);
        self.shared.wake.notify_waiters();
        true
    }

    pub fn quit(&self) -> bool {
        let mut state = match self.shared.state.try_lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        if state.step == ClientStep::Stopped {
            return false;
        }
        state.step = ClientStep::Quit;
        self.shared.publish(state.step);
        self.shared.wake.notify_waiters();
        true
    }

    /// Keeps nudging the driver until it reaches `target` or `Stopped`, or
    /// until `budget` runs out. Returns the step observed last.
    pub async fn run_until(&self, target: ClientStep, budget: Duration) -> ClientStep {
        let deadline = Instant::now() + budget;
        let mut steps = self.steps.clone();
        loop {
            let step = *steps.borrow_and_update();
            if step == target || step == ClientStep::Stopped || Instant::now() >= deadline {
                return step;
            }
            self.advance();
            let wait_until = (Instant::now() + NUDGE_INTERVAL).min(deadline);
            let _ = time::timeout_at(wait_until, steps.changed()).await;
        }
    }

    /// Hands `envelope` to the driver, retrying while the step lock is busy,
    /// then drives the transaction back to `Ready`. Returns the final step.
    pub async fn submit(&self, envelope: &Envelope, budget: Duration) -> ClientStep {
        let deadline = Instant::now() + budget;
        while !self.send(envelope) {
            let step = self.step();
            if step != ClientStep::Ready || Instant::now() >= deadline {
                return step;
            }
            time::sleep(NUDGE_INTERVAL).await;
        }
        self.run_until(ClientStep::Ready, deadline.saturating_duration_since(Instant::now()))
            .await
    }

    /// Requests QUIT (retrying while the step lock is busy), waits for the
    /// driver to stop and joins it.
    pub async fn shutdown(self, budget: Duration) -> ClientStep {
        let deadline = Instant::now() + budget;
        while !self.quit() && self.step() != ClientStep::Stopped && Instant::now() < deadline {
            time::sleep(NUDGE_INTERVAL).await;
        }
        let step = self
            .run_until(ClientStep::Stopped, deadline.saturating_duration_since(Instant::now()))
            .await;
        if step == ClientStep::Stopped {
            self.join().await;
        }
        step
    }

    /// Waits for the driver to exit.
    pub async fn join(mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for SmtpClient {
    fn drop(&mut self) {
        self.shared.abandoned.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }
}

struct Connection {
    writer: OwnedWriteHalf,
    replies: Arc<ReplyQueue>,
    reader: JoinHandle<()>,
}

struct Driver {
    config: ClientConfig,
    logger: Arc<Logger>,
    shared: Arc<Shared>,
    origin: String,
    connection: Option<Connection>,
    login_advertised: bool,
}

impl Driver {
    async fn run(mut self) {
        let shared = self.shared.clone();
        let mut state = shared.state.lock().await;
        self.logger
            .log(&self.origin, "Client ready, waiting to connect")
            .await;

        while state.step != ClientStep::Stopped {
            let wake = shared.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();
            if !shared.is_abandoned() {
                drop(state);
                wake.await;
                state = shared.state.lock().await;
            }

            if shared.is_abandoned() {
                self.logger
                    .log(&self.origin, "Client handle dropped, closing")
                    .await;
                state.step = ClientStep::Stopped;
            } else if let Err(e) = self.do_step(&mut state).await {
                self.logger
                    .log(&self.origin, &format!("Session aborted: {}", e))
                    .await;
                state.step = ClientStep::Stopped;
            }
            shared.publish(state.step);
        }

        state.mail = None;
        drop(state);
        self.close().await;
        self.logger.log(&self.origin, "Client exit").await;
    }

    async fn do_step(&mut self, state: &mut StepState) -> Result<(), ClientError> {
        let step = state.step;
        let needs_auth = self.config.needs_auth();

        let next = match step {
            ClientStep::Connecting => {
                self.connect().await?;
                let reply = self.next_reply().await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::Helo => {
                let line = format!("HELO {}", self.config.address);
                let reply = self.command(&line).await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::Ehlo => {
                let line = format!("EHLO {}", self.config.address);
                let reply = self.command(&line).await?;
                self.login_advertised = advertises_login(&reply);
                step.next(&reply, needs_auth)?
            }
            ClientStep::Auth => {
                if !self.login_advertised {
                    self.logger
                        .log(&self.origin, "Server does not offer AUTH LOGIN, stopping")
                        .await;
                    ClientStep::Stopped
                } else {
                    let reply = self.command("AUTH LOGIN").await?;
                    step.next(&reply, needs_auth)?
                }
            }
            ClientStep::AuthUser => {
                let username = self
                    .config
                    .credentials
                    .as_ref()
                    .map(|c| STANDARD.encode(c.username.as_bytes()))
                    .unwrap_or_default();
                let reply = self.command(&username).await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::AuthPassword => {
                let password = self
                    .config
                    .credentials
                    .as_ref()
                    .map(|c| STANDARD.encode(c.password.as_bytes()))
                    .unwrap_or_default();
                self.write_secret(&password).await?;
                let reply = self.next_reply().await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::Ready | ClientStep::Stopped => step,
            ClientStep::MailFrom => {
                let mail = state.mail.as_ref().ok_or(ClientError::NoMail(step))?;
                let line = format!("MAIL FROM: <{}>", mail.from);
                let reply = self.command(&line).await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::RcptTo => {
                let mail = state.mail.as_ref().ok_or(ClientError::NoMail(step))?;
                let line = format!("RCPT TO: <{}>", mail.to);
                let reply = self.command(&line).await?;
                step.next(&reply, needs_auth)?
            }
            ClientStep::Data => {
                let mail = state.mail.clone().ok_or(ClientError::NoMail(step))?;
                let reply = self.command("DATA").await?;
                expect(step, &reply, MAIL_START)?;
                for line in mail.message_lines() {
                    self.write_line(&line).await?;
                }
                self.write_line(".").await?;
                let reply = self.next_reply().await?;
                let next = step.next(&reply, needs_auth)?;
                self.logger.log_verbose(&self.origin, "SENT", &mail.to_string()).await;
                state.mail = None;
                next
            }
            ClientStep::Quit if self.connection.is_none() => ClientStep::Stopped,
            ClientStep::Quit => {
                let reply = self.command("QUIT").await?;
                if !reply.is(CONNECTION_CLOSE) {
                    self.logger
                        .log(&self.origin, &format!("Unexpected reply to QUIT: {}", reply))
                        .await;
                }
                step.next(&reply, needs_auth)?
            }
        };

        state.step = next;
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        let address = format!("{}:{}", self.config.address, self.config.port);
        let stream = match time::timeout(self.config.reply_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { address, source }),
            Err(_) => {
                return Err(ClientError::Connect {
                    address,
                    source: std::io::ErrorKind::TimedOut.into(),
                })
            }
        };
        self.logger.log(&self.origin, "Connected").await;

        let (read_half, writer) = stream.into_split();
        let replies = Arc::new(ReplyQueue::new());
        let reader = tokio::spawn(reader::run(
            BufReader::new(read_half),
            replies.clone(),
            self.logger.clone(),
            self.origin.clone(),
        ));

        self.connection = Some(Connection {
            writer,
            replies,
            reader,
        });
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut Connection, ClientError> {
        let step = *self.shared.steps.borrow();
        self.connection.as_mut().ok_or(ClientError::NotConnected(step))
    }

    async fn send_raw(&mut self, line: &str) -> Result<(), ClientError> {
        let connection = self.connection()?;
        connection.writer.write_all(line.as_bytes()).await?;
        connection.writer.write_all(LINE_END.as_bytes()).await?;
        connection.writer.flush().await?;
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), ClientError> {
        self.send_raw(line).await?;
        self.logger.log(&self.origin, &format!(">{}", line)).await;
        Ok(())
    }

    async fn write_secret(&mut self, secret: &str) -> Result<(), ClientError> {
        self.send_raw(secret).await?;
        self.logger.log_redacted(&self.origin, ">").await;
        Ok(())
    }

    async fn next_reply(&mut self) -> Result<Response, ClientError> {
        let budget = self.config.reply_timeout;
        let replies = self.connection()?.replies.clone();
        Ok(replies.next(budget).await)
    }

    async fn command(&mut self, line: &str) -> Result<Response, ClientError> {
        self.write_line(line).await?;
        self.next_reply().await
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.writer.shutdown().await {
                self.logger
                    .log(&self.origin, &format!("Error while closing connection: {}", e))
                    .await;
            }
            connection.reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::WRONG_SEQUENCE;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use ClientStep::*;

    async fn listen() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn client_for(port: u16, reply_timeout: Duration) -> SmtpClient {
        let config = ClientConfig::new("127.0.0.1")
            .port(port)
            .reply_timeout(reply_timeout);
        SmtpClient::start(config, Arc::new(Logger::stdout()))
    }

    fn ok(code: i32) -> Response {
        Response::new(code, "text")
    }

    #[test]
    fn only_220_leaves_connecting() {
        assert_eq!(Connecting.next(&ok(220), false).unwrap(), Helo);
        assert_eq!(Connecting.next(&ok(220), true).unwrap(), Ehlo);
        for reply in [ok(250), ok(421), ok(554), Response::error()] {
            assert!(matches!(
                Connecting.next(&reply, false),
                Err(ClientError::ReplyMismatch { step: Connecting, expected: 220, .. })
            ));
        }
    }

    #[test]
    fn helo_accepts_any_real_reply_and_stops_on_sentinel() {
        assert_eq!(Helo.next(&ok(250), false).unwrap(), Ready);
        assert_eq!(Helo.next(&ok(WRONG_SEQUENCE), false).unwrap(), Ready);
        assert_eq!(Helo.next(&Response::error(), false).unwrap(), Stopped);
    }

    #[test]
    fn auth_path_follows_expected_codes() {
        assert_eq!(Ehlo.next(&ok(250), true).unwrap(), Auth);
        assert_eq!(Auth.next(&ok(334), true).unwrap(), AuthUser);
        assert_eq!(AuthUser.next(&ok(334), true).unwrap(), AuthPassword);
        assert_eq!(AuthPassword.next(&ok(235), true).unwrap(), Ready);
        assert!(AuthPassword.next(&ok(454), true).is_err());
        assert!(Ehlo.next(&Response::error(), true).is_err());
    }

    #[test]
    fn mail_transaction_returns_to_ready() {
        assert_eq!(MailFrom.next(&ok(250), false).unwrap(), RcptTo);
        assert_eq!(RcptTo.next(&ok(250), false).unwrap(), Data);
        assert_eq!(Data.next(&ok(250), false).unwrap(), Ready);
        assert!(RcptTo.next(&ok(503), false).is_err());
    }

    #[test]
    fn quit_always_stops() {
        assert_eq!(Quit.next(&ok(221), false).unwrap(), Stopped);
        assert_eq!(Quit.next(&ok(500), false).unwrap(), Stopped);
        assert_eq!(Quit.next(&Response::error(), false).unwrap(), Stopped);
    }

    #[test]
    fn idle_steps_do_not_move() {
        assert_eq!(Ready.next(&ok(250), false).unwrap(), Ready);
        assert_eq!(Stopped.next(&Response::error(), false).unwrap(), Stopped);
    }

    #[test]
    fn login_detection_is_case_insensitive() {
        let ehlo = Response::multi(250, ["S1", "auth Plain Login", "PIPELINING"]);
        assert!(advertises_login(&ehlo));

        let ehlo = Response::multi(250, ["S1", "AUTH PLAIN", "AUTH=LOGIN"]);
        assert!(!advertises_login(&ehlo));

        let ehlo = Response::multi(250, ["S1", "8BITMIME"]);
        assert!(!advertises_login(&ehlo));
    }

    #[tokio::test]
    async fn quit_before_connecting_stops_without_io() {
        let client = SmtpClient::start(ClientConfig::new("127.0.0.1"), Arc::new(Logger::stdout()));
        // The driver may not be parked yet; keep trying until the nudge lands.
        while !client.quit() {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.step(), Quit);
        assert_eq!(client.run_until(Stopped, Duration::from_secs(5)).await, Stopped);
        client.join().await;
    }

    #[tokio::test]
    async fn refused_connection_ends_in_stopped() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig::new("127.0.0.1")
            .port(port)
            .reply_timeout(Duration::from_millis(500));
        let client = SmtpClient::start(config, Arc::new(Logger::stdout()));
        assert_eq!(client.step(), Connecting);

        let step = client.run_until(Ready, Duration::from_secs(5)).await;
        assert_eq!(step, Stopped);
        assert!(!client.send(&Envelope::default()));
        assert!(!client.quit());
        client.join().await;
    }

    #[tokio::test]
    async fn dropping_the_client_closes_the_connection() {
        let (listener, port) = listen().await;
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream.get_mut().write_all(b"220 peer ready\r\n").await.unwrap();
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line, "HELO 127.0.0.1\r\n");
            stream.get_mut().write_all(b"250 peer\r\n").await.unwrap();

            line.clear();
            time::timeout(Duration::from_secs(2), stream.read_line(&mut line)).await
        });

        let client = client_for(port, Duration::from_secs(5));
        assert_eq!(client.run_until(Ready, Duration::from_secs(5)).await, Ready);
        drop(client);

        let read = peer.await.unwrap().expect("connection still open after drop");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn nudge_while_busy_is_dropped() {
        let (listener, port) = listen().await;
        let (greet, greet_rx) = oneshot::channel::<()>();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            greet_rx.await.unwrap();
            stream.get_mut().write_all(b"220 peer ready\r\n").await.unwrap();

            // Nothing may arrive until the driver is nudged again.
            let mut line = String::new();
            let early = time::timeout(Duration::from_millis(300), stream.read_line(&mut line)).await;
            assert!(early.is_err(), "command sent without a nudge: {:?}", line);

            line.clear();
            stream.read_line(&mut line).await.unwrap();
            stream.get_mut().write_all(b"250 peer\r\n").await.unwrap();
            line
        });

        let client = client_for(port, Duration::from_secs(5));
        // The driver connects and then sits waiting for the greeting.
        assert_eq!(client.run_until(Ready, Duration::from_millis(200)).await, Connecting);
        assert!(!client.advance());
        assert_eq!(client.step(), Connecting);

        greet.send(()).unwrap();
        let mut steps = client.steps.clone();
        time::timeout(Duration::from_secs(5), steps.wait_for(|step| *step == Helo))
            .await
            .unwrap()
            .unwrap();
        time::sleep(Duration::from_millis(600)).await;
        assert_eq!(client.step(), Helo);

        assert_eq!(client.run_until(Ready, Duration::from_secs(5)).await, Ready);
        assert_eq!(peer.await.unwrap(), "HELO 127.0.0.1\r\n");
        assert_eq!(client.shutdown(Duration::from_secs(5)).await, Stopped);
    }
}
