use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    Pending,
    Helo(String),
    Ehlo(String),
}

/// Envelope being assembled by MAIL FROM / RCPT TO, before DATA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Idle,
    MailFrom { from: String },
    RcptTo { from: String, to: String },
}

/// Per-connection protocol state of a server session.
pub struct SmtpSession {
    pub client_addr: SocketAddr,
    pub greeting: Greeting,
    pub authenticated: bool,
    pub transaction: Transaction,
}

impl SmtpSession {
    pub fn new(client_addr: SocketAddr) -> Self {
        Self {
            client_addr,
            greeting: Greeting::Pending,
            authenticated: false,
            transaction: Transaction::Idle,
        }
    }

    pub fn is_greeted(&self) -> bool {
        self.greeting != Greeting::Pending
    }

    /// Starts a new transaction, discarding any unfinished one.
    pub fn begin_mail(&mut self, from: String) {
        self.transaction = Transaction::MailFrom { from };
    }

    /// Sets the recipient. Fails when no sender is known yet.
    pub fn set_recipient(&mut self, to: String) -> bool {
        let from = match &self.transaction {
            Transaction::Idle => return false,
            Transaction::MailFrom { from } | Transaction::RcptTo { from, .. } => from.clone(),
        };
        self.transaction = Transaction::RcptTo { from, to };
        true
    }

    pub fn ready_for_data(&self) -> bool {
        matches!(self.transaction, Transaction::RcptTo { .. })
    }

    /// Hands out the completed sender/recipient pair and clears the transaction.
    pub fn take_envelope(&mut self) -> Option<(String, String)> {
        match std::mem::replace(&mut self.transaction, Transaction::Idle) {
            Transaction::RcptTo { from, to } => Some((from, to)),
            other => {
                self.transaction = other;
                None
            }
        }
    }
}
