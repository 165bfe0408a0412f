//! A miniature SMTP client and server pair.
//!
//! [`client::SmtpClient`] walks one outbound session through explicit steps
//! (greeting, optional AUTH LOGIN, mail transaction, QUIT) while a background
//! reader folds server replies into [`reply::Response`] values.
//! [`server::SmtpServer`] accepts connections and runs one session per
//! connection, delivering finished mail into a shared [`mailbox::Mailbox`].

pub mod client;
pub mod config;
pub mod data;
pub mod envelope;
pub mod export;
pub mod mailbox;
pub mod ratelimiter;
pub mod reader;
pub mod reply;
pub mod server;
pub mod session;
pub mod utils;
