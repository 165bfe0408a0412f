mod daemon;

use smtp_simulator::client::{ClientStep, SmtpClient};
use smtp_simulator::config::{ClientConfig, Credentials, ServerConfig};
use smtp_simulator::envelope::Envelope;
use smtp_simulator::export;
use smtp_simulator::mailbox::Mailbox;
use smtp_simulator::server::SmtpServer;
use smtp_simulator::utils::Logger;

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-simulator",
    about = "A miniature SMTP client and server for exercising the SMTP dialogue",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub enum Opt {
    /// Run the SMTP server until Ctrl+C
    Serve(ServeOpt),
    /// Connect to a server and send one mail
    Send(SendOpt),
}

#[derive(Debug, StructOpt, Clone)]
pub struct LogOpt {
    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - display SMTP details
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered)
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,
}

#[derive(Debug, StructOpt, Clone)]
pub struct AuthOpt {
    /// AUTH LOGIN username (requires --password)
    #[structopt(long = "user")]
    pub user: Option<String>,

    /// AUTH LOGIN password (requires --user)
    #[structopt(long = "password")]
    pub password: Option<String>,
}

impl AuthOpt {
    fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Ok(Some(Credentials::new(user, password))),
            (None, None) => Ok(None),
            _ => bail!("--user and --password must be given together"),
        }
    }
}

#[derive(Debug, StructOpt, Clone)]
pub struct ServeOpt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// PID file written in daemon mode
    #[structopt(long = "pid-file", parse(from_os_str), default_value = "/tmp/smtp-simulator.pid")]
    pub pid_file: PathBuf,

    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    /// Server name used in the greeting and HELO/EHLO replies
    #[structopt(long = "name", default_value = "smtp.local")]
    pub name: String,

    #[structopt(flatten)]
    pub auth: AuthOpt,

    /// Directory to save delivered mail as .eml files
    #[structopt(long = "data", parse(from_os_str))]
    pub data_dir: Option<PathBuf>,

    /// Maximum connections per minute from same IP
    #[structopt(long = "max-connections")]
    pub max_connections_per_minute: Option<usize>,

    /// Banner delay in milliseconds
    #[structopt(long = "banner-delay", default_value = "0")]
    pub banner_delay: u64,

    /// Seconds to wait for each command line
    #[structopt(long = "command-timeout", default_value = "20")]
    pub command_timeout: u64,

    #[structopt(flatten)]
    pub log: LogOpt,
}

#[derive(Debug, StructOpt, Clone)]
pub struct SendOpt {
    /// Server address
    #[structopt(short = "a", long = "address", default_value = "127.0.0.1")]
    pub address: String,

    /// Server port
    #[structopt(short = "p", long = "port", default_value = "25")]
    pub port: u16,

    #[structopt(flatten)]
    pub auth: AuthOpt,

    /// Sender address
    #[structopt(long = "from")]
    pub from: String,

    /// Recipient address
    #[structopt(long = "to")]
    pub to: String,

    #[structopt(long = "subject", default_value = "")]
    pub subject: String,

    #[structopt(long = "body", default_value = "")]
    pub body: String,

    /// Seconds to wait for each server reply
    #[structopt(long = "reply-timeout", default_value = "10")]
    pub reply_timeout: u64,

    #[structopt(flatten)]
    pub log: LogOpt,
}

fn logger(opt: &LogOpt) -> Result<Arc<Logger>> {
    Ok(Arc::new(Logger::new(
        opt.log_file.clone(),
        opt.raw_display,
        opt.verbose,
    )?))
}

async fn serve(opt: ServeOpt) -> Result<()> {
    let logger = logger(&opt.log)?;
    let mailbox = Mailbox::new();

    if let Some(data_dir) = &opt.data_dir {
        if !data_dir.exists() {
            std::fs::create_dir_all(data_dir)?;
            eprintln!("[INFO] Created data directory: {:?}", data_dir);
        }
        tokio::spawn(export::export_mails(
            mailbox.subscribe(),
            data_dir.clone(),
            logger.clone(),
        ));
    }

    let mut config = ServerConfig::new(opt.name.clone())
        .address(opt.address.clone())
        .port(opt.port)
        .banner_delay(Duration::from_millis(opt.banner_delay))
        .command_timeout(Duration::from_secs(opt.command_timeout));
    if let Some(credentials) = opt.auth.credentials()? {
        config = config.credentials(credentials);
    }
    if let Some(max) = opt.max_connections_per_minute {
        config = config.max_connections_per_minute(max);
    }

    let handle = SmtpServer::new(config, mailbox.clone(), logger)?.start().await?;

    println!("[INFO] SMTP server started");
    println!("[INFO] PID: {}", std::process::id());
    println!("[INFO] Listening on: {}", handle.local_addr());
    println!("[INFO] Server name: {}", opt.name);
    println!("[INFO] Authentication required: {}", opt.auth.user.is_some());
    println!("[INFO] Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    handle.stop();
    handle.join().await;
    println!("[INFO] Server stopped, {} mail(s) received", mailbox.len());
    Ok(())
}

async fn send(opt: SendOpt) -> Result<()> {
    let logger = logger(&opt.log)?;
    let reply_timeout = Duration::from_secs(opt.reply_timeout);

    let mut config = ClientConfig::new(opt.address.clone())
        .port(opt.port)
        .reply_timeout(reply_timeout);
    if let Some(credentials) = opt.auth.credentials()? {
        config = config.credentials(credentials);
    }

    // Every step may wait a full reply timeout.
    let budget = reply_timeout * 8;
    let client = SmtpClient::start(config, logger);

    let step = client.run_until(ClientStep::Ready, budget).await;
    if step != ClientStep::Ready {
        client.shutdown(reply_timeout * 2).await;
        bail!("session did not become ready (stopped at {})", step);
    }

    let envelope = Envelope::new(opt.from, opt.to, opt.subject, opt.body);
    let step = client.submit(&envelope, budget).await;
    client.shutdown(reply_timeout * 2).await;

    if step != ClientStep::Ready {
        bail!("mail was not accepted (stopped at {})", step);
    }
    println!("[INFO] Mail sent");
    Ok(())
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    if let Opt::Serve(serve_opt) = &opt {
        if serve_opt.daemon {
            daemon::daemonize(&serve_opt.pid_file)?;
        }
    }

    // The runtime is created after daemonizing so its threads survive the fork.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match opt {
            Opt::Serve(opt) => serve(opt).await,
            Opt::Send(opt) => send(opt).await,
        }
    })
}
