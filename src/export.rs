use crate::envelope::Envelope;
use crate::utils::Logger;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::sync::mpsc;

/// Renders a delivered envelope as an `.eml` document.
pub fn render_eml(envelope: &Envelope) -> String {
    let mut content = String::new();
    content.push_str(&format!("X-Simulator-Date: {}\r\n", Local::now().format("%Y-%m-%d %H:%M:%S")));
    content.push_str(&format!("From: <{}>\r\n", envelope.from));
    content.push_str(&format!("To: <{}>\r\n", envelope.to));
    content.push_str(&format!("Subject: {}\r\n", envelope.subject));
    content.push_str("\r\n");
    content.push_str(&envelope.body);
    content
}

pub async fn save_eml(data_dir: &Path, sequence: u64, envelope: &Envelope) -> Result<PathBuf> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let filepath = data_dir.join(format!("{}_{}.eml", timestamp, sequence));
    tokio::fs::write(&filepath, render_eml(envelope))
        .await
        .with_context(|| format!("Failed to write {:?}", filepath))?;
    Ok(filepath)
}

/// Writes every envelope received on `mails` into `data_dir` until the
/// mailbox goes away.
pub async fn export_mails(mut mails: mpsc::UnboundedReceiver<Envelope>, data_dir: PathBuf, logger: Arc<Logger>) {
    let mut sequence = 0u64;
    while let Some(envelope) = mails.recv().await {
        sequence += 1;
        match save_eml(&data_dir, sequence, &envelope).await {
            Ok(path) => logger.log("mailbox", &format!("Email saved to: {:?}", path)).await,
            Err(e) => logger.log("mailbox", &format!("Failed to save email: {:#}", e)).await,
        }
    }
}
