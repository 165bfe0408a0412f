//! Background reader turning the server's byte stream into [`Response`]s.
//!
//! Parsed replies are handed to the client driver through a [`ReplyQueue`],
//! which is guarded by its own lock and never touches the driver's step lock.

use crate::reply::Response;
use crate::utils::Logger;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Notify;
use tokio::time::{self, Instant};

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("malformed reply line: {0:?}")]
    Malformed(String),
    #[error("connection closed in the middle of a multi-line reply")]
    UnexpectedEof,
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Default)]
pub struct ReplyQueue {
    replies: Mutex<VecDeque<Response>>,
    available: Notify,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, reply: Response) {
        let mut replies = self.replies.lock().unwrap_or_else(PoisonError::into_inner);
        replies.push_back(reply);
        self.available.notify_waiters();
    }

    fn poll(&self) -> Option<Response> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Takes the next reply, waiting at most `budget` in total. Returns the
    /// sentinel when the budget runs out.
    pub async fn next(&self, budget: Duration) -> Response {
        let deadline = Instant::now() + budget;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reply) = self.poll() {
                return reply;
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                return self.poll().unwrap_or_else(Response::error);
            }
        }
    }
}

async fn next_line<R>(reader: &mut R, logger: &Logger, origin: &str) -> Result<Option<String>, ReplyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf)
        .trim_end_matches(&['\r', '\n'][..])
        .to_string();
    logger.log(origin, &line).await;
    Ok(Some(line))
}

/// Reads one logical reply. `Ok(None)` means the stream ended cleanly
/// between replies.
pub async fn read_reply<R>(reader: &mut R, logger: &Logger, origin: &str) -> Result<Option<Response>, ReplyError>
where
    R: AsyncBufRead + Unpin,
{
    let line = match next_line(reader, logger, origin).await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let space = line.find(' ');
    let dash = line.find('-');
    let (head_len, multi) = match (space, dash) {
        (None, None) => return Err(ReplyError::Malformed(line)),
        (None, Some(d)) => (d, true),
        (Some(s), Some(d)) if d < s => (d, true),
        (Some(s), _) => (s, false),
    };

    let head = &line[..head_len];
    let code: i32 = head
        .parse()
        .map_err(|_| ReplyError::Malformed(line.clone()))?;
    let mut lines = vec![line[head_len + 1..].to_string()];

    if multi {
        let last = format!("{} ", head);
        let more = format!("{}-", head);
        loop {
            let line = next_line(reader, logger, origin)
                .await?
                .ok_or(ReplyError::UnexpectedEof)?;
            if line.starts_with(&last) {
                lines.push(line[last.len()..].to_string());
                break;
            } else if line.starts_with(&more) {
                lines.push(line[more.len()..].to_string());
            } else {
                return Err(ReplyError::Malformed(line));
            }
        }
    }

    Ok(Some(Response { code, lines }))
}

/// Feeds replies into `queue` until the stream ends or misbehaves, then
/// pushes a final sentinel so the driver never waits forever.
pub async fn run<R>(mut reader: R, queue: Arc<ReplyQueue>, logger: Arc<Logger>, origin: String)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_reply(&mut reader, &logger, &origin).await {
            Ok(Some(reply)) => queue.offer(reply),
            Ok(None) => break,
            Err(e) => {
                logger.log(&origin, &format!("Reply reader stopped: {}", e)).await;
                break;
            }
        }
    }
    queue.offer(Response::error());
}
