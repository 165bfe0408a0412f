use chrono::Local;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps printable ASCII and whitespace only
pub fn filter_printable_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_graphic() || c.is_ascii_whitespace() || *c == '\t')
        .collect()
}

/// Escapes control characters and non-ASCII code points
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Append-only log sink shared by the client and every server session.
///
/// Lines from one origin keep their emission order; lines from different
/// origins may interleave.
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    raw_display: bool,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, raw_display: bool, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        } else {
            None
        };

        Ok(Self {
            writer,
            raw_display,
            verbose,
        })
    }

    /// Stdout only, no log file.
    pub fn stdout() -> Self {
        Self {
            writer: None,
            raw_display: false,
            verbose: false,
        }
    }

    pub async fn log(&self, origin: impl Display, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("{} {} {}\n", timestamp, origin, message);

        if self.raw_display {
            print!("{}", log_line);
        } else {
            print!("{}", filter_printable_chars(&log_line));
        }

        self.append(&log_line).await;
    }

    /// Logs `prefix` followed by a placeholder instead of a secret value.
    pub async fn log_redacted(&self, origin: impl Display, prefix: &str) {
        self.log(origin, &format!("{}(hidden)", prefix)).await;
    }

    pub async fn log_verbose(&self, origin: impl Display, title: &str, details: &str) {
        if !self.verbose {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let separator = "─".repeat(60);

        let display_details = if self.raw_display {
            details.to_string()
        } else {
            safe_log_string(details)
        };

        let verbose_log = format!(
            "{}\n{} VERBOSE: {} {}\n{}\n{}\n{}\n\n",
            separator, timestamp, origin, title, separator, display_details, separator
        );

        print!("{}", verbose_log);
        self.append(&verbose_log).await;
    }

    async fn append(&self, text: &str) {
        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(text.as_bytes());
            let _ = writer.flush();
        }
    }
}
