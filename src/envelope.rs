use std::fmt;

/// A mail as exchanged between the client, the server and the mailbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// The lines the client streams after `354`, excluding the final `.`.
    /// Body lines beginning with `.` are dot-stuffed.
    pub fn message_lines(&self) -> Vec<String> {
        let mut lines = vec![
            format!("From: <{}>", self.from),
            format!("To: <{}>", self.to),
            format!("Subject: {}", self.subject),
            "X-Mailer: smtp-simulator".to_string(),
            "MIME-Version: 1.0".to_string(),
            "Content-Type: text/plain; charset=\"utf-8\"".to_string(),
            String::new(),
        ];
        lines.push(dot_stuff(&self.body));
        lines
    }

    /// Rebuilds an envelope from the addresses given in MAIL FROM / RCPT TO
    /// and the raw DATA content (everything before the terminator).
    pub fn from_message(from: &str, to: &str, content: &str) -> Self {
        let (headers, body) = match content.find("\r\n\r\n") {
            Some(idx) => (&content[..idx], &content[idx + 4..]),
            None => ("", content),
        };

        let subject = headers
            .split("\r\n")
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("subject")
                    .then(|| value.strip_prefix(' ').unwrap_or(value).to_string())
            })
            .unwrap_or_default();

        Self {
            from: from.to_string(),
            to: to.to_string(),
            subject,
            body: dot_unstuff(body),
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mail from:{} to:{} subject:{}", self.from, self.to, self.subject)
    }
}

fn dot_stuff(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for (i, line) in body.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}

fn dot_unstuff(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    for (i, line) in body.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        if line.starts_with("..") {
            out.push_str(&line[1..]);
        } else {
            out.push_str(line);
        }
    }
    out
}
