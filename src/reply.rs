use std::fmt;

pub const SERVER_READY: i32 = 220;
pub const OK: i32 = 250;
pub const WAIT_INPUT: i32 = 334;
pub const AUTH_SUCCESS: i32 = 235;
pub const CONNECTION_CLOSE: i32 = 221;
pub const MAIL_START: i32 = 354;
pub const SERVICE_UNAVAILABLE: i32 = 421;
pub const AUTH_FAILED: i32 = 454;
pub const BAD_ARGUMENT: i32 = 501;
pub const UNKNOWN_COMMAND: i32 = 502;
pub const WRONG_SEQUENCE: i32 = 503;

pub const LINE_END: &str = "\r\n";

/// One logical SMTP reply. Multi-line replies are folded into a single value.
///
/// `Response::error()` is the sentinel for "no valid reply was obtained"
/// (timeout, malformed framing, closed connection). It never appears on the
/// wire and carries no text lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: i32,
    pub lines: Vec<String>,
}

impl Response {
    pub const ERROR_CODE: i32 = -1;

    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    /// Builds a reply spanning several wire lines. An empty `lines` yields a
    /// single empty text line so the reply stays well formed.
    pub fn multi<I, S>(code: i32, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut lines: Vec<String> = lines.into_iter().map(Into::into).collect();
        if lines.is_empty() {
            lines.push(String::new());
        }
        Self { code, lines }
    }

    pub fn error() -> Self {
        Self {
            code: Self::ERROR_CODE,
            lines: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.code == Self::ERROR_CODE
    }

    /// True only for a real reply carrying `code`; the sentinel never matches.
    pub fn is(&self, code: i32) -> bool {
        !self.is_error() && self.code == code
    }

    /// Wire form: `<code>-<text>` for every line but the last, `<code> <text>`
    /// for the last, each terminated by CRLF.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}{}", self.code, sep, line, LINE_END));
        }
        out
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_error() {
            return write!(f, "<no reply>");
        }
        write!(f, "{} {}", self.code, self.lines.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_wire_form() {
        assert_eq!(Response::new(OK, "Ok").to_wire(), "250 Ok\r\n");
    }

    #[test]
    fn multi_line_wire_form_uses_dash_until_last() {
        let reply = Response::multi(OK, ["S1", "AUTH LOGIN", "8BITMIME"]);
        assert_eq!(reply.to_wire(), "250-S1\r\n250-AUTH LOGIN\r\n250 8BITMIME\r\n");
    }

    #[test]
    fn sentinel_never_matches_a_code() {
        let sentinel = Response::error();
        assert!(sentinel.is_error());
        assert!(sentinel.lines.is_empty());
        assert!(!sentinel.is(Response::ERROR_CODE));
        assert!(!sentinel.is(SERVER_READY));
    }
}
