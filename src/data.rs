//! DATA phase: collects message content up to the `CRLF.CRLF` terminator.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time;

const TERMINATOR: &[u8] = b"\r\n.\r\n";

// Longest proper prefix of TERMINATOR[..=i] that is also a suffix of it.
const FALLBACK: [usize; 5] = [0, 0, 0, 1, 2];

/// Incremental matcher for the DATA terminator.
///
/// Bytes that turn out not to be part of the terminator are released into the
/// body unchanged, so nothing is dropped or duplicated on a partial match.
#[derive(Debug, Default)]
pub struct DataScanner {
    matched: usize,
    body: Vec<u8>,
}

impl DataScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk. Returns `Some(n)` when the terminator ends at
    /// `chunk[n - 1]`; bytes after it are not consumed.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<usize> {
        for (i, &byte) in chunk.iter().enumerate() {
            while self.matched > 0 && byte != TERMINATOR[self.matched] {
                let keep = FALLBACK[self.matched - 1];
                self.body
                    .extend_from_slice(&TERMINATOR[..self.matched - keep]);
                self.matched = keep;
            }

            if byte == TERMINATOR[self.matched] {
                self.matched += 1;
                if self.matched == TERMINATOR.len() {
                    self.matched = 0;
                    return Some(i + 1);
                }
            } else {
                self.body.push(byte);
            }
        }
        None
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Reads DATA content until the terminator. Each wait for more input is
/// bounded by `idle_timeout`; EOF before the terminator is an error.
pub async fn read_data<R>(reader: &mut R, idle_timeout: Duration) -> io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut scanner = DataScanner::new();
    loop {
        let chunk = time::timeout(idle_timeout, reader.fill_buf())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DATA timed out"))??;
        if chunk.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during DATA",
            ));
        }

        match scanner.feed(chunk) {
            Some(used) => {
                reader.consume(used);
                return Ok(scanner.into_body());
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn scan(input: &[u8]) -> Option<(Vec<u8>, usize)> {
        let mut scanner = DataScanner::new();
        let used = scanner.feed(input)?;
        Some((scanner.into_body(), used))
    }

    #[test]
    fn stops_at_terminator() {
        let (body, used) = scan(b"hello\r\nworld\r\n.\r\nQUIT\r\n").unwrap();
        assert_eq!(body, b"hello\r\nworld");
        assert_eq!(used, 17);
    }

    #[test]
    fn no_terminator_means_no_end() {
        let cases: [&[u8]; 6] = [
            b"hello",
            b"a\rb",
            b"a\r\nb",
            b"a\r\n.b",
            b"a\r\n.\rb",
            b"line\r\n..\r\nmore\r\n",
        ];
        for case in cases {
            let mut scanner = DataScanner::new();
            assert_eq!(scanner.feed(case), None, "false end in {:?}", case);
        }
    }

    #[test]
    fn partial_matches_are_released_verbatim() {
        let bodies: [&[u8]; 7] = [
            b"a\rb",
            b"a\r\rb",
            b"a\r\nb",
            b"a\r\n.b",
            b"a\r\n.\rb",
            b"a\r\n.\r\r\nb",
            b"\r\r\r",
        ];
        for body in bodies {
            let mut input = body.to_vec();
            input.extend_from_slice(TERMINATOR);
            let (scanned, used) = scan(&input).unwrap();
            assert_eq!(scanned, body, "body changed for {:?}", body);
            assert_eq!(used, input.len());
        }
    }

    #[test]
    fn overlapping_start_is_still_found() {
        // "\r\n.\r" is broken by a CR that itself starts the real terminator.
        let (body, _) = scan(b"x\r\n.\r\r\n.\r\n").unwrap();
        assert_eq!(body, b"x\r\n.\r");

        let (body, _) = scan(b"x\r\r\n.\r\n").unwrap();
        assert_eq!(body, b"x\r");
    }

    #[test]
    fn terminator_split_across_chunks() {
        let mut scanner = DataScanner::new();
        assert_eq!(scanner.feed(b"body\r\n"), None);
        assert_eq!(scanner.feed(b"."), None);
        assert_eq!(scanner.feed(b"\r\nNEXT"), Some(2));
        assert_eq!(scanner.into_body(), b"body");
    }

    #[tokio::test]
    async fn read_data_leaves_following_commands_unread() {
        let mock = Builder::new()
            .read(b"Subject: x\r\n\r\nhel")
            .read(b"lo\r\n.\r\nQUIT\r\n")
            .build();
        let mut reader = tokio::io::BufReader::new(mock);

        let body = read_data(&mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(body, b"Subject: x\r\n\r\nhello");

        let mut rest = String::new();
        reader.read_line(&mut rest).await.unwrap();
        assert_eq!(rest, "QUIT\r\n");
    }

    #[tokio::test]
    async fn eof_before_terminator_is_an_error() {
        let mock = Builder::new().read(b"unfinished\r\n").build();
        let mut reader = tokio::io::BufReader::new(mock);
        let err = read_data(&mut reader, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
