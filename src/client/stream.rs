//! Cumulative text stream over a `/completion` server-sent-event body.

use std::io::{BufRead, BufReader, Read};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::error::{Result, ServerError};

const SSE_DATA_PREFIX: &str = "data: ";

/// Yields the full text generated so far after every non-empty chunk.
///
/// The stream borrows its client mutably, so one client never has two
/// generations in flight. The response body is released when the stream
/// ends, when the stop flag is seen, on a read error, or on drop,
/// whichever comes first.
pub struct CompletionStream<'a> {
    reader: Option<BufReader<Box<dyn Read + Send>>>,
    text: String,
    stop_flag: Arc<AtomicBool>,
    _client: PhantomData<&'a mut ()>,
}

impl CompletionStream<'_> {
    pub(crate) fn new(body: Box<dyn Read + Send>, stop_flag: Arc<AtomicBool>) -> Self {
        Self {
            reader: Some(BufReader::new(body)),
            text: String::new(),
            stop_flag,
            _client: PhantomData,
        }
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_none()
    }

    /// Release the response body. Later calls do nothing.
    pub fn close(&mut self) {
        self.reader.take();
    }

    fn read_line(&mut self) -> Option<std::io::Result<String>> {
        let reader = self.reader.as_mut()?;
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => None,
            Ok(_) => Some(Ok(String::from_utf8_lossy(&buf).into_owned())),
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for CompletionStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.is_closed() {
                return None;
            }
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("[CLIENT] Stop requested, closing stream");
                self.close();
                return None;
            }

            let line = match self.read_line() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(ServerError::Stream(e)));
                }
                None => {
                    self.close();
                    return None;
                }
            };

            let line = line.trim_end_matches(['\r', '\n']);
            let line = line.strip_prefix(SSE_DATA_PREFIX).unwrap_or(line);
            if line.trim().is_empty() {
                continue;
            }

            let data: Value = match serde_json::from_str(line) {
                Ok(data) => data,
                Err(e) => {
                    warn!("[CLIENT] JSON decode error: {e}; problematic line: {line}");
                    continue;
                }
            };

            let stop = data.get("stop").is_some_and(is_truthy);
            let content = data
                .get("content")
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty());

            if stop {
                self.close();
            }
            if let Some(content) = content {
                self.text.push_str(content);
                return Some(Ok(self.text.clone()));
            }
            if stop {
                return None;
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use std::sync::atomic::AtomicUsize;

    fn stream(body: &str) -> CompletionStream<'static> {
        CompletionStream::new(
            Box::new(Cursor::new(body.as_bytes().to_vec())),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_cumulative_text_until_stop() {
        let body = "data: {\"content\":\"He\"}\n\n\
                    data: {\"content\":\"llo\"}\n\n\
                    data: {\"content\":\"\",\"stop\":true}\n\n\
                    data: {\"content\":\"ignored\"}\n";
        let chunks: Vec<String> = stream(body).map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec!["He", "Hello"]);
    }

    #[test]
    fn test_trailing_content_on_stop_line_is_yielded() {
        let mut s = stream("{\"content\":\"Hi\"}\n{\"content\":\"!\",\"stop\":true}\n");
        assert_eq!(s.next().unwrap().unwrap(), "Hi");
        assert_eq!(s.next().unwrap().unwrap(), "Hi!");
        assert!(s.is_closed());
        assert!(s.next().is_none());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let body = "data: {\"content\":\"a\"}\n\
                    data: not json\n\
                    : keep-alive\n\
                    data: {\"content\":\"b\"}\n";
        let chunks: Vec<String> = stream(body).map(|c| c.unwrap()).collect();
        assert_eq!(chunks, vec!["a", "ab"]);
    }

    #[test]
    fn test_end_of_body_without_stop() {
        let mut s = stream("data: {\"content\":\"x\"}");
        assert_eq!(s.next().unwrap().unwrap(), "x");
        assert!(s.next().is_none());
        assert!(s.is_closed());
    }

    /// Counts how often the body is dropped.
    struct TrackedBody {
        inner: Cursor<Vec<u8>>,
        drops: Arc<AtomicUsize>,
    }

    impl Read for TrackedBody {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_flag_halts_and_releases_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let flag = Arc::new(AtomicBool::new(false));
        let body = TrackedBody {
            inner: Cursor::new(
                b"{\"content\":\"a\"}\n{\"content\":\"b\"}\n{\"content\":\"c\"}\n".to_vec(),
            ),
            drops: Arc::clone(&drops),
        };

        let mut s = CompletionStream::new(Box::new(body), Arc::clone(&flag));
        assert_eq!(s.next().unwrap().unwrap(), "a");

        flag.store(true, Ordering::SeqCst);
        assert!(s.next().is_none());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        s.close();
        assert!(s.next().is_none());
        drop(s);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    struct FailingBody;

    impl Read for FailingBody {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn test_read_error_is_reported_and_closes() {
        let mut s =
            CompletionStream::new(Box::new(FailingBody), Arc::new(AtomicBool::new(false)));
        assert!(matches!(s.next(), Some(Err(ServerError::Stream(_)))));
        assert!(s.next().is_none());
    }
}
