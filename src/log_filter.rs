//! Filters llama-server's stderr.
//!
//! Slot/server chatter and health-check request lines are dropped, prompt
//! processing progress is collapsed into one line rewritten in place with
//! `\r`, and everything else is forwarded unchanged.

use std::io::{self, Read, Write};
use std::thread::{self, JoinHandle};

use lazy_static::lazy_static;
use regex::Regex;

const READ_CHUNK_SIZE: usize = 4096;
const PROGRESS_MARKER: &str = "prompt processing";
const NOISE_PREFIXES: [&str; 2] = ["srv ", "slot "];
const HEALTH_REQUEST: &str = "log_server_r: request: GET /health";

lazy_static! {
    static ref PROGRESS_RE: Regex =
        Regex::new(r"slot update_slots: id.*progress = (\d+\.\d+)").unwrap();
}

/// Line reassembly state plus the "mid progress line" flag.
#[derive(Debug)]
pub struct LogFilter<W: Write> {
    out: W,
    buffer: Vec<u8>,
    last_was_progress: bool,
}

impl<W: Write> LogFilter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            buffer: Vec::new(),
            last_was_progress: false,
        }
    }

    /// Append raw bytes and handle every complete line. A trailing partial
    /// line stays buffered until the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..pos]);
            let line = line.trim_matches(|c: char| c == '\r' || c == '\n');
            if !line.is_empty() {
                // Write failures (closed stderr) must not stop draining the pipe
                let _ = self.handle_line(line);
            }
        }
    }

    fn handle_line(&mut self, line: &str) -> io::Result<()> {
        if let Some(caps) = PROGRESS_RE.captures(line) {
            let Ok(progress) = caps[1].parse::<f64>() else {
                return Ok(());
            };
            let display = line
                .find(PROGRESS_MARKER)
                .map(|idx| &line[idx..])
                .unwrap_or(line);

            let end = if progress < 1.0 { "\r" } else { "\n" };
            write!(self.out, "{display}{end}")?;
            self.out.flush()?;
            self.last_was_progress = progress < 1.0;
            return Ok(());
        }

        if is_noise(line) {
            return Ok(());
        }

        if self.last_was_progress {
            writeln!(self.out)?;
        }
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.last_was_progress = false;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn is_noise(line: &str) -> bool {
    NOISE_PREFIXES.iter().any(|p| line.starts_with(p)) || line.contains(HEALTH_REQUEST)
}

/// Pump `reader` through a filter until EOF or a read error, then drop it.
pub fn filter_stream<R: Read, W: Write>(mut reader: R, out: W) -> W {
    let mut filter = LogFilter::new(out);
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => filter.feed(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    drop(reader);
    filter.into_inner()
}

/// Run the filter on its own thread, writing to this process's stderr.
pub fn spawn_stderr_filter<R: Read + Send + 'static>(reader: R) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("llama-server-stderr".to_string())
        .spawn(move || {
            filter_stream(reader, io::stderr());
        })
}
