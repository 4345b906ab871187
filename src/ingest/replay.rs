use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::warn;

use super::event::Event;
use super::{EventSource, PollStatus};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("line {line}: reading input: {source}")]
    Io {
        line: u64,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: invalid event: {source}")]
    Parse {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
}

/// Parses one NDJSON line into an event. Invalid UTF-8 is a parse error.
pub fn parse_line(line: u64, bytes: &[u8]) -> Result<Event, ReplayError> {
    serde_json::from_slice(bytes).map_err(|source| ReplayError::Parse { line, source })
}

/// Replays newline-delimited JSON events. Blank lines are skipped;
/// malformed lines are counted, logged and skipped.
pub struct ReplaySource<R> {
    name: String,
    reader: R,
    line: u64,
    malformed: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl ReplaySource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("opening replay file {}", path.display()))?;
        Ok(Self::from_reader(path.display().to_string(), BufReader::new(file)))
    }
}

impl<R: BufRead> ReplaySource<R> {
    pub fn from_reader(name: impl Into<String>, reader: R) -> Self {
        Self {
            name: name.into(),
            reader,
            line: 0,
            malformed: 0,
            buf: Vec::new(),
            exhausted: false,
        }
    }

    fn next_event(&mut self) -> Result<Option<Event>, ReplayError> {
        loop {
            self.buf.clear();
            self.line += 1;
            let n = self
                .reader
                .read_until(b'\n', &mut self.buf)
                .map_err(|source| ReplayError::Io {
                    line: self.line,
                    source,
                })?;
            if n == 0 {
                return Ok(None);
            }
            let bytes = self.buf.trim_ascii();
            if bytes.is_empty() {
                continue;
            }
            match parse_line(self.line, bytes) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    self.malformed += 1;
                    warn!(source = %self.name, error = %e, "skipping malformed event");
                }
            }
        }
    }
}

impl<R: BufRead + Send> EventSource for ReplaySource<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self, max: usize, handler: &mut dyn FnMut(&Event)) -> Result<PollStatus> {
        if self.exhausted {
            return Ok(PollStatus::Exhausted);
        }
        let mut delivered = 0;
        while delivered < max {
            match self.next_event()? {
                Some(event) => {
                    handler(&event);
                    delivered += 1;
                }
                None => {
                    self.exhausted = true;
                    if delivered == 0 {
                        return Ok(PollStatus::Exhausted);
                    }
                    break;
                }
            }
        }
        Ok(PollStatus::Delivered(delivered))
    }

    fn malformed(&self) -> u64 {
        self.malformed
    }
}
