//! Newline-delimited JSON framing for upstream response bodies.

use log::debug;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;

use super::LlmError;

/// Upper bound on a single line; anything longer is treated as a broken stream.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A decoded NDJSON object that may carry an in-band error or mark the end of its stream.
pub trait UpstreamLine: DeserializeOwned + Send + 'static {
    fn upstream_error(&self) -> Option<&str>;
    fn is_final(&self) -> bool;
}

/// Reassembles lines from body chunks that split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    overflowed: bool,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LlmError> {
        if self.overflowed {
            return Err(overflow_error());
        }
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }

        if self.pending.len() > MAX_LINE_BYTES {
            self.pending.clear();
            self.overflowed = true;
            // complete lines from this read still go out; the overflow is reported next time
            if lines.is_empty() {
                return Err(overflow_error());
            }
        }
        Ok(lines)
    }

    /// Whatever trails the last newline once the body has ended.
    pub fn finish(&mut self) -> Result<Option<String>, LlmError> {
        if self.overflowed {
            return Err(overflow_error());
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.pending);
        Ok(Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string()))
    }
}

fn overflow_error() -> LlmError {
    LlmError::Protocol(format!("upstream line exceeds {} bytes", MAX_LINE_BYTES))
}

pub struct LineDecoder<T> {
    max_malformed: usize,
    malformed_run: usize,
    _line: PhantomData<fn() -> T>,
}

impl<T: UpstreamLine> LineDecoder<T> {
    pub fn new(max_malformed: usize) -> Self {
        Self {
            max_malformed,
            malformed_run: 0,
            _line: PhantomData,
        }
    }

    /// `Ok(None)` means the line carried nothing: blank, or malformed and skipped.
    pub fn decode(&mut self, line: &str) -> Result<Option<T>, LlmError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<T>(line) {
            Ok(item) => {
                self.malformed_run = 0;
                if let Some(err) = item.upstream_error() {
                    return Err(LlmError::Upstream(err.to_string()));
                }
                Ok(Some(item))
            }
            Err(e) => {
                self.malformed_run += 1;
                debug!("Skipping malformed upstream line ({}): {}", e, line);
                if self.malformed_run > self.max_malformed {
                    return Err(
                        LlmError::Protocol(
                            format!(
                                "gave up after {} consecutive malformed lines",
                                self.malformed_run
                            )
                        )
                    );
                }
                Ok(None)
            }
        }
    }
}
