pub mod chat;

use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_MAX_MALFORMED_LINES: usize = 64;

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    /// Overall budget for one upstream call, including a streamed body.
    pub timeout: Duration,
    /// Consecutive unparseable NDJSON lines tolerated before a stream is abandoned.
    pub max_malformed_lines: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_malformed_lines: DEFAULT_MAX_MALFORMED_LINES,
        }
    }
}
