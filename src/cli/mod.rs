use clap::Parser;
use std::time::Duration;

use crate::llm::LlmConfig;

const DEV_FRONTEND_URL: &str = "http://localhost:3000";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Server Args ---
    /// Host address for the HTTP server to bind to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP server.
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Browser origin of the web client; always allowed by CORS.
    #[arg(long, env = "FRONTEND_URL", default_value = DEV_FRONTEND_URL)]
    pub frontend_url: String,

    /// Extra comma-separated CORS origins. `*` allows any origin.
    #[arg(long, env = "CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    // --- Inference Service Args ---
    /// Base URL of the Ollama-compatible inference service.
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    pub ollama_base_url: String,

    /// Overall timeout in seconds for one upstream call. Generations can run for minutes.
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value = "600")]
    pub upstream_timeout_secs: u64,

    /// Consecutive unparseable stream lines tolerated before a generation is abandoned.
    #[arg(long, env = "MAX_MALFORMED_LINES", default_value = "64")]
    pub max_malformed_lines: usize,

    // --- History Store Args ---
    /// History chat store type (redis, memory)
    #[arg(long, env = "HISTORY_TYPE", default_value = "redis")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "chat:")]
    pub history_redis_prefix: String,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format) for serving HTTPS. Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format) for serving HTTPS. Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Frontend origin, the local dev origin, then any configured extras.
    pub fn allowed_origins(&self) -> Vec<String> {
        let mut origins = vec![self.frontend_url.clone()];
        if self.frontend_url != DEV_FRONTEND_URL {
            origins.push(DEV_FRONTEND_URL.to_string());
        }
        if let Some(extra) = &self.cors_origins {
            origins.extend(
                extra
                    .split(',')
                    .map(str::trim)
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
            );
        }
        origins
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.ollama_base_url.clone(),
            timeout: Duration::from_secs(self.upstream_timeout_secs),
            max_malformed_lines: self.max_malformed_lines,
        }
    }
}
