pub mod cli;
pub mod gateway;
pub mod history;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;

use cli::Args;
use gateway::ChatGateway;
use log::info;
use server::Server;
use std::error::Error;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Bind Address: {}", args.bind_addr());
    info!("Ollama Base URL: {}", args.ollama_base_url);
    info!("Upstream Timeout: {}s", args.upstream_timeout_secs);
    info!("History Store Type: {}", args.history_type);
    if args.history_type == "redis" {
        info!("History Store Host: {}", args.history_host);
        info!("History Key Prefix: {}", args.history_redis_prefix);
    }
    info!("Allowed Origins: {}", args.allowed_origins().join(", "));
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let gateway = ChatGateway::new(&args)?;
    gateway.report_upstream(&args.ollama_base_url).await;

    let server = Server::new(gateway, args);
    server.run().await?;

    Ok(())
}
