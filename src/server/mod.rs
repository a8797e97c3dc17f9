pub mod api;

use crate::cli::Args;
use crate::gateway::ChatGateway;
use std::error::Error;

pub struct Server {
    gateway: ChatGateway,
    args: Args,
}

impl Server {
    pub fn new(gateway: ChatGateway, args: Args) -> Self {
        Self { gateway, args }
    }

    /// Serves until Ctrl-C or SIGTERM.
    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        api::start_http_server(&self.args, self.gateway.clone()).await
    }
}
