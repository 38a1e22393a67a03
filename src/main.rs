mod backend;
mod cli;
mod cmd;
mod command;
mod config;
mod context;
mod entrypoint;
mod envs;
mod handoff;
mod logger;
mod mounts;
mod profiles;
mod statecache;
mod template;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "agentbox start");

    match cli::run() {
        Ok(result) => {
            info!("agentbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "agentbox failed");
            Err(err)
        }
    }
}
