pub mod config;
pub mod health;
pub mod matches;
pub mod queues;
pub mod reconcile;
pub mod recover;
pub mod serve;

use anyhow::Context;
use matchday_core::config::Config;
use std::path::Path;

use crate::client::Client;

/// Client for the server named by `--server`, or by the config's `server`
/// section when not given.
pub fn remote(config_path: &Path, server: Option<&str>) -> anyhow::Result<Client> {
    if let Some(url) = server {
        return Ok(Client::new(url));
    }
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    Ok(Client::new(format!(
        "http://{}:{}",
        config.server.host, config.server.port
    )))
}
