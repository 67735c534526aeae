use anyhow::Context;
use matchday_core::config::{Config, WarnLevel};
use matchday_core::reporter::LoggingReporter;
use matchday_core::services::Services;
use matchday_core::session::MemorySessionSource;
use matchday_core::store::MemoryStore;
use std::path::Path;
use std::sync::Arc;

pub fn run(config_path: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let warnings = config.validate();
    for w in &warnings {
        match w.level {
            WarnLevel::Warning => tracing::warn!("config: {}", w.message),
            WarnLevel::Error => tracing::error!("config: {}", w.message),
        }
    }
    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("refusing to start with an invalid config");
    }

    let host = config.server.host.clone();
    let port = config.server.port;
    let services = Services::build(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemorySessionSource::new()),
        Arc::new(LoggingReporter),
    )
    .context("failed to open the scheduling ledger")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(matchday_server::serve(Arc::new(services), &host, port))
}
