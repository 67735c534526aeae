use std::sync::Arc;

use matchday_core::services::Services;

use crate::error::AppError;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    /// Identifies this process in heartbeats and worker leases.
    pub worker_id: Arc<str>,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Self {
        let short = uuid::Uuid::new_v4().simple().to_string();
        Self {
            services,
            worker_id: Arc::from(format!("matchday-{}", &short[..8])),
        }
    }

    /// Run a store- or ledger-bound call on the blocking pool.
    pub async fn blocking<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&Services) -> matchday_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let services = self.services.clone();
        let result = tokio::task::spawn_blocking(move || f(&services))
            .await
            .map_err(AppError::join)??;
        Ok(result)
    }
}
