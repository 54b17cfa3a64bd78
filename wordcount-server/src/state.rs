use crate::bigquery::BigQueryClient;
use crate::config::Config;
use crate::query::Warehouse;
use std::sync::Arc;
use tracing::{error, info};

/// The warehouse client, fixed at startup. `Unavailable` keeps the reason
/// construction failed so `/health` can report it.
#[derive(Clone)]
pub enum ClientHandle {
    Ready(Arc<dyn Warehouse>),
    Unavailable(String),
}

pub struct AppState {
    pub config: Config,
    pub client: ClientHandle,
}

impl AppState {
    pub fn new(config: Config, client: ClientHandle) -> Self {
        AppState { config, client }
    }

    /// Attempts to build the BigQuery client once. Failure degrades the
    /// service instead of aborting startup.
    pub async fn initialize(config: Config) -> Self {
        let client = match BigQueryClient::connect(&config.bigquery, config.query_timeout()).await {
            Ok(c) => {
                info!(project = %c.project(), "BigQuery client initialized successfully");
                ClientHandle::Ready(Arc::new(c))
            }
            Err(e) => {
                error!("Failed to initialize BigQuery client: {}", e);
                ClientHandle::Unavailable(e.to_string())
            }
        };
        Self::new(config, client)
    }

    pub fn warehouse(&self) -> Option<&dyn Warehouse> {
        match &self.client {
            ClientHandle::Ready(w) => Some(w.as_ref()),
            ClientHandle::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.warehouse().is_some()
    }
}
