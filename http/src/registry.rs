//! Registry of configured downstream service clients.
//!
//! Services declare their downstreams once at startup and fetch clients by
//! name afterward. All clients built by one registry share the process-wide
//! breaker registry, the error aggregator and one connection pool, so two
//! call sites naming the same dependency always see the same breaker state.

use eventguard_core::ErrorAggregator;
use eventguard_runtime::CircuitBreakerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::client::{ServiceClient, ServiceClientConfig};
use crate::transport::{HttpTransport, ReqwestTransport};

/// Errors from service lookups.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The service was never registered and no environment configuration
    /// exists for it.
    #[error("No configuration for service '{0}'")]
    UnknownService(String),
}

/// Builds and caches one [`ServiceClient`] per named downstream.
pub struct ServiceRegistry {
    breakers: Arc<CircuitBreakerRegistry>,
    aggregator: Arc<ErrorAggregator>,
    transport: Arc<dyn HttpTransport>,
    configs: RwLock<HashMap<String, ServiceClientConfig>>,
    clients: RwLock<HashMap<String, ServiceClient>>,
}

impl ServiceRegistry {
    /// Create a registry over the production transport.
    #[must_use]
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, aggregator: Arc<ErrorAggregator>) -> Self {
        Self::with_transport(breakers, aggregator, Arc::new(ReqwestTransport::new()))
    }

    /// Create a registry over a custom transport. Used by tests.
    #[must_use]
    pub fn with_transport(
        breakers: Arc<CircuitBreakerRegistry>,
        aggregator: Arc<ErrorAggregator>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            breakers,
            aggregator,
            transport,
            configs: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or replace) the configuration for a named downstream.
    ///
    /// Replacing a configuration drops the cached client; the breaker keeps
    /// its state, since the dependency itself did not change.
    pub async fn register(&self, name: impl Into<String>, config: ServiceClientConfig) {
        let name = name.into();
        self.clients.write().await.remove(&name);
        self.configs.write().await.insert(name, config);
    }

    /// Get (or lazily build) the client for a named downstream.
    ///
    /// Falls back to [`ServiceClientConfig::from_env`] when the name was
    /// never registered.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownService`] when no configuration
    /// exists anywhere for the name.
    pub async fn client(&self, name: &str) -> Result<ServiceClient, RegistryError> {
        if let Some(client) = self.clients.read().await.get(name) {
            return Ok(client.clone());
        }

        let config = match self.configs.read().await.get(name) {
            Some(config) => config.clone(),
            None => ServiceClientConfig::from_env(name)
                .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?,
        };

        let breaker = self.breakers.breaker(name).await;
        let client = ServiceClient::with_transport(
            name,
            config,
            breaker,
            Arc::clone(&self.aggregator),
            Arc::clone(&self.transport),
        );
        self.clients
            .write()
            .await
            .insert(name.to_string(), client.clone());
        Ok(client)
    }

    /// Names of every registered downstream, sorted.
    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
