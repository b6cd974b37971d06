//! Application startup and lifecycle management.
//!
//! Wires configuration into adapters, handlers and workers, binds the
//! listener, and runs until the shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;

use crate::adapters::catalog::StaticProductCatalog;
use crate::adapters::http::{app_router, BillingAppState};
use crate::adapters::memory::{InMemoryLedgerStore, InMemoryOperatorQueue};
use crate::adapters::postgres::{self, PostgresEventLog, PostgresLedgerStore, PostgresOperatorQueue};
use crate::adapters::stores::{
    AppStoreClient, AppStoreClientConfig, MobileStoreClient, MobileStoreClientConfig, RetryConfig,
    RetryingStoreClient, WebGatewayClient, WebGatewayClientConfig,
};
use crate::application::handlers::billing::{
    HandleStoreNotificationHandler, ProcessorConfig, Reconciler, TransactionProcessor,
};
use crate::application::workers::{
    spawn_worker, ExpirationSweepConfig, ExpirationSweepWorker, PeriodicWorker, ReconciliationWorker,
    ReconciliationWorkerConfig, WorkerHandle,
};
use crate::config::{AppConfig, StoreClientConfig, StoresConfig, ValidationError};
use crate::domain::billing::notification::{
    AppStoreNormalizer, AppStoreNormalizerConfig, JwsVerifier, MobileStoreNormalizer,
    MobileStoreNormalizerConfig, NotificationNormalizer, PinnedKeyVerifier, WebGatewayNormalizer,
};
use crate::domain::foundation::DomainError;
use crate::ports::{
    Clock, LedgerStore, OperatorQueue, ProductCatalog, StoreBillingClient, StoreClients,
    StoreError, SubscriptionEventLog, SystemClock,
};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ValidationError),

    #[error("database unavailable: {0}")]
    Database(#[from] sqlx::Error),

    #[error("product catalog: {0}")]
    Catalog(DomainError),

    #[error("store client: {0}")]
    StoreClient(#[from] StoreError),

    #[error("app store notification key: {0}")]
    NotificationKey(String),

    #[error("listener: {0}")]
    Io(#[from] std::io::Error),
}

/// The persistence ports, backed by one implementation.
struct Persistence {
    ledger: Arc<dyn LedgerStore>,
    event_log: Arc<dyn SubscriptionEventLog>,
    operator_queue: Arc<dyn OperatorQueue>,
}

/// A built service: listener bound, workers not yet started.
pub struct Application {
    listener: TcpListener,
    router: Router,
    workers: Vec<Arc<dyn PeriodicWorker>>,
}

impl Application {
    pub async fn build(config: AppConfig) -> Result<Self, StartupError> {
        config.validate()?;

        let catalog: Arc<dyn ProductCatalog> = Arc::new(
            StaticProductCatalog::load(&config.catalog.path)
                .await
                .map_err(StartupError::Catalog)?,
        );
        let persistence = persistence(&config).await?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let processor = Arc::new(TransactionProcessor::with_config(
            persistence.ledger.clone(),
            catalog.clone(),
            clock.clone(),
            ProcessorConfig {
                max_attempts: config.workers.processor_max_attempts,
                ..Default::default()
            },
        ));

        let clients = store_clients(&config.stores)?;
        let reconciler = Arc::new(Reconciler::new(processor.clone(), clients.clone(), catalog.clone()));

        let mut notifications = HandleStoreNotificationHandler::new(
            processor.clone(),
            reconciler.clone(),
            persistence.ledger.clone(),
            persistence.event_log.clone(),
            catalog,
            persistence.operator_queue.clone(),
        );
        for normalizer in normalizers(&config.stores)? {
            tracing::info!(store = %normalizer.store(), "Store webhook enabled");
            notifications = notifications.with_normalizer(normalizer);
        }

        let mut workers: Vec<Arc<dyn PeriodicWorker>> = Vec::new();
        if config.workers.reconciliation_enabled {
            workers.push(Arc::new(ReconciliationWorker::new(
                persistence.ledger.clone(),
                persistence.event_log.clone(),
                reconciler,
                clock,
                ReconciliationWorkerConfig {
                    interval: config.workers.reconciliation_interval(),
                    batch_size: config.workers.reconciliation_batch_size,
                    concurrency: config.workers.reconciliation_concurrency,
                },
            )));
        }
        if config.workers.sweep_enabled {
            workers.push(Arc::new(ExpirationSweepWorker::new(
                persistence.ledger.clone(),
                persistence.event_log.clone(),
                processor.clone(),
                ExpirationSweepConfig {
                    interval: config.workers.sweep_interval(),
                    batch_size: config.workers.sweep_batch_size,
                },
            )));
        }

        let state = BillingAppState {
            ledger: persistence.ledger,
            operator_queue: persistence.operator_queue,
            processor,
            clients,
            notifications: Arc::new(notifications),
        };
        let router = app_router(state, &config.server);

        let addr = config.server.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind listener");
            e
        })?;

        Ok(Self {
            listener,
            router,
            workers,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves, then stops the workers.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handles: Vec<WorkerHandle> = self.workers.into_iter().map(spawn_worker).collect();
        tracing::info!(addr = ?self.listener.local_addr().ok(), workers = handles.len(), "Billing service listening");

        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await;

        for handle in handles {
            handle.stop().await;
        }
        result
    }
}

async fn persistence(config: &AppConfig) -> Result<Persistence, StartupError> {
    match &config.database {
        Some(database) => {
            let pool = postgres::connect(database).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                e
            })?;
            tracing::info!(target = %database.display_target(), max_connections = database.max_connections, "Using PostgreSQL ledger");
            Ok(Persistence {
                ledger: Arc::new(
                    PostgresLedgerStore::new(pool.clone()).with_commit_timeout(database.commit_timeout()),
                ),
                event_log: Arc::new(PostgresEventLog::new(pool.clone())),
                operator_queue: Arc::new(PostgresOperatorQueue::new(pool)),
            })
        }
        None => {
            tracing::warn!("No database configured, using the in-memory ledger");
            let ledger = Arc::new(InMemoryLedgerStore::permissive());
            Ok(Persistence {
                ledger: ledger.clone(),
                event_log: ledger,
                operator_queue: Arc::new(InMemoryOperatorQueue::new()),
            })
        }
    }
}

fn retry_config(client: &StoreClientConfig) -> RetryConfig {
    RetryConfig {
        max_retries: client.max_retries,
        initial_backoff: client.initial_backoff(),
        max_backoff: client.max_backoff(),
        call_timeout: client.timeout(),
        ..Default::default()
    }
}

fn app_store_verifier(encoded: &str) -> Result<Arc<dyn JwsVerifier>, StartupError> {
    let verifier = PinnedKeyVerifier::from_base64_der(encoded)
        .map_err(|e| StartupError::NotificationKey(e.to_string()))?;
    Ok(Arc::new(verifier))
}

/// API clients for every configured store, each behind the retry decorator.
fn store_clients(stores: &StoresConfig) -> Result<StoreClients, StartupError> {
    let retry = retry_config(&stores.client);
    let timeout = stores.client.timeout();
    let mut built: Vec<Arc<dyn StoreBillingClient>> = Vec::new();

    if let Some(mobile) = &stores.mobile {
        built.push(Arc::new(MobileStoreClient::new(MobileStoreClientConfig {
            api_base_url: mobile.api_base_url.clone(),
            package_name: mobile.package_name.clone(),
            access_token: mobile.access_token.clone(),
            timeout,
        })?));
    }
    if let Some(app_store) = &stores.app_store {
        built.push(Arc::new(AppStoreClient::new(AppStoreClientConfig {
            api_base_url: app_store.api_base_url.clone(),
            bundle_id: app_store.bundle_id.clone(),
            issuer_id: app_store.issuer_id.clone(),
            key_id: app_store.key_id.clone(),
            private_key_pem: app_store.private_key_pem.clone(),
            verifier: app_store_verifier(&app_store.notification_public_key)?,
            timeout,
        })?));
    }
    if let Some(web) = &stores.web {
        built.push(Arc::new(WebGatewayClient::new(WebGatewayClientConfig {
            api_base_url: web.api_base_url.clone(),
            api_key: web.api_key.clone(),
            timeout,
        })?));
    }

    Ok(built.into_iter().fold(StoreClients::new(), |clients, client| {
        clients.with(Arc::new(RetryingStoreClient::new(client, retry.clone())))
    }))
}

fn normalizers(stores: &StoresConfig) -> Result<Vec<Arc<dyn NotificationNormalizer>>, StartupError> {
    let mut normalizers: Vec<Arc<dyn NotificationNormalizer>> = Vec::new();
    if let Some(mobile) = &stores.mobile {
        normalizers.push(Arc::new(MobileStoreNormalizer::new(MobileStoreNormalizerConfig {
            package_name: mobile.package_name.clone(),
            signing_key: mobile.signing_key.clone(),
        })));
    }
    if let Some(app_store) = &stores.app_store {
        normalizers.push(Arc::new(AppStoreNormalizer::new(AppStoreNormalizerConfig {
            bundle_id: app_store.bundle_id.clone(),
            verifier: app_store_verifier(&app_store.notification_public_key)?,
        })));
    }
    if let Some(web) = &stores.web {
        normalizers.push(Arc::new(WebGatewayNormalizer::new(web.webhook_secret.clone())));
    }
    Ok(normalizers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebGatewayConfig;
    use secrecy::SecretString;

    fn web_only() -> StoresConfig {
        StoresConfig {
            web: Some(WebGatewayConfig {
                api_base_url: "http://localhost:9".into(),
                api_key: SecretString::new("gk_test_1".into()),
                webhook_secret: SecretString::new("whsec_1".into()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_configured_stores_get_clients_and_normalizers() {
        let stores = web_only();
        let clients = store_clients(&stores).unwrap();
        assert!(clients.for_store(crate::domain::billing::Store::Web).is_some());
        assert!(clients.for_store(crate::domain::billing::Store::Mobile).is_none());

        let normalizers = normalizers(&stores).unwrap();
        assert_eq!(normalizers.len(), 1);
        assert_eq!(normalizers[0].store(), crate::domain::billing::Store::Web);
    }

    #[test]
    fn retry_settings_follow_client_config() {
        let client = StoreClientConfig {
            max_retries: 5,
            ..Default::default()
        };
        let retry = retry_config(&client);
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.call_timeout, client.timeout());
    }

    #[tokio::test]
    async fn missing_catalog_fails_startup() {
        let mut config = AppConfig::default();
        config.catalog.path = "does/not/exist.yaml".into();
        assert!(matches!(
            Application::build(config).await,
            Err(StartupError::Catalog(_))
        ));
    }
}
