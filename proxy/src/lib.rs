pub mod catalog;
pub mod config;
pub mod errors;
pub mod metrics_defs;
mod playlist;
mod proxy_service;
mod tokens;

#[cfg(test)]
mod testutils;

use catalog::{Catalog, ChannelCatalog};
use config::Config;
use errors::{ProxyError, StreamRequestError};
use metrics_defs::CONFIG_RELOADS;
use proxy_service::ProxyService;
use shared::admin_service::AdminService;
use shared::counter;
use shared::http::run_http_service;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use streamer::{ClientAttachment, HttpConnector, SessionRegistry, SourceConnector, SourceSpec};
use tokio::sync::mpsc;

pub use tokens::{TokenError, TokenSigner};

/// Shared state of the running relay.
pub struct Relay {
    catalog: ChannelCatalog,
    registry: SessionRegistry,
    // Suffix for generated anonymous user names
    next_anonymous: AtomicU64,
}

impl Relay {
    pub fn new(config: &Config) -> Result<Arc<Self>, ProxyError> {
        let connector = HttpConnector::new(
            std::time::Duration::from_secs(config.streamer.connect_timeout_secs),
            &config.streamer.user_agent,
        )?;
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(
        config: &Config,
        connector: Arc<dyn SourceConnector>,
    ) -> Result<Arc<Self>, ProxyError> {
        let catalog = Catalog::from_config(config)?;
        let registry = SessionRegistry::new(connector, &config.streamer);
        registry
            .admission()
            .configure(config.streamer.max_connections, catalog.limits());

        Ok(Arc::new(Relay {
            catalog: ChannelCatalog::new(catalog),
            registry,
            next_anonymous: AtomicU64::new(1),
        }))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Swaps in a new channel catalog. Running sessions keep their upstream
    /// and switch sources on their next reconnect; sessions of channels that
    /// disappeared are closed. Listeners and stream engine tuning stay as
    /// they were at startup.
    pub fn reload(&self, config: &Config) -> Result<(), ProxyError> {
        let catalog = Catalog::from_config(config)?;

        self.registry
            .admission()
            .configure(config.streamer.max_connections, catalog.limits());
        for channel in catalog.channels() {
            self.registry.update_spec(&channel.id, channel.spec.clone());
        }

        let current: HashSet<_> = catalog.channels().map(|c| c.id.clone()).collect();
        let old = self.catalog.replace(catalog);
        for channel in old.channels().filter(|c| !current.contains(&c.id)) {
            self.registry.close_channel(&channel.id);
        }

        counter!(CONFIG_RELOADS).increment(1);
        tracing::info!(channels = current.len(), "configuration reloaded");
        Ok(())
    }

    /// Attaches a client to a channel looked up in an earlier catalog
    /// snapshot. If a reload removed the channel in the meantime the client
    /// is turned away, and a session the attach may have brought back is
    /// closed again.
    pub(crate) async fn attach(
        &self,
        channel_id: &str,
        spec: Arc<SourceSpec>,
    ) -> Result<ClientAttachment, StreamRequestError> {
        let attachment = self.registry.attach(channel_id, spec).await?;

        // The catalog is replaced before removed channels are closed, so a
        // session created after that close is caught here.
        if self.catalog.snapshot().channel(channel_id).is_none() {
            drop(attachment);
            self.registry.close_channel(channel_id);
            return Err(StreamRequestError::ChannelRemoved(channel_id.to_string()));
        }

        Ok(attachment)
    }

    fn is_ready(&self) -> bool {
        !self.catalog.snapshot().is_empty()
    }

    fn status_json(&self) -> String {
        match serde_json::to_string(&self.registry.active_channels()) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "could not serialize status");
                "[]".into()
            }
        }
    }
}

/// Serves the relay until a listener fails. Configurations received on
/// `reloads` are applied as they arrive.
pub async fn run(config: Config, mut reloads: mpsc::Receiver<Config>) -> Result<(), ProxyError> {
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);
    shared::metrics_defs::describe_all(streamer::metrics_defs::ALL_METRICS);

    let relay = Relay::new(&config)?;

    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        ProxyService::new(relay.clone()),
    );

    let admin_relay = relay.clone();
    let status_relay = relay.clone();
    let admin_service: AdminService<_, _, ProxyError> = AdminService::new(
        move || admin_relay.is_ready(),
        move || status_relay.status_json(),
    );
    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin_service,
    );

    let reload_relay = relay.clone();
    let reload_task = async move {
        while let Some(config) = reloads.recv().await {
            if let Err(e) = reload_relay.reload(&config) {
                tracing::error!(error = %e, "configuration reload rejected");
            }
        }
        Ok::<(), ProxyError>(())
    };

    let result = tokio::try_join!(proxy_task, admin_task, reload_task);
    relay.registry.shutdown();
    result.map(|_| ())
}
