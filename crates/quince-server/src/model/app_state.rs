//! Application state shared by every HTTP handler

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use quince_common::EventPublisher;
use quince_config::{
    ConfigCacheConfig, ConfigCacheService, ConfigInfoRepository, ConfigQueryService, DumpService,
    FatalHandler, LocalDiskService, LongPollingConfig, LongPollingService,
};
use quince_control::{
    ConnectionControlManager, ConnectionControlRule, LocalDiskRuleStore, RuleStore,
    TpsControlManager,
};
use quince_core::{
    Configuration, ConnectionManager, DefaultConnectionEjector, EjectorConfig,
    RpcAckSynchronizer, start_ejector,
};

use super::constants::{CONFIG_EVENT_CAPACITY, CONFIG_LISTEN_POINT, CONFIG_PUBLISH_POINT};

pub struct AppState {
    pub configuration: Configuration,
    pub config_cache: Arc<ConfigCacheService>,
    pub config_query: Arc<ConfigQueryService>,
    pub dump_service: Arc<DumpService>,
    pub long_polling: Arc<LongPollingService>,
    pub tps_control: Arc<TpsControlManager>,
    pub connection_control: Arc<ConnectionControlManager>,
    pub connections: Arc<ConnectionManager>,
}

impl AppState {
    /// Wire every component. Nothing is spawned until [`AppState::start`].
    pub fn build(
        configuration: Configuration,
        repository: Arc<dyn ConfigInfoRepository>,
        fatal: Arc<dyn FatalHandler>,
    ) -> Self {
        let cache_config = ConfigCacheConfig::from_configuration(&configuration);
        let disk = Arc::new(LocalDiskService::new(cache_config.base_dir.clone()));
        let config_cache = Arc::new(ConfigCacheService::new(
            disk,
            fatal,
            EventPublisher::new(CONFIG_EVENT_CAPACITY),
            cache_config,
        ));

        let connection_control = Arc::new(ConnectionControlManager::new(
            ConnectionControlRule::default(),
        ));
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(RpcAckSynchronizer::new(
                configuration.ack_capacity_per_connection(),
            )),
            connection_control.clone(),
        ));
        let long_polling = Arc::new(LongPollingService::new(
            config_cache.clone(),
            connection_control.clone(),
            LongPollingConfig::from_configuration(&configuration),
        ));
        connection_control.register_collector(connections.clone());
        connection_control.register_collector(long_polling.clone());

        let tps_control = Arc::new(TpsControlManager::new(configuration.tps_control_config()));
        tps_control.register_point(CONFIG_LISTEN_POINT);
        tps_control.register_point(CONFIG_PUBLISH_POINT);

        Self {
            config_query: Arc::new(ConfigQueryService::new(
                config_cache.clone(),
                repository.clone(),
            )),
            dump_service: Arc::new(DumpService::new(config_cache.clone(), repository)),
            configuration,
            config_cache,
            long_polling,
            tps_control,
            connection_control,
            connections,
        }
    }

    /// Load rules and stored configs, then start the background tasks.
    pub async fn start(&self) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let store = LocalDiskRuleStore::new(self.configuration.control_rule_dir());
        if let Err(e) = self.tps_control.reload_rules(&store).await {
            warn!(error = %e, "Failed to load tps control rules");
        }
        match store.get_connection_rule().await {
            Ok(Some(rule)) => self.connection_control.apply_rule(rule),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to load connection control rule"),
        }

        self.dump_service.dump_all().await?;

        let ejector = Arc::new(DefaultConnectionEjector::new(
            self.connections.clone(),
            EjectorConfig::from_configuration(&self.configuration),
        ));
        let handles = vec![
            self.long_polling.clone().start_subscriber(),
            self.tps_control.clone().start_reporter(),
            start_ejector(
                ejector,
                Duration::from_millis(self.configuration.eject_interval_ms()),
            ),
        ];

        self.connections.mark_started();
        info!(configs = self.config_cache.len(), "Quince services started");
        Ok(handles)
    }
}
