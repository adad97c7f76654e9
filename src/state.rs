// 全局状态：存储后端与中继客户端，进程启动时装配一次。

use crate::config::Config;
use crate::relay::RelayClient;
use crate::storage::{build_storage, SqliteStorage, StorageBackend};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub relay: RelayClient,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let storage = init_storage(&config)?;
        let relay = RelayClient::new(config.relay.clone());
        Ok(Self {
            config,
            storage,
            relay,
        })
    }
}

fn init_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let backend = config.storage.backend.trim().to_lowercase();
    let backend = if backend.is_empty() {
        "sqlite".to_string()
    } else {
        backend
    };

    match backend.as_str() {
        "sqlite" | "default" | "memory" | "transient" => init_storage_strict(config),
        "postgres" | "postgresql" | "pg" => init_storage_strict(config).map_err(|err| {
            anyhow!(
                "Postgres 存储初始化失败: {err}（请启动 PostgreSQL 或将 storage.backend 改为 sqlite/auto）"
            )
        }),
        "auto" => init_storage_auto(config),
        other => Err(anyhow!("unknown storage backend: {other}")),
    }
}

fn init_storage_strict(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let storage = build_storage(&config.storage)?;
    storage.ensure_initialized()?;
    Ok(storage)
}

fn init_storage_auto(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match init_storage_strict(config) {
        Ok(storage) => Ok(storage),
        Err(err) => {
            warn!("Postgres 存储不可用，自动降级 SQLite: {err}");
            let sqlite = Arc::new(SqliteStorage::new(config.storage.db_path.clone()));
            sqlite.ensure_initialized()?;
            Ok(sqlite)
        }
    }
}
