//! # 诊所管理模块
//!
//! 提供配置管理、日志初始化以及引擎装配等运维功能

pub mod config;
pub mod logging;

pub use config::{ClinicConfig, ConfigManager, ConfigValidator};
pub use logging::{init_logging, LogFormat, LoggingConfig};

use anyhow::{Context, Result};
use clinic_workflow::{ClinicService, EventNotifier, JsonFileStore, Response, SnapshotStore, WorkflowEngine};
use std::sync::Arc;

/// 系统运行环境
///
/// 按配置装配引擎、服务门面和快照存储的统一入口点
#[derive(Debug)]
pub struct ClinicRuntime {
    config: ClinicConfig,
    service: ClinicService,
    store: JsonFileStore,
}

impl ClinicRuntime {
    /// 按配置创建引擎，并从快照文件恢复之前的状态
    pub async fn start(config: ClinicConfig, notifier: Arc<dyn EventNotifier>) -> Result<Self> {
        tracing::info!("Starting {}", config.server.name);

        let engine = Arc::new(WorkflowEngine::new(config.workflow_settings(), notifier));
        let store = JsonFileStore::new(&config.server.snapshot_path);
        if let Some(snapshot) = store
            .load()
            .await
            .with_context(|| format!("Failed to load snapshot {}", config.server.snapshot_path))?
        {
            engine.restore(snapshot).await.context("Failed to restore snapshot")?;
        }

        Ok(Self {
            service: ClinicService::new(engine),
            config,
            store,
        })
    }

    pub fn config(&self) -> &ClinicConfig {
        &self.config
    }

    pub fn service(&self) -> &ClinicService {
        &self.service
    }

    /// 保存当前状态快照
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self
            .service
            .engine()
            .snapshot()
            .await
            .context("Failed to take snapshot")?;
        self.store
            .save(&snapshot)
            .await
            .with_context(|| format!("Failed to write snapshot {}", self.store.path().display()))
    }

    /// 处理一行请求；开启自动保存时，命令成功后写入快照
    pub async fn handle_line(&self, line: &str) -> Result<String> {
        let request = match ClinicService::parse(line) {
            Ok(request) => request,
            Err(e) => {
                let response: Response = e.into();
                return Ok(ClinicService::encode(&response));
            }
        };

        let is_command = request.is_command();
        let response = self.service.handle(request).await;
        if is_command && response.is_ok() && self.config.server.autosave {
            self.persist().await?;
        }
        Ok(ClinicService::encode(&response))
    }
}
