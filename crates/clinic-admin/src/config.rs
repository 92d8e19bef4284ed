//! 配置管理
//!
//! 提供统一的配置管理功能：默认值、可选的 TOML 文件和 `CLINIC__*` 环境变量依次叠加，
//! 修改前经过验证，并可写回文件。

use crate::logging::LoggingConfig;
use anyhow::{Context, Result};
use clinic_workflow::{EngineSettings, LabRouting};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<ClinicConfig>>,
    /// 配置文件路径
    config_path: PathBuf,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 诊所系统完整配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClinicConfig {
    /// 服务进程配置
    pub server: ServerConfig,
    /// 工作流配置
    pub workflow: WorkflowConfig,
    /// 检验科配置
    pub laboratory: LaboratoryConfig,
    /// 药房配置
    pub pharmacy: PharmacyConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 服务进程配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 服务名称
    pub name: String,
    /// 状态快照文件
    pub snapshot_path: String,
    /// 每条命令执行后保存快照
    pub autosave: bool,
}

/// 工作流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// 获取锁的最长等待时间（毫秒）
    pub lock_timeout_ms: u64,
}

/// 检验科配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaboratoryConfig {
    /// 未配置路由的检验项目使用的设备
    pub default_equipment: String,
    /// 检验项目 -> 设备
    pub routes: HashMap<String, String>,
}

/// 药房配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PharmacyConfig {
    /// 低库存阈值
    pub low_stock_threshold: u32,
    /// 效期预警天数
    pub expiry_warning_days: i64,
}

impl ClinicConfig {
    /// 转换为工作流引擎参数
    pub fn workflow_settings(&self) -> EngineSettings {
        let lab = self
            .laboratory
            .routes
            .iter()
            .fold(LabRouting::new(self.laboratory.default_equipment.clone()), |routing, (test, unit)| {
                routing.with_route(test, unit.clone())
            });

        EngineSettings {
            lock_timeout: Duration::from_millis(self.workflow.lock_timeout_ms),
            lab,
            low_stock_threshold: self.pharmacy.low_stock_threshold,
            expiry_warning_days: self.pharmacy.expiry_warning_days,
        }
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&ClinicConfig) -> Result<()>,
}

impl ConfigManager {
    /// 创建新的配置管理器；文件不存在时使用默认值
    pub fn new(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = Self::load_config(&config_path)?;
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            validator,
        })
    }

    /// 叠加默认值、配置文件和环境变量
    pub fn load_config(config_path: &Path) -> Result<ClinicConfig> {
        let defaults = toml::to_string(&ClinicConfig::default()).context("Failed to serialize default configuration")?;
        let settings = Config::builder()
            .add_source(File::from_str(&defaults, FileFormat::Toml))
            .add_source(File::from(config_path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix("CLINIC").separator("__"))
            .build()
            .with_context(|| format!("Failed to read configuration from {}", config_path.display()))?;

        let config: ClinicConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        info!("Configuration loaded from: {}", config_path.display());
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// 获取配置
    pub async fn get_config(&self) -> ClinicConfig {
        self.config.read().await.clone()
    }

    /// 更新配置并写回文件
    pub async fn update_config(&self, new_config: ClinicConfig) -> Result<()> {
        self.validator.validate(&new_config)?;

        {
            let mut config = self.config.write().await;
            *config = new_config;
        }

        self.save_config().await?;

        info!("Configuration updated successfully");
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_config(&self) -> Result<()> {
        let config_str = {
            let config = self.config.read().await;
            toml::to_string_pretty(&*config).context("Failed to serialize configuration")?
        };

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create configuration directory")?;
            }
        }
        tokio::fs::write(&self.config_path, config_str)
            .await
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {}", self.config_path.display());
        Ok(())
    }

    /// 重新加载配置
    pub async fn reload_config(&self) -> Result<()> {
        let new_config = Self::load_config(&self.config_path)?;
        self.validator.validate(&new_config)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded");
        Ok(())
    }

    /// 按点分路径读取配置值，例如 `pharmacy.low_stock_threshold`
    pub async fn get_value<T>(&self, path: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let config = self.config.read().await;
        let config_json = serde_json::to_value(&*config).context("Failed to serialize config to JSON")?;

        let mut current = &config_json;
        for part in path.split('.') {
            current = current
                .get(part)
                .ok_or_else(|| anyhow::anyhow!("Configuration path not found: {}", path))?;
        }

        serde_json::from_value(current.clone()).context("Failed to deserialize configuration value")
    }

    /// 验证当前配置
    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "workflow.lock_timeout_ms",
                validator: |config| match config.workflow.lock_timeout_ms {
                    0 => Err(anyhow::anyhow!("Lock timeout cannot be 0")),
                    ms if ms > 60_000 => Err(anyhow::anyhow!("Lock timeout {}ms exceeds one minute", ms)),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "laboratory.default_equipment",
                validator: |config| {
                    if config.laboratory.default_equipment.trim().is_empty() {
                        Err(anyhow::anyhow!("Default lab equipment cannot be empty"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "laboratory.routes",
                validator: |config| {
                    match config
                        .laboratory
                        .routes
                        .iter()
                        .find(|(test, unit)| test.trim().is_empty() || unit.trim().is_empty())
                    {
                        Some((test, _)) => Err(anyhow::anyhow!("Lab route '{}' is incomplete", test)),
                        None => Ok(()),
                    }
                },
            },
            ValidationRule {
                field_path: "pharmacy.expiry_warning_days",
                validator: |config| {
                    if config.pharmacy.expiry_warning_days < 0 {
                        Err(anyhow::anyhow!("Expiry warning days cannot be negative"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "server.snapshot_path",
                validator: |config| {
                    if config.server.autosave && config.server.snapshot_path.trim().is_empty() {
                        Err(anyhow::anyhow!("Autosave requires a snapshot path"))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "logging.level",
                validator: |config| {
                    tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                        .map(|_| ())
                        .map_err(|e| anyhow::anyhow!("Invalid log filter '{}': {}", config.logging.level, e))
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &ClinicConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("Invalid {}: {}", rule.field_path, e));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "clinic-flow".to_string(),
            snapshot_path: "./data/clinic-snapshot.json".to_string(),
            autosave: true,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { lock_timeout_ms: 500 }
    }
}

impl Default for LaboratoryConfig {
    fn default() -> Self {
        let defaults = LabRouting::default();
        Self {
            default_equipment: defaults.default_equipment,
            routes: defaults.routes,
        }
    }
}

impl Default for PharmacyConfig {
    fn default() -> Self {
        Self {
            low_stock_threshold: 10,
            expiry_warning_days: 30,
        }
    }
}
