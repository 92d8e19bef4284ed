//! 状态快照持久化

use crate::registry::PatientRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinic_core::{Department, InventoryItem, LabOrder, Prescription, QueueEntry, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 单个科室队列的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub department: Department,
    pub entries: Vec<QueueEntry>,
}

/// 各类编号的下一个值
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sequences {
    pub patients: u64,
    pub lab_orders: u64,
    pub prescriptions: u64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            patients: 1,
            lab_orders: 1,
            prescriptions: 1,
        }
    }
}

/// 引擎全部状态的快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicSnapshot {
    pub taken_at: DateTime<Utc>,
    pub patients: Vec<PatientRecord>,
    pub lab_orders: Vec<LabOrder>,
    pub prescriptions: Vec<Prescription>,
    pub inventory: Vec<InventoryItem>,
    pub queues: Vec<QueueSnapshot>,
    #[serde(default)]
    pub sequences: Sequences,
}

/// 快照存储接口
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// 读取最近一次保存的快照，不存在时返回 None
    async fn load(&self) -> Result<Option<ClinicSnapshot>>;

    /// 保存快照，覆盖之前的内容
    async fn save(&self, snapshot: &ClinicSnapshot) -> Result<()>;
}

/// 以 JSON 文件保存快照
///
/// 先写入同目录下的临时文件再重命名，进程中断时旧快照保持完整。
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<ClinicSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No snapshot at {}, starting empty", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: ClinicSnapshot = serde_json::from_slice(&bytes)?;
        tracing::info!(
            "Loaded snapshot taken at {} from {}",
            snapshot.taken_at,
            self.path.display()
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &ClinicSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        tracing::debug!("Saved snapshot ({} bytes) to {}", json.len(), self.path.display());
        Ok(())
    }
}
