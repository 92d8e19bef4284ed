//! 药品库存台账
//!
//! 每种药品一把互斥锁：同一药品的发药与补货串行化，不同药品互不影响。

use crate::lock::lock_owned_within;
use chrono::{NaiveDate, Utc};
use clinic_core::{ClinicError, DrugId, InventoryItem, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// 效期巡检结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpiryFlag {
    pub drug_id: DrugId,
    pub name: String,
    pub expiry: NaiveDate,
    pub days_remaining: i64,
    pub expired: bool,
}

/// 库存台账
#[derive(Debug)]
pub struct InventoryLedger {
    items: RwLock<HashMap<DrugId, Arc<Mutex<InventoryItem>>>>,
    lock_timeout: Duration,
}

impl InventoryLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// 新增或替换药品目录条目
    pub async fn add_item(&self, item: InventoryItem) -> Result<InventoryItem> {
        if item.drug_id.trim().is_empty() || item.name.trim().is_empty() {
            return Err(ClinicError::Validation("drug id and name are required".to_string()));
        }

        let existing = self.items.read().await.get(&item.drug_id).cloned();
        let shared = match existing {
            Some(shared) => shared,
            None => {
                let mut items = self.items.write().await;
                // 读锁释放后可能已被并发插入，此时按替换处理
                match items.get(&item.drug_id) {
                    Some(shared) => shared.clone(),
                    None => {
                        items.insert(item.drug_id.clone(), Arc::new(Mutex::new(item.clone())));
                        tracing::info!("Added inventory item {} ({} units)", item.drug_id, item.quantity);
                        return Ok(item);
                    }
                }
            }
        };

        let mut current = self.guard(shared, &item.drug_id).await?;
        *current = InventoryItem {
            updated_at: Utc::now(),
            ..item
        };
        tracing::info!("Replaced inventory item {}", current.drug_id);
        Ok(current.clone())
    }

    async fn guard(&self, shared: Arc<Mutex<InventoryItem>>, drug_id: &str) -> Result<OwnedMutexGuard<InventoryItem>> {
        lock_owned_within(shared, self.lock_timeout, format!("drug {}", drug_id)).await
    }

    async fn shared(&self, drug_id: &str) -> Result<Arc<Mutex<InventoryItem>>> {
        self.items
            .read()
            .await
            .get(drug_id)
            .cloned()
            .ok_or_else(|| ClinicError::NotFound(format!("drug {}", drug_id)))
    }

    /// 锁定单个药品，供发药的检查与扣减在同一临界区内完成
    pub async fn lock(&self, drug_id: &str) -> Result<OwnedMutexGuard<InventoryItem>> {
        let shared = self.shared(drug_id).await?;
        self.guard(shared, drug_id).await
    }

    /// 补货：直接设置数量，可同时更新有效期
    pub async fn restock(&self, drug_id: &str, quantity: u32, expiry: Option<NaiveDate>) -> Result<InventoryItem> {
        let mut item = self.lock(drug_id).await?;
        let previous = item.quantity;
        item.quantity = quantity;
        if let Some(expiry) = expiry {
            item.expiry = expiry;
            item.expiring_soon = false;
        }
        item.updated_at = Utc::now();

        tracing::info!("Restocked {} from {} to {} units", drug_id, previous, quantity);
        Ok(item.clone())
    }

    /// 查询库存水平
    pub async fn level(&self, drug_id: &str) -> Result<InventoryItem> {
        Ok(self.lock(drug_id).await?.clone())
    }

    pub async fn contains(&self, drug_id: &str) -> bool {
        self.items.read().await.contains_key(drug_id)
    }

    /// 按药品编码排序的库存快照
    pub async fn items(&self) -> Result<Vec<InventoryItem>> {
        let shared: Vec<(DrugId, Arc<Mutex<InventoryItem>>)> = self
            .items
            .read()
            .await
            .iter()
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();

        let mut items = Vec::with_capacity(shared.len());
        for (drug_id, item) in shared {
            items.push(self.guard(item, &drug_id).await?.clone());
        }
        items.sort_by(|a, b| a.drug_id.cmp(&b.drug_id));
        Ok(items)
    }

    /// 效期巡检：标记 `threshold_days` 天内到期的药品，清除其余药品的标记
    pub async fn expiry_sweep(&self, today: NaiveDate, threshold_days: i64) -> Result<Vec<ExpiryFlag>> {
        let shared: Vec<(DrugId, Arc<Mutex<InventoryItem>>)> = self
            .items
            .read()
            .await
            .iter()
            .map(|(id, item)| (id.clone(), item.clone()))
            .collect();

        let mut flags = Vec::new();
        for (drug_id, item) in shared {
            let mut item = self.guard(item, &drug_id).await?;
            let days_remaining = (item.expiry - today).num_days();
            let expiring = days_remaining <= threshold_days;
            if item.expiring_soon != expiring {
                item.expiring_soon = expiring;
                item.updated_at = Utc::now();
            }
            if expiring {
                flags.push(ExpiryFlag {
                    drug_id: item.drug_id.clone(),
                    name: item.name.clone(),
                    expiry: item.expiry,
                    days_remaining,
                    expired: item.is_expired(today),
                });
            }
        }

        flags.sort_by(|a, b| a.expiry.cmp(&b.expiry).then_with(|| a.drug_id.cmp(&b.drug_id)));
        tracing::info!("Expiry sweep flagged {} items", flags.len());
        Ok(flags)
    }

    /// 从快照恢复
    pub async fn restore(&self, items: Vec<InventoryItem>) {
        let mut map = self.items.write().await;
        for item in items {
            map.insert(item.drug_id.clone(), Arc::new(Mutex::new(item)));
        }
    }
}
