//! 科室排队管理
//!
//! 每个科室一个队列实例，按优先级、入队时间和入队序号排序。队列内容是
//! "下一位是谁" 的唯一依据。

use crate::lock::lock_within;
use chrono::{DateTime, Utc};
use clinic_core::{ClinicError, Department, Priority, QueueEntry, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type OrderKey = (Priority, DateTime<Utc>, u64);

#[derive(Debug, Default)]
struct QueueState {
    ordered: BTreeMap<OrderKey, QueueEntry>,
    index: HashMap<Uuid, OrderKey>,
    next_sequence: u64,
}

impl QueueState {
    fn insert(&mut self, mut entry: QueueEntry) -> QueueEntry {
        self.next_sequence += 1;
        entry.sequence = self.next_sequence;
        self.place(entry)
    }

    /// 保留条目原有序号
    fn place(&mut self, entry: QueueEntry) -> QueueEntry {
        self.next_sequence = self.next_sequence.max(entry.sequence);
        let key = (entry.priority, entry.enqueued_at, entry.sequence);
        self.index.insert(entry.subject_id, key);
        self.ordered.insert(key, entry.clone());
        entry
    }

    fn take(&mut self, subject_id: Uuid) -> Option<QueueEntry> {
        let key = self.index.remove(&subject_id)?;
        self.ordered.remove(&key)
    }
}

/// 排队管理器
#[derive(Debug)]
pub struct QueueManager {
    department: Department,
    lock_timeout: Duration,
    state: Mutex<QueueState>,
}

impl QueueManager {
    /// 创建新的科室队列
    pub fn new(department: Department, lock_timeout: Duration) -> Self {
        Self {
            department,
            lock_timeout,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn department(&self) -> Department {
        self.department
    }

    async fn state(&self) -> Result<MutexGuard<'_, QueueState>> {
        lock_within(&self.state, self.lock_timeout, format!("{} queue", self.department)).await
    }

    /// 入队，同一队列内不允许重复对象
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<QueueEntry> {
        let mut state = self.state().await?;
        if state.index.contains_key(&entry.subject_id) {
            return Err(ClinicError::DuplicateEntry(format!(
                "{} is already queued in {}",
                entry.subject_id, self.department
            )));
        }

        let entry = state.insert(entry);
        tracing::debug!(
            "Enqueued {} into {} queue with priority {:?} (length {})",
            entry.subject_id,
            self.department,
            entry.priority,
            state.ordered.len()
        );
        Ok(entry)
    }

    /// 取出队首，队列为空时返回 None
    pub async fn dequeue_next(&self) -> Result<Option<QueueEntry>> {
        let mut state = self.state().await?;
        let head = state.ordered.keys().next().copied();
        let entry = head.and_then(|key| state.ordered.remove(&key));
        if let Some(entry) = &entry {
            state.index.remove(&entry.subject_id);
            tracing::debug!("Dequeued {} from {} queue", entry.subject_id, self.department);
        }
        Ok(entry)
    }

    /// 查看队首但不取出
    pub async fn peek(&self) -> Result<Option<QueueEntry>> {
        Ok(self.state().await?.ordered.values().next().cloned())
    }

    /// 移除指定对象，不存在时不做任何操作
    pub async fn remove(&self, subject_id: Uuid) -> Result<Option<QueueEntry>> {
        let mut state = self.state().await?;
        let removed = state.take(subject_id);
        if removed.is_some() {
            tracing::debug!("Removed {} from {} queue", subject_id, self.department);
        }
        Ok(removed)
    }

    /// 强制移除，无限等待锁；仅用于强制离院
    pub async fn evict(&self, subject_id: Uuid) -> Option<QueueEntry> {
        self.state.lock().await.take(subject_id)
    }

    /// 以原有时间和优先级放回队列，用于回滚已取出的条目
    pub async fn reinstate(&self, entry: QueueEntry) {
        let mut state = self.state.lock().await;
        if !state.index.contains_key(&entry.subject_id) {
            state.place(entry);
        }
    }

    /// 按出队顺序返回队列快照
    pub async fn entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state().await?;
        Ok(state.ordered.values().cloned().collect())
    }

    /// 对象在队列中的位置（从0开始）
    pub async fn position(&self, subject_id: Uuid) -> Result<Option<usize>> {
        let state = self.state().await?;
        Ok(state
            .index
            .get(&subject_id)
            .and_then(|key| state.ordered.keys().position(|k| k == key)))
    }

    pub async fn contains(&self, subject_id: Uuid) -> Result<bool> {
        Ok(self.state().await?.index.contains_key(&subject_id))
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.state().await?.ordered.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
