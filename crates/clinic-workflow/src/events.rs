//! 领域事件与外部通知接口
//!
//! 事件以 "发出即忘" 方式投递，核心流程不依赖投递结果。

use chrono::{DateTime, Utc};
use clinic_core::{DrugId, LabOrderId, PatientId, PrescriptionId, Status};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// 领域事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClinicEvent {
    PatientStatusChanged {
        patient_id: PatientId,
        from: Status,
        to: Status,
        /// 是否为强制离院产生
        forced: bool,
        timestamp: DateTime<Utc>,
    },
    LabResultUploaded {
        order_id: LabOrderId,
        patient_id: PatientId,
        test: String,
        timestamp: DateTime<Utc>,
    },
    PrescriptionDispensed {
        prescription_id: PrescriptionId,
        patient_id: PatientId,
        drug_id: DrugId,
        units: u32,
        timestamp: DateTime<Utc>,
    },
    InventoryLow {
        drug_id: DrugId,
        quantity: u32,
        threshold: u32,
        timestamp: DateTime<Utc>,
    },
}

impl ClinicEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClinicEvent::PatientStatusChanged { .. } => "PatientStatusChanged",
            ClinicEvent::LabResultUploaded { .. } => "LabResultUploaded",
            ClinicEvent::PrescriptionDispensed { .. } => "PrescriptionDispensed",
            ClinicEvent::InventoryLow { .. } => "InventoryLow",
        }
    }
}

/// 事件通知接口，由界面或消息推送组件实现
pub trait EventNotifier: Send + Sync + std::fmt::Debug {
    /// 投递事件，不得阻塞调用方
    fn publish(&self, event: ClinicEvent);
}

/// 仅记录日志的通知器
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl EventNotifier for TracingNotifier {
    fn publish(&self, event: ClinicEvent) {
        match &event {
            ClinicEvent::InventoryLow { drug_id, quantity, .. } => {
                tracing::warn!("Inventory low for {}: {} units left", drug_id, quantity);
            }
            other => tracing::info!("Event {}: {:?}", other.name(), other),
        }
    }
}

/// 基于 tokio 广播通道的进程内通知器
#[derive(Debug)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<ClinicEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClinicEvent> {
        self.sender.subscribe()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn publish(&self, event: ClinicEvent) {
        // 没有订阅者时发送失败，直接丢弃
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for clinic event");
        }
    }
}

/// 将事件保存在内存中的通知器，便于嵌入方轮询
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<ClinicEvent>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出并清空已收到的事件
    pub fn drain(&self) -> Vec<ClinicEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventNotifier for MemoryNotifier {
    fn publish(&self, event: ClinicEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
