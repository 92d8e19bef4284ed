//! 检验单跟踪
//!
//! 管理检验单生命周期（待采样 → 检测中 → 已出结果）以及检验设备占用。
//! 检验单表与设备占用表在同一把锁内修改，设备检查和状态切换不可分割。

use crate::events::{ClinicEvent, EventNotifier};
use crate::lock::lock_within;
use crate::queue::QueueManager;
use crate::settings::LabRouting;
use chrono::Utc;
use clinic_core::utils::format_record_code;
use clinic_core::{
    ClinicError, Department, EncounterId, LabOrder, LabOrderId, LabOrderStatus, LabResult, LabTestRequest,
    PatientId, Priority, QueueEntry, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// 检验设备占用情况
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquipmentStatus {
    pub equipment: String,
    pub in_process: Option<LabOrderId>,
}

#[derive(Debug)]
struct LabState {
    orders: HashMap<LabOrderId, LabOrder>,
    /// 设备 -> 正在检测的检验单
    busy_equipment: HashMap<String, LabOrderId>,
    next_code: u64,
}

/// 检验单跟踪器
#[derive(Debug)]
pub struct LabOrderTracker {
    state: Mutex<LabState>,
    queue: QueueManager,
    routing: LabRouting,
    notifier: Arc<dyn EventNotifier>,
    lock_timeout: Duration,
}

impl LabOrderTracker {
    pub fn new(routing: LabRouting, notifier: Arc<dyn EventNotifier>, lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(LabState {
                orders: HashMap::new(),
                busy_equipment: HashMap::new(),
                next_code: 1,
            }),
            queue: QueueManager::new(Department::Lab, lock_timeout),
            routing,
            notifier,
            lock_timeout,
        }
    }

    async fn state(&self) -> Result<MutexGuard<'_, LabState>> {
        lock_within(&self.state, self.lock_timeout, "lab order table").await
    }

    /// 检验设备队列
    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// 创建单个检验单并放入检验队列
    pub async fn create_order(
        &self,
        patient_id: PatientId,
        encounter_id: EncounterId,
        test: &str,
        priority: Priority,
    ) -> Result<LabOrder> {
        let request = LabTestRequest {
            test: test.to_string(),
            priority,
        };
        let mut orders = self.create_orders(patient_id, encounter_id, &[request]).await?;
        orders
            .pop()
            .ok_or_else(|| ClinicError::Validation("no lab test requested".to_string()))
    }

    /// 批量创建检验单；任一入队失败时全部回滚
    pub async fn create_orders(
        &self,
        patient_id: PatientId,
        encounter_id: EncounterId,
        requests: &[LabTestRequest],
    ) -> Result<Vec<LabOrder>> {
        if requests.is_empty() {
            return Err(ClinicError::Validation("at least one lab test is required".to_string()));
        }
        if requests.iter().any(|r| r.test.trim().is_empty()) {
            return Err(ClinicError::Validation("lab test name is required".to_string()));
        }

        let mut state = self.state().await?;
        let now = Utc::now();
        let mut created: Vec<LabOrder> = Vec::with_capacity(requests.len());

        for (offset, request) in requests.iter().enumerate() {
            let test = request.test.trim().to_string();
            let order = LabOrder {
                id: Uuid::new_v4(),
                code: format_record_code("LB", state.next_code + offset as u64),
                patient_id,
                encounter_id,
                equipment: self.routing.equipment_for(&test).to_string(),
                test,
                priority: request.priority,
                status: LabOrderStatus::PendingCollection,
                result: None,
                created_at: now,
                updated_at: now,
            };

            let entry = QueueEntry::for_lab_order(order.id, patient_id, order.priority);
            if let Err(e) = self.queue.enqueue(entry).await {
                for order in &created {
                    self.queue.evict(order.id).await;
                }
                return Err(e);
            }
            created.push(order);
        }

        state.next_code += created.len() as u64;
        for order in &created {
            tracing::info!(
                "Created lab order {} ({}) for patient {} on {}",
                order.code,
                order.test,
                patient_id,
                order.equipment
            );
            state.orders.insert(order.id, order.clone());
        }
        Ok(created)
    }

    /// 开始检测：待采样 → 检测中，同一设备同时只能处理一张检验单
    pub async fn begin_processing(&self, order_id: LabOrderId) -> Result<LabOrder> {
        let mut state = self.state().await?;
        let order = state
            .orders
            .get(&order_id)
            .ok_or_else(|| ClinicError::NotFound(format!("lab order {}", order_id)))?;

        if order.status != LabOrderStatus::PendingCollection {
            return Err(ClinicError::illegal_transition(order.status, LabOrderStatus::InProcess));
        }

        let equipment = order.equipment.clone();
        if let Some(holder) = state.busy_equipment.get(&equipment) {
            let holder_code = state
                .orders
                .get(holder)
                .map(|o| o.code.clone())
                .unwrap_or_else(|| holder.to_string());
            return Err(ClinicError::ResourceBusy(format!(
                "equipment {} is processing lab order {}",
                equipment, holder_code
            )));
        }

        self.queue.remove(order_id).await?;

        state.busy_equipment.insert(equipment.clone(), order_id);
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| ClinicError::NotFound(format!("lab order {}", order_id)))?;
        order.status = LabOrderStatus::InProcess;
        order.updated_at = Utc::now();

        tracing::info!("Lab order {} started on {}", order.code, equipment);
        Ok(order.clone())
    }

    /// 上传结果：检测中 → 已出结果，并释放设备
    pub async fn upload_result(&self, order_id: LabOrderId, payload: &str) -> Result<LabOrder> {
        let mut state = self.state().await?;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| ClinicError::NotFound(format!("lab order {}", order_id)))?;

        if order.status != LabOrderStatus::InProcess {
            return Err(ClinicError::illegal_transition(order.status, LabOrderStatus::Resulted));
        }
        if payload.trim().is_empty() {
            return Err(ClinicError::Validation("lab result payload is empty".to_string()));
        }

        let now = Utc::now();
        order.status = LabOrderStatus::Resulted;
        order.result = Some(LabResult {
            payload: payload.to_string(),
            uploaded_at: now,
        });
        order.updated_at = now;
        let order = order.clone();

        if state.busy_equipment.get(&order.equipment) == Some(&order_id) {
            state.busy_equipment.remove(&order.equipment);
        }
        drop(state);

        tracing::info!("Lab order {} resulted, {} released", order.code, order.equipment);
        self.notifier.publish(ClinicEvent::LabResultUploaded {
            order_id,
            patient_id: order.patient_id,
            test: order.test.clone(),
            timestamp: now,
        });
        Ok(order)
    }

    /// 撤销就诊中尚未采样的检验单；仅用于强制离院，无限等待锁
    pub async fn cancel_pending(&self, order_ids: &[LabOrderId]) -> Vec<LabOrder> {
        let mut state = self.state.lock().await;
        let mut cancelled = Vec::new();
        for order_id in order_ids {
            if let Some(order) = state.orders.get_mut(order_id) {
                if order.status == LabOrderStatus::PendingCollection {
                    order.status = LabOrderStatus::Cancelled;
                    order.updated_at = Utc::now();
                    cancelled.push(order.clone());
                }
            }
        }
        drop(state);

        for order in &cancelled {
            self.queue.evict(order.id).await;
            tracing::warn!("Cancelled lab order {} on forced discharge", order.code);
        }
        cancelled
    }

    /// 返回给定检验单中尚未结束的部分
    pub async fn unsettled(&self, order_ids: &[LabOrderId]) -> Result<Vec<LabOrder>> {
        let state = self.state().await?;
        Ok(order_ids
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|order| !order.status.is_settled())
            .cloned()
            .collect())
    }

    pub async fn get(&self, order_id: LabOrderId) -> Result<LabOrder> {
        self.state()
            .await?
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| ClinicError::NotFound(format!("lab order {}", order_id)))
    }

    /// 活跃检验单，按优先级和创建时间排序
    pub async fn active_orders(&self) -> Result<Vec<LabOrder>> {
        let state = self.state().await?;
        let mut orders: Vec<LabOrder> = state
            .orders
            .values()
            .filter(|order| !order.status.is_settled())
            .cloned()
            .collect();
        orders.sort_by(|a, b| {
            (a.priority, a.created_at, &a.code).cmp(&(b.priority, b.created_at, &b.code))
        });
        Ok(orders)
    }

    /// 指定就诊的全部检验单
    pub async fn orders_for_encounter(&self, encounter_id: EncounterId) -> Result<Vec<LabOrder>> {
        let state = self.state().await?;
        let mut orders: Vec<LabOrder> = state
            .orders
            .values()
            .filter(|order| order.encounter_id == encounter_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(orders)
    }

    /// 已知设备的占用情况
    pub async fn equipment_status(&self) -> Result<Vec<EquipmentStatus>> {
        let state = self.state().await?;
        let mut units: BTreeMap<String, Option<LabOrderId>> = BTreeMap::new();
        units.insert(self.routing.default_equipment.clone(), None);
        for unit in self.routing.routes.values() {
            units.insert(unit.clone(), None);
        }
        for (unit, order_id) in &state.busy_equipment {
            units.insert(unit.clone(), Some(*order_id));
        }

        Ok(units
            .into_iter()
            .map(|(equipment, in_process)| EquipmentStatus { equipment, in_process })
            .collect())
    }

    /// 全部检验单快照及下一个编号
    pub async fn export(&self) -> Result<(Vec<LabOrder>, u64)> {
        let state = self.state().await?;
        let mut orders: Vec<LabOrder> = state.orders.values().cloned().collect();
        orders.sort_by(|a, b| a.code.cmp(&b.code));
        Ok((orders, state.next_code))
    }

    /// 从快照恢复，设备占用由检测中的检验单重建
    pub async fn restore(&self, orders: Vec<LabOrder>, next_code: u64) {
        let mut state = self.state.lock().await;
        for order in orders {
            if order.status == LabOrderStatus::InProcess {
                state.busy_equipment.insert(order.equipment.clone(), order.id);
            }
            state.orders.insert(order.id, order);
        }
        state.next_code = next_code.max(1);
    }
}
