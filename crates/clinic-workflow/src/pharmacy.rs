//! 药房发药
//!
//! 发药时在药品锁内完成 "检查库存 → 扣减 → 处方置为已发药"，检查与写入之间
//! 不存在其他读写，保证库存永不为负。

use crate::events::{ClinicEvent, EventNotifier};
use crate::inventory::InventoryLedger;
use crate::lock::lock_owned_within;
use chrono::Utc;
use clinic_core::utils::format_record_code;
use clinic_core::{
    ClinicError, EncounterId, PatientId, Prescription, PrescriptionId, PrescriptionRequest, PrescriptionStatus,
    Result,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

type SharedPrescription = Arc<Mutex<Prescription>>;

/// 药房发药器
#[derive(Debug)]
pub struct PharmacyDispenser {
    prescriptions: RwLock<HashMap<PrescriptionId, SharedPrescription>>,
    inventory: Arc<InventoryLedger>,
    notifier: Arc<dyn EventNotifier>,
    low_stock_threshold: u32,
    next_code: AtomicU64,
    lock_timeout: Duration,
}

impl PharmacyDispenser {
    pub fn new(
        inventory: Arc<InventoryLedger>,
        notifier: Arc<dyn EventNotifier>,
        low_stock_threshold: u32,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            prescriptions: RwLock::new(HashMap::new()),
            inventory,
            notifier,
            low_stock_threshold,
            next_code: AtomicU64::new(1),
            lock_timeout,
        }
    }

    /// 开立处方；所有请求校验通过后才写入
    pub async fn create_prescriptions(
        &self,
        patient_id: PatientId,
        encounter_id: EncounterId,
        requests: &[PrescriptionRequest],
    ) -> Result<Vec<Prescription>> {
        if requests.is_empty() {
            return Err(ClinicError::Validation("at least one prescription is required".to_string()));
        }
        for request in requests {
            request.validate()?;
            if !self.inventory.contains(&request.drug_id).await {
                return Err(ClinicError::NotFound(format!("drug {}", request.drug_id)));
            }
        }

        let now = Utc::now();
        let first_code = self.next_code.fetch_add(requests.len() as u64, Ordering::SeqCst);
        let created: Vec<Prescription> = requests
            .iter()
            .enumerate()
            .map(|(offset, request)| Prescription {
                id: Uuid::new_v4(),
                code: format_record_code("RX", first_code + offset as u64),
                patient_id,
                encounter_id,
                drug_id: request.drug_id.clone(),
                units: request.units,
                dosage: request.dosage.trim().to_string(),
                prescriber: request.prescriber.trim().to_string(),
                status: PrescriptionStatus::Pending,
                created_at: now,
                updated_at: now,
                dispensed_at: None,
            })
            .collect();

        let mut prescriptions = self.prescriptions.write().await;
        for prescription in &created {
            tracing::info!(
                "Prescription {} written for patient {}: {} x{} ({})",
                prescription.code,
                patient_id,
                prescription.drug_id,
                prescription.units,
                prescription.dosage
            );
            prescriptions.insert(prescription.id, Arc::new(Mutex::new(prescription.clone())));
        }
        Ok(created)
    }

    async fn lock(&self, prescription_id: PrescriptionId) -> Result<OwnedMutexGuard<Prescription>> {
        let shared = self
            .prescriptions
            .read()
            .await
            .get(&prescription_id)
            .cloned()
            .ok_or_else(|| ClinicError::NotFound(format!("prescription {}", prescription_id)))?;
        lock_owned_within(shared, self.lock_timeout, format!("prescription {}", prescription_id)).await
    }

    /// 发药：库存检查与扣减在同一药品锁内完成
    pub async fn dispense(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        let mut prescription = self.lock(prescription_id).await?;
        if prescription.status != PrescriptionStatus::Pending {
            return Err(ClinicError::illegal_transition(prescription.status, PrescriptionStatus::Dispensed));
        }

        let mut item = self.inventory.lock(&prescription.drug_id).await?;
        let today = Utc::now().date_naive();
        if item.is_expired(today) {
            tracing::warn!(
                "Refused to dispense {}: stock of {} expired on {}",
                prescription.code,
                item.drug_id,
                item.expiry
            );
            return Err(ClinicError::ExpiredStock {
                drug_id: item.drug_id.clone(),
                expiry: item.expiry,
            });
        }
        if item.quantity < prescription.units {
            tracing::warn!(
                "Refused to dispense {}: {} has {} units, {} required",
                prescription.code,
                item.drug_id,
                item.quantity,
                prescription.units
            );
            return Err(ClinicError::InsufficientStock {
                drug_id: item.drug_id.clone(),
                required: prescription.units,
                available: item.quantity,
            });
        }

        let now = Utc::now();
        item.quantity -= prescription.units;
        item.updated_at = now;
        prescription.status = PrescriptionStatus::Dispensed;
        prescription.dispensed_at = Some(now);
        prescription.updated_at = now;

        let remaining = item.quantity;
        let dispensed = prescription.clone();
        drop(item);
        drop(prescription);

        tracing::info!(
            "Dispensed {} ({} x{}), {} units left",
            dispensed.code,
            dispensed.drug_id,
            dispensed.units,
            remaining
        );
        self.notifier.publish(ClinicEvent::PrescriptionDispensed {
            prescription_id,
            patient_id: dispensed.patient_id,
            drug_id: dispensed.drug_id.clone(),
            units: dispensed.units,
            timestamp: now,
        });
        if remaining <= self.low_stock_threshold {
            self.notifier.publish(ClinicEvent::InventoryLow {
                drug_id: dispensed.drug_id.clone(),
                quantity: remaining,
                threshold: self.low_stock_threshold,
                timestamp: now,
            });
        }
        Ok(dispensed)
    }

    /// 取消处方：待发药 → 已取消，不影响库存
    pub async fn cancel(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        let mut prescription = self.lock(prescription_id).await?;
        if prescription.status != PrescriptionStatus::Pending {
            return Err(ClinicError::illegal_transition(prescription.status, PrescriptionStatus::Cancelled));
        }
        prescription.status = PrescriptionStatus::Cancelled;
        prescription.updated_at = Utc::now();

        tracing::info!("Prescription {} cancelled", prescription.code);
        Ok(prescription.clone())
    }

    /// 取消给定处方中仍待发药的部分；仅用于强制离院，无限等待锁
    pub async fn cancel_pending(&self, ids: &[PrescriptionId]) -> Vec<Prescription> {
        let shared: Vec<SharedPrescription> = {
            let prescriptions = self.prescriptions.read().await;
            ids.iter().filter_map(|id| prescriptions.get(id).cloned()).collect()
        };

        let mut cancelled = Vec::new();
        for prescription in shared {
            let mut prescription = prescription.lock_owned().await;
            if prescription.status == PrescriptionStatus::Pending {
                prescription.status = PrescriptionStatus::Cancelled;
                prescription.updated_at = Utc::now();
                tracing::warn!("Cancelled prescription {} on forced discharge", prescription.code);
                cancelled.push(prescription.clone());
            }
        }
        cancelled
    }

    /// 返回给定处方中仍待发药的部分
    pub async fn unsettled(&self, ids: &[PrescriptionId]) -> Result<Vec<Prescription>> {
        let mut pending = Vec::new();
        for id in ids {
            let prescription = self.lock(*id).await?;
            if prescription.status == PrescriptionStatus::Pending {
                pending.push(prescription.clone());
            }
        }
        Ok(pending)
    }

    pub async fn get(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        Ok(self.lock(prescription_id).await?.clone())
    }

    /// 全部处方快照，按编号排序
    pub async fn prescriptions(&self) -> Result<Vec<Prescription>> {
        let shared: Vec<(PrescriptionId, SharedPrescription)> = self
            .prescriptions
            .read()
            .await
            .iter()
            .map(|(id, p)| (*id, p.clone()))
            .collect();

        let mut all = Vec::with_capacity(shared.len());
        for (id, prescription) in shared {
            let guard = lock_owned_within(prescription, self.lock_timeout, format!("prescription {}", id)).await?;
            all.push(guard.clone());
        }
        all.sort_by(|a, b| (a.created_at, &a.code).cmp(&(b.created_at, &b.code)));
        Ok(all)
    }

    /// 待发药处方
    pub async fn pending_prescriptions(&self) -> Result<Vec<Prescription>> {
        Ok(self
            .prescriptions()
            .await?
            .into_iter()
            .filter(|p| p.status == PrescriptionStatus::Pending)
            .collect())
    }

    pub fn next_code(&self) -> u64 {
        self.next_code.load(Ordering::SeqCst)
    }

    /// 从快照恢复
    pub async fn restore(&self, prescriptions: Vec<Prescription>, next_code: u64) {
        let mut map = self.prescriptions.write().await;
        for prescription in prescriptions {
            map.insert(prescription.id, Arc::new(Mutex::new(prescription)));
        }
        self.next_code.store(next_code.max(1), Ordering::SeqCst);
    }
}
