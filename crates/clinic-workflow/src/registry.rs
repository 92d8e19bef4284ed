//! 患者登记
//!
//! 持有患者身份和人口学信息；每名患者一把互斥锁，对同一患者的修改串行化，
//! 不同患者之间完全并行。

use crate::lock::lock_owned_within;
use chrono::Utc;
use clinic_core::utils::format_record_code;
use clinic_core::{ClinicError, Demographics, Encounter, Patient, PatientId, Result, Status};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// 患者档案：患者信息及当前就诊
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient: Patient,
    pub encounter: Encounter,
}

type SharedRecord = Arc<Mutex<PatientRecord>>;

/// 患者登记簿
#[derive(Debug)]
pub struct PatientRegistry {
    records: RwLock<HashMap<PatientId, SharedRecord>>,
    next_record_number: AtomicU64,
    lock_timeout: Duration,
}

impl PatientRegistry {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_record_number: AtomicU64::new(1),
            lock_timeout,
        }
    }

    /// 新建患者档案并持有其锁返回
    ///
    /// 档案在锁定状态下插入，调用方完成入队等副作用后才对其他操作可见；
    /// 副作用失败时调用 [`PatientRegistry::discard`] 回滚。
    pub async fn register(&self, demographics: Demographics) -> Result<OwnedMutexGuard<PatientRecord>> {
        demographics.validate()?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let sequence = self.next_record_number.fetch_add(1, Ordering::SeqCst);
        let record = PatientRecord {
            patient: Patient {
                id,
                record_number: format_record_code("P", sequence),
                name: demographics.name.trim().to_string(),
                age: demographics.age,
                gender: demographics.gender,
                phone: demographics.phone.trim().to_string(),
                status: Status::Waiting,
                last_visit: now,
                version: 1,
                created_at: now,
                updated_at: now,
            },
            encounter: Encounter::open(id, demographics.urgent),
        };

        let shared = Arc::new(Mutex::new(record));
        let guard = shared.clone().lock_owned().await;
        self.records.write().await.insert(id, shared);

        tracing::info!("Registered patient {} ({})", guard.patient.record_number, id);
        Ok(guard)
    }

    /// 撤销尚未对外可见的登记
    pub(crate) async fn discard(&self, patient_id: PatientId) {
        self.records.write().await.remove(&patient_id);
        tracing::warn!("Rolled back registration of patient {}", patient_id);
    }

    async fn shared(&self, patient_id: PatientId) -> Result<SharedRecord> {
        self.records
            .read()
            .await
            .get(&patient_id)
            .cloned()
            .ok_or_else(|| ClinicError::NotFound(format!("patient {}", patient_id)))
    }

    /// 在有限等待内锁定患者档案
    pub async fn lock(&self, patient_id: PatientId) -> Result<OwnedMutexGuard<PatientRecord>> {
        let shared = self.shared(patient_id).await?;
        lock_owned_within(shared, self.lock_timeout, format!("patient {}", patient_id)).await
    }

    /// 无限等待锁定患者档案；仅用于强制离院
    pub async fn lock_unbounded(&self, patient_id: PatientId) -> Result<OwnedMutexGuard<PatientRecord>> {
        let shared = self.shared(patient_id).await?;
        Ok(shared.lock_owned().await)
    }

    /// 获取患者快照
    pub async fn get(&self, patient_id: PatientId) -> Result<Patient> {
        Ok(self.lock(patient_id).await?.patient.clone())
    }

    /// 获取患者档案快照
    pub async fn get_record(&self, patient_id: PatientId) -> Result<PatientRecord> {
        Ok(self.lock(patient_id).await?.clone())
    }

    /// 按登记时间列出所有患者档案
    pub async fn records(&self) -> Result<Vec<PatientRecord>> {
        let shared: Vec<SharedRecord> = self.records.read().await.values().cloned().collect();

        let mut records = Vec::with_capacity(shared.len());
        for record in shared {
            let guard = lock_owned_within(record, self.lock_timeout, "patient registry").await?;
            records.push(guard.clone());
        }
        records.sort_by(|a, b| {
            (a.patient.created_at, &a.patient.record_number).cmp(&(b.patient.created_at, &b.patient.record_number))
        });
        Ok(records)
    }

    pub async fn list(&self) -> Result<Vec<Patient>> {
        Ok(self.records().await?.into_iter().map(|record| record.patient).collect())
    }

    /// 按姓名、电话、病历号或患者 ID 检索，不区分大小写；空检索词返回全部患者
    pub async fn search(&self, term: &str) -> Result<Vec<Patient>> {
        let term = term.trim().to_lowercase();
        let patients = self.list().await?;
        if term.is_empty() {
            return Ok(patients);
        }

        let dialled = digits_of(&term);
        Ok(patients
            .into_iter()
            .filter(|patient| {
                patient.name.to_lowercase().contains(&term)
                    || patient.record_number.to_lowercase().contains(&term)
                    || patient.id.to_string().contains(&term)
                    || patient.phone.to_lowercase().contains(&term)
                    || (!dialled.is_empty() && digits_of(&patient.phone).contains(&dialled))
            })
            .collect())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// 从快照恢复档案
    pub async fn restore(&self, records: Vec<PatientRecord>, next_record_number: u64) {
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.patient.id, Arc::new(Mutex::new(record)));
        }
        self.next_record_number.store(next_record_number.max(1), Ordering::SeqCst);
    }

    pub fn next_record_number(&self) -> u64 {
        self.next_record_number.load(Ordering::SeqCst)
    }
}

/// 电话号码只比较数字部分，空格和连字符不影响检索
fn digits_of(value: &str) -> String {
    value.chars().filter(|c| c.is_ascii_digit()).collect()
}
