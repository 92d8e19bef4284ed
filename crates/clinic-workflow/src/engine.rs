//! 工作流引擎
//!
//! 协调患者登记、状态机、科室队列、检验和药房的核心引擎，是患者状态的唯一修改入口。
//!
//! 加锁顺序固定为：患者 → (队列 | 检验单表 → 检验队列 | 处方 → 药品)。
//! 任何路径都不会在持有其他锁时再去获取患者锁。

use crate::events::{ClinicEvent, EventNotifier};
use crate::inventory::{ExpiryFlag, InventoryLedger};
use crate::lab::{EquipmentStatus, LabOrderTracker};
use crate::pharmacy::PharmacyDispenser;
use crate::queue::QueueManager;
use crate::registry::{PatientRecord, PatientRegistry};
use crate::settings::EngineSettings;
use crate::state_machine::{PatientStateMachine, SideEffect};
use crate::store::{ClinicSnapshot, QueueSnapshot, Sequences};
use chrono::{NaiveDate, Utc};
use clinic_core::{
    ClinicError, Demographics, Department, Encounter, InventoryItem, LabOrder, LabOrderId, LabTestRequest,
    Patient, PatientId, Prescription, PrescriptionId, PrescriptionRequest, Priority, QueueEntry, Result, Status,
    Vitals,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 状态转换附带的数据，必须与转换边匹配
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionPayload {
    #[default]
    None,
    /// 医生 → 检验
    LabTests { tests: Vec<LabTestRequest> },
    /// 医生 → 药房
    Prescriptions { prescriptions: Vec<PrescriptionRequest> },
    /// 离院 → 候诊
    Revisit {
        #[serde(default)]
        urgent: bool,
    },
}

impl TransitionPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionPayload::None => "none",
            TransitionPayload::LabTests { .. } => "lab_tests",
            TransitionPayload::Prescriptions { .. } => "prescriptions",
            TransitionPayload::Revisit { .. } => "revisit",
        }
    }
}

/// 患者及其当前就诊
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientChart {
    pub patient: Patient,
    pub encounter: Encounter,
}

impl From<PatientRecord> for PatientChart {
    fn from(record: PatientRecord) -> Self {
        Self {
            patient: record.patient,
            encounter: record.encounter,
        }
    }
}

/// 工作流引擎
#[derive(Debug)]
pub struct WorkflowEngine {
    settings: EngineSettings,
    state_machine: PatientStateMachine,
    registry: PatientRegistry,
    opd_queue: QueueManager,
    doctor_queue: QueueManager,
    lab: LabOrderTracker,
    inventory: Arc<InventoryLedger>,
    pharmacy: PharmacyDispenser,
    notifier: Arc<dyn EventNotifier>,
}

impl WorkflowEngine {
    /// 创建新的工作流引擎
    pub fn new(settings: EngineSettings, notifier: Arc<dyn EventNotifier>) -> Self {
        let timeout = settings.lock_timeout;
        let inventory = Arc::new(InventoryLedger::new(timeout));
        Self {
            state_machine: PatientStateMachine::new(),
            registry: PatientRegistry::new(timeout),
            opd_queue: QueueManager::new(Department::Opd, timeout),
            doctor_queue: QueueManager::new(Department::Doctor, timeout),
            lab: LabOrderTracker::new(settings.lab.clone(), notifier.clone(), timeout),
            pharmacy: PharmacyDispenser::new(inventory.clone(), notifier.clone(), settings.low_stock_threshold, timeout),
            inventory,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn queue(&self, department: Department) -> &QueueManager {
        match department {
            Department::Opd => &self.opd_queue,
            Department::Doctor => &self.doctor_queue,
            Department::Lab => self.lab.queue(),
        }
    }

    /// 登记新患者：创建候诊状态的患者档案并放入门诊候诊队列
    pub async fn register_patient(&self, demographics: Demographics) -> Result<Patient> {
        let record = self.registry.register(demographics).await?;
        let patient_id = record.patient.id;

        let entry = QueueEntry::for_patient(patient_id, record.encounter.priority());
        if let Err(e) = self.opd_queue.enqueue(entry).await {
            drop(record);
            self.registry.discard(patient_id).await;
            return Err(e);
        }

        tracing::info!(
            "Patient {} queued for OPD with priority {:?}",
            record.patient.record_number,
            record.encounter.priority()
        );
        Ok(record.patient.clone())
    }

    /// 推进患者状态
    pub async fn advance(&self, patient_id: PatientId, target: Status, payload: TransitionPayload) -> Result<Patient> {
        self.advance_checked(patient_id, target, payload, None).await
    }

    /// 版本一致时才推进患者状态
    pub async fn advance_if_version(
        &self,
        patient_id: PatientId,
        expected_version: u64,
        target: Status,
        payload: TransitionPayload,
    ) -> Result<Patient> {
        self.advance_checked(patient_id, target, payload, Some(expected_version))
            .await
    }

    async fn advance_checked(
        &self,
        patient_id: PatientId,
        target: Status,
        payload: TransitionPayload,
        expected_version: Option<u64>,
    ) -> Result<Patient> {
        let mut record = self.registry.lock(patient_id).await?;
        if let Some(expected) = expected_version {
            if record.patient.version != expected {
                return Err(ClinicError::ConcurrentModification {
                    expected,
                    actual: record.patient.version,
                });
            }
        }

        let from = record.patient.status;
        self.apply_transition(&mut record, target, payload).await?;
        let patient = record.patient.clone();
        drop(record);

        self.publish_status_change(&patient, from, false);
        Ok(patient)
    }

    /// 在患者锁内执行转换边的副作用；任一步失败时所有实体保持原样
    async fn apply_transition(&self, record: &mut PatientRecord, target: Status, payload: TransitionPayload) -> Result<()> {
        let patient_id = record.patient.id;
        let from = record.patient.status;
        let effect = self.state_machine.transition(from, target)?;
        let now = Utc::now();

        match effect {
            SideEffect::LeaveOpdQueue => {
                expect_no_payload(from, target, &payload)?;
                self.opd_queue.remove(patient_id).await?;
            }
            SideEffect::EnterDoctorQueue => {
                expect_no_payload(from, target, &payload)?;
                if record.encounter.vitals.is_none() {
                    return Err(ClinicError::PreconditionNotMet(format!(
                        "vitals must be recorded before patient {} sees the doctor",
                        record.patient.record_number
                    )));
                }
                let entry = QueueEntry::for_patient(patient_id, record.encounter.priority());
                self.doctor_queue.enqueue(entry).await?;
            }
            SideEffect::OrderLabTests => {
                let tests = match payload {
                    TransitionPayload::LabTests { tests } if !tests.is_empty() => tests,
                    other => return Err(payload_mismatch(from, target, &other)),
                };
                let seen = self.doctor_queue.remove(patient_id).await?;
                match self.lab.create_orders(patient_id, record.encounter.id, &tests).await {
                    Ok(orders) => record.encounter.lab_orders.extend(orders.iter().map(|o| o.id)),
                    Err(e) => {
                        if let Some(entry) = seen {
                            self.doctor_queue.reinstate(entry).await;
                        }
                        return Err(e);
                    }
                }
            }
            SideEffect::WritePrescriptions => {
                let requests = match payload {
                    TransitionPayload::Prescriptions { prescriptions } if !prescriptions.is_empty() => prescriptions,
                    other => return Err(payload_mismatch(from, target, &other)),
                };
                let seen = self.doctor_queue.remove(patient_id).await?;
                match self
                    .pharmacy
                    .create_prescriptions(patient_id, record.encounter.id, &requests)
                    .await
                {
                    Ok(created) => record.encounter.prescriptions.extend(created.iter().map(|p| p.id)),
                    Err(e) => {
                        if let Some(entry) = seen {
                            self.doctor_queue.reinstate(entry).await;
                        }
                        return Err(e);
                    }
                }
            }
            SideEffect::ReturnToDoctor => {
                expect_no_payload(from, target, &payload)?;
                let unsettled = self.lab.unsettled(&record.encounter.lab_orders).await?;
                if !unsettled.is_empty() {
                    let codes: Vec<&str> = unsettled.iter().map(|o| o.code.as_str()).collect();
                    return Err(ClinicError::PreconditionNotMet(format!(
                        "lab orders {} have no result yet",
                        codes.join(", ")
                    )));
                }
            }
            SideEffect::CompleteDispensing => {
                expect_no_payload(from, target, &payload)?;
                let pending = self.pharmacy.unsettled(&record.encounter.prescriptions).await?;
                if !pending.is_empty() {
                    let codes: Vec<&str> = pending.iter().map(|p| p.code.as_str()).collect();
                    return Err(ClinicError::PreconditionNotMet(format!(
                        "prescriptions {} are still pending",
                        codes.join(", ")
                    )));
                }
                record.encounter.closed_at = Some(now);
            }
            SideEffect::DischargeFromDoctor => {
                expect_no_payload(from, target, &payload)?;
                self.doctor_queue.remove(patient_id).await?;
                record.encounter.closed_at = Some(now);
            }
            SideEffect::Revisit => {
                let urgent = match payload {
                    TransitionPayload::None => false,
                    TransitionPayload::Revisit { urgent } => urgent,
                    other => return Err(payload_mismatch(from, target, &other)),
                };
                let encounter = Encounter::open(patient_id, urgent);
                self.opd_queue
                    .enqueue(QueueEntry::for_patient(patient_id, encounter.priority()))
                    .await?;
                record.encounter = encounter;
                record.patient.last_visit = now;
            }
        }

        record.patient.status = target;
        record.patient.version += 1;
        record.patient.updated_at = now;

        tracing::info!(
            "Patient {} moved {} -> {} ({:?})",
            record.patient.record_number,
            from,
            target,
            effect
        );
        Ok(())
    }

    /// 记录生命体征，仅限分诊中，每次就诊只记录一次
    pub async fn record_vitals(&self, patient_id: PatientId, vitals: Vitals) -> Result<PatientChart> {
        let mut record = self.registry.lock(patient_id).await?;
        if record.patient.status != Status::InTriage {
            return Err(ClinicError::IllegalTransition {
                from: record.patient.status.to_string(),
                to: "vitals recorded".to_string(),
            });
        }
        if record.encounter.vitals.is_some() {
            return Err(ClinicError::IllegalTransition {
                from: "vitals recorded".to_string(),
                to: "vitals recorded".to_string(),
            });
        }
        vitals.validate()?;

        let now = Utc::now();
        tracing::info!(
            "Vitals recorded for patient {}: BP {}, {:.1}C, HR {}",
            record.patient.record_number,
            vitals.blood_pressure,
            vitals.temperature_c,
            vitals.heart_rate
        );
        record.encounter.vitals = Some(vitals);
        record.encounter.vitals_recorded_at = Some(now);
        record.patient.updated_at = now;
        Ok(record.clone().into())
    }

    /// 叫号：门诊队列叫号后进入分诊；医生队列叫号仅出队
    ///
    /// 先查看队首并锁定对应患者，再在患者锁内出队，叫号失败时队列保持原样。
    pub async fn call_next(&self, department: Department) -> Result<Option<Patient>> {
        if department == Department::Lab {
            return Err(ClinicError::Validation(
                "lab queue is served through begin_processing".to_string(),
            ));
        }
        let queue = self.queue(department);

        loop {
            let head = match queue.peek().await? {
                Some(head) => head,
                None => return Ok(None),
            };
            let mut record = self.registry.lock(head.patient_id).await?;

            // 队首已被其他操作取走
            if !queue.contains(head.subject_id).await? {
                continue;
            }

            match department {
                Department::Opd => {
                    let from = record.patient.status;
                    self.apply_transition(&mut record, Status::InTriage, TransitionPayload::None)
                        .await?;
                    let patient = record.patient.clone();
                    drop(record);
                    self.publish_status_change(&patient, from, false);
                    return Ok(Some(patient));
                }
                _ => {
                    queue.remove(head.subject_id).await?;
                    tracing::info!("Doctor called patient {}", record.patient.record_number);
                    return Ok(Some(record.patient.clone()));
                }
            }
        }
    }

    /// 为检验中的患者追加检验单
    pub async fn create_lab_order(&self, patient_id: PatientId, test: &str, priority: Priority) -> Result<LabOrder> {
        let mut record = self.registry.lock(patient_id).await?;
        if record.patient.status != Status::Lab {
            return Err(ClinicError::PreconditionNotMet(format!(
                "patient {} is {}, lab orders need status Lab",
                record.patient.record_number, record.patient.status
            )));
        }

        let order = self
            .lab
            .create_order(patient_id, record.encounter.id, test, priority)
            .await?;
        record.encounter.lab_orders.push(order.id);
        record.patient.updated_at = Utc::now();
        Ok(order)
    }

    pub async fn begin_processing(&self, order_id: LabOrderId) -> Result<LabOrder> {
        self.lab.begin_processing(order_id).await
    }

    pub async fn upload_result(&self, order_id: LabOrderId, payload: &str) -> Result<LabOrder> {
        self.lab.upload_result(order_id, payload).await
    }

    pub async fn dispense(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        self.pharmacy.dispense(prescription_id).await
    }

    pub async fn cancel_prescription(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        self.pharmacy.cancel(prescription_id).await
    }

    /// 强制离院：任意状态均可，清理队列并撤销未执行的检验单和处方
    ///
    /// 等待患者锁时不设上限；已离院患者不做任何操作。
    pub async fn discharge_failsafe(&self, patient_id: PatientId) -> Result<Patient> {
        let mut record = self.registry.lock_unbounded(patient_id).await?;
        let from = record.patient.status;
        if from == Status::Discharged {
            return Ok(record.patient.clone());
        }

        self.opd_queue.evict(patient_id).await;
        self.doctor_queue.evict(patient_id).await;
        let orders = self.lab.cancel_pending(&record.encounter.lab_orders).await;
        let prescriptions = self.pharmacy.cancel_pending(&record.encounter.prescriptions).await;

        let now = Utc::now();
        record.patient.status = Status::Discharged;
        record.patient.version += 1;
        record.patient.updated_at = now;
        record.encounter.closed_at = Some(now);

        tracing::warn!(
            "Forced discharge of patient {} from {} ({} lab orders, {} prescriptions cancelled)",
            record.patient.record_number,
            from,
            orders.len(),
            prescriptions.len()
        );
        let patient = record.patient.clone();
        drop(record);

        self.publish_status_change(&patient, from, true);
        Ok(patient)
    }

    fn publish_status_change(&self, patient: &Patient, from: Status, forced: bool) {
        self.notifier.publish(ClinicEvent::PatientStatusChanged {
            patient_id: patient.id,
            from,
            to: patient.status,
            forced,
            timestamp: patient.updated_at,
        });
    }

    pub async fn restock(&self, drug_id: &str, quantity: u32, expiry: Option<NaiveDate>) -> Result<InventoryItem> {
        self.inventory.restock(drug_id, quantity, expiry).await
    }

    pub async fn add_inventory_item(&self, item: InventoryItem) -> Result<InventoryItem> {
        self.inventory.add_item(item).await
    }

    /// 效期巡检，未指定日期时使用当天
    pub async fn expiry_sweep(&self, today: Option<NaiveDate>) -> Result<Vec<ExpiryFlag>> {
        let today = today.unwrap_or_else(|| Utc::now().date_naive());
        self.inventory
            .expiry_sweep(today, self.settings.expiry_warning_days)
            .await
    }

    // ---- 查询 ----

    pub async fn get_patient(&self, patient_id: PatientId) -> Result<Patient> {
        self.registry.get(patient_id).await
    }

    pub async fn get_chart(&self, patient_id: PatientId) -> Result<PatientChart> {
        Ok(self.registry.get_record(patient_id).await?.into())
    }

    pub async fn list_patients(&self) -> Result<Vec<Patient>> {
        self.registry.list().await
    }

    /// 按姓名、电话、病历号或患者 ID 检索患者
    pub async fn search_patients(&self, term: &str) -> Result<Vec<Patient>> {
        self.registry.search(term).await
    }

    /// 患者当前状态下可推进到的目标状态，不含强制离院
    pub async fn possible_transitions(&self, patient_id: PatientId) -> Result<Vec<Status>> {
        let status = self.registry.get(patient_id).await?.status;
        Ok(self.state_machine.get_possible_targets(status))
    }

    pub async fn list_queue(&self, department: Department) -> Result<Vec<QueueEntry>> {
        self.queue(department).entries().await
    }

    pub async fn list_active_lab_orders(&self) -> Result<Vec<LabOrder>> {
        self.lab.active_orders().await
    }

    pub async fn get_lab_order(&self, order_id: LabOrderId) -> Result<LabOrder> {
        self.lab.get(order_id).await
    }

    pub async fn equipment_status(&self) -> Result<Vec<EquipmentStatus>> {
        self.lab.equipment_status().await
    }

    pub async fn list_pending_prescriptions(&self) -> Result<Vec<Prescription>> {
        self.pharmacy.pending_prescriptions().await
    }

    pub async fn get_prescription(&self, prescription_id: PrescriptionId) -> Result<Prescription> {
        self.pharmacy.get(prescription_id).await
    }

    pub async fn get_inventory_level(&self, drug_id: &str) -> Result<InventoryItem> {
        self.inventory.level(drug_id).await
    }

    pub async fn list_inventory(&self) -> Result<Vec<InventoryItem>> {
        self.inventory.items().await
    }

    // ---- 快照 ----

    /// 导出全部状态；各部分依次读取，不是全局一致的时间点
    pub async fn snapshot(&self) -> Result<ClinicSnapshot> {
        let patients = self.registry.records().await?;
        let (lab_orders, next_lab_code) = self.lab.export().await?;
        let prescriptions = self.pharmacy.prescriptions().await?;
        let inventory = self.inventory.items().await?;

        let mut queues = Vec::new();
        for department in [Department::Opd, Department::Doctor, Department::Lab] {
            queues.push(QueueSnapshot {
                department,
                entries: self.queue(department).entries().await?,
            });
        }

        Ok(ClinicSnapshot {
            taken_at: Utc::now(),
            patients,
            lab_orders,
            prescriptions,
            inventory,
            queues,
            sequences: Sequences {
                patients: self.registry.next_record_number(),
                lab_orders: next_lab_code,
                prescriptions: self.pharmacy.next_code(),
            },
        })
    }

    /// 从快照恢复，只能用于尚未登记任何患者的引擎
    pub async fn restore(&self, snapshot: ClinicSnapshot) -> Result<()> {
        if self.registry.len().await > 0 {
            return Err(ClinicError::Validation(
                "snapshot can only be restored into an empty engine".to_string(),
            ));
        }

        let counts = (snapshot.patients.len(), snapshot.lab_orders.len(), snapshot.prescriptions.len());
        self.registry
            .restore(snapshot.patients, snapshot.sequences.patients)
            .await;
        self.lab
            .restore(snapshot.lab_orders, snapshot.sequences.lab_orders)
            .await;
        self.pharmacy
            .restore(snapshot.prescriptions, snapshot.sequences.prescriptions)
            .await;
        self.inventory.restore(snapshot.inventory).await;
        for queue in snapshot.queues {
            let manager = self.queue(queue.department);
            for entry in queue.entries {
                manager.reinstate(entry).await;
            }
        }

        tracing::info!(
            "Restored snapshot from {}: {} patients, {} lab orders, {} prescriptions",
            snapshot.taken_at,
            counts.0,
            counts.1,
            counts.2
        );
        Ok(())
    }
}

fn expect_no_payload(from: Status, to: Status, payload: &TransitionPayload) -> Result<()> {
    match payload {
        TransitionPayload::None => Ok(()),
        other => Err(payload_mismatch(from, to, other)),
    }
}

fn payload_mismatch(from: Status, to: Status, payload: &TransitionPayload) -> ClinicError {
    ClinicError::Validation(format!(
        "payload '{}' does not fit transition {} -> {}",
        payload.kind(),
        from,
        to
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryNotifier;
    use chrono::Duration as ChronoDuration;
    use clinic_core::{BloodPressure, ErrorKind, Gender, LabOrderStatus, PrescriptionStatus};

    fn engine() -> (WorkflowEngine, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let engine = WorkflowEngine::new(EngineSettings::default(), notifier.clone());
        (engine, notifier)
    }

    fn demographics(name: &str, urgent: bool) -> Demographics {
        Demographics {
            name: name.to_string(),
            age: 34,
            gender: Gender::Female,
            phone: "+251 911 000 111".to_string(),
            urgent,
        }
    }

    fn vitals() -> Vitals {
        Vitals {
            blood_pressure: BloodPressure { systolic: 118, diastolic: 76 },
            temperature_c: 37.1,
            heart_rate: 80,
            weight_kg: 61.5,
            chief_complaint: "Cough and fever".to_string(),
        }
    }

    async fn with_doctor(engine: &WorkflowEngine, name: &str) -> PatientId {
        let id = engine.register_patient(demographics(name, false)).await.unwrap().id;
        engine.advance(id, Status::InTriage, TransitionPayload::None).await.unwrap();
        engine.record_vitals(id, vitals()).await.unwrap();
        engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_registration_enqueues_by_urgency() {
        let (engine, _) = engine();
        let normal = engine.register_patient(demographics("Hana", false)).await.unwrap();
        let urgent = engine.register_patient(demographics("Dawit", true)).await.unwrap();

        assert_eq!(normal.status, Status::Waiting);
        assert_eq!(normal.version, 1);
        let queue = engine.list_queue(Department::Opd).await.unwrap();
        assert_eq!(queue[0].patient_id, urgent.id);
        assert_eq!(queue[1].patient_id, normal.id);
    }

    #[tokio::test]
    async fn test_triage_requires_vitals() {
        let (engine, _) = engine();
        let id = engine.register_patient(demographics("Hana", false)).await.unwrap().id;
        engine.advance(id, Status::InTriage, TransitionPayload::None).await.unwrap();

        let err = engine
            .advance(id, Status::WithDoctor, TransitionPayload::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionNotMetError);

        engine.record_vitals(id, vitals()).await.unwrap();
        let err = engine.record_vitals(id, vitals()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalTransitionError);

        let patient = engine.advance(id, Status::WithDoctor, TransitionPayload::None).await.unwrap();
        assert_eq!(patient.version, 3);
        assert_eq!(engine.list_queue(Department::Doctor).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_chief_complaint_recorded_with_vitals() {
        let (engine, _) = engine();
        let id = engine.register_patient(demographics("Hana", false)).await.unwrap().id;
        engine.advance(id, Status::InTriage, TransitionPayload::None).await.unwrap();

        let silent = Vitals {
            chief_complaint: " ".to_string(),
            ..vitals()
        };
        let err = engine.record_vitals(id, silent).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        assert!(engine.get_chart(id).await.unwrap().encounter.vitals.is_none());

        let chart = engine.record_vitals(id, vitals()).await.unwrap();
        assert_eq!(chart.encounter.vitals.unwrap().chief_complaint, "Cough and fever");

        // 主诉随体征一次写入，之后不可改写
        let amended = Vitals {
            chief_complaint: "Rash".to_string(),
            ..vitals()
        };
        assert!(engine.record_vitals(id, amended).await.is_err());
        let stored = engine.get_chart(id).await.unwrap().encounter.vitals.unwrap();
        assert_eq!(stored.chief_complaint, "Cough and fever");
    }

    #[tokio::test]
    async fn test_possible_transitions_follow_status() {
        let (engine, _) = engine();
        let id = engine.register_patient(demographics("Hana", false)).await.unwrap().id;
        assert_eq!(engine.possible_transitions(id).await.unwrap(), vec![Status::InTriage]);

        let id = with_doctor(&engine, "Dawit").await;
        assert_eq!(
            engine.possible_transitions(id).await.unwrap(),
            vec![Status::Lab, Status::Pharmacy, Status::Discharged]
        );

        let err = engine.possible_transitions(uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFoundError);
    }

    #[tokio::test]
    async fn test_search_patients_by_record_number() {
        let (engine, _) = engine();
        engine.register_patient(demographics("Hana", false)).await.unwrap();
        let dawit = engine.register_patient(demographics("Dawit", false)).await.unwrap();

        let found = engine.search_patients("P-0002").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, dawit.id);
        assert_eq!(engine.search_patients("911 000").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_payload_must_match_edge() {
        let (engine, _) = engine();
        let id = with_doctor(&engine, "Hana").await;

        let err = engine.advance(id, Status::Lab, TransitionPayload::None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
        let err = engine
            .advance(id, Status::Lab, TransitionPayload::LabTests { tests: vec![] })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);

        assert_eq!(engine.get_patient(id).await.unwrap().status, Status::WithDoctor);
        assert_eq!(engine.list_queue(Department::Doctor).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_drug_restores_doctor_queue() {
        let (engine, _) = engine();
        let expiry = Utc::now().date_naive() + ChronoDuration::days(90);
        engine
            .add_inventory_item(InventoryItem::new("AMX-250", "Amoxicillin 250mg", 30, expiry))
            .await
            .unwrap();
        let id = with_doctor(&engine, "Hana").await;

        let prescription = |drug_id: &str| PrescriptionRequest {
            drug_id: drug_id.to_string(),
            units: 1,
            dosage: "once".to_string(),
            prescriber: "Dr. Alemu".to_string(),
        };
        let payload = TransitionPayload::Prescriptions {
            prescriptions: vec![prescription("AMX-250"), prescription("NOPE")],
        };
        let err = engine.advance(id, Status::Pharmacy, payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFoundError);
        assert_eq!(engine.get_patient(id).await.unwrap().status, Status::WithDoctor);
        // 批次中的合法处方也不会留下
        assert!(engine.list_pending_prescriptions().await.unwrap().is_empty());
        assert!(engine.get_chart(id).await.unwrap().encounter.prescriptions.is_empty());
        assert!(engine
            .list_queue(Department::Doctor)
            .await
            .unwrap()
            .iter()
            .any(|e| e.patient_id == id));
    }

    #[tokio::test]
    async fn test_pharmacy_discharge_flow() {
        let (engine, notifier) = engine();
        let expiry = Utc::now().date_naive() + ChronoDuration::days(200);
        engine
            .add_inventory_item(InventoryItem::new("PCM-500", "Paracetamol 500mg", 50, expiry))
            .await
            .unwrap();
        let id = with_doctor(&engine, "Hana").await;

        let payload = TransitionPayload::Prescriptions {
            prescriptions: vec![PrescriptionRequest {
                drug_id: "PCM-500".to_string(),
                units: 10,
                dosage: "1 tab every 6h".to_string(),
                prescriber: "Dr. Alemu".to_string(),
            }],
        };
        engine.advance(id, Status::Pharmacy, payload).await.unwrap();
        assert!(engine.list_queue(Department::Doctor).await.unwrap().is_empty());

        let err = engine
            .advance(id, Status::Discharged, TransitionPayload::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PreconditionNotMetError);

        let rx = engine.list_pending_prescriptions().await.unwrap().remove(0);
        let rx = engine.dispense(rx.id).await.unwrap();
        assert_eq!(rx.status, PrescriptionStatus::Dispensed);
        assert_eq!(engine.get_inventory_level("PCM-500").await.unwrap().quantity, 40);

        let patient = engine.advance(id, Status::Discharged, TransitionPayload::None).await.unwrap();
        assert_eq!(patient.status, Status::Discharged);
        assert!(engine.get_chart(id).await.unwrap().encounter.closed_at.is_some());

        let events = notifier.drain();
        assert!(events.iter().any(|e| e.name() == "PrescriptionDispensed"));
        assert_eq!(events.iter().filter(|e| e.name() == "PatientStatusChanged").count(), 4);
    }

    #[tokio::test]
    async fn test_call_next_moves_head_into_triage() {
        let (engine, _) = engine();
        assert!(engine.call_next(Department::Opd).await.unwrap().is_none());

        let first = engine.register_patient(demographics("Hana", false)).await.unwrap();
        engine.register_patient(demographics("Dawit", false)).await.unwrap();

        let called = engine.call_next(Department::Opd).await.unwrap().unwrap();
        assert_eq!(called.id, first.id);
        assert_eq!(called.status, Status::InTriage);
        assert_eq!(engine.list_queue(Department::Opd).await.unwrap().len(), 1);

        let err = engine.call_next(Department::Lab).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_failsafe_cancels_open_work() {
        let (engine, notifier) = engine();
        let id = with_doctor(&engine, "Hana").await;
        let tests = vec![LabTestRequest {
            test: "Malaria Smear".to_string(),
            priority: Priority::Normal,
        }];
        engine
            .advance(id, Status::Lab, TransitionPayload::LabTests { tests })
            .await
            .unwrap();
        let order = engine.list_active_lab_orders().await.unwrap().remove(0);
        notifier.drain();

        let patient = engine.discharge_failsafe(id).await.unwrap();
        assert_eq!(patient.status, Status::Discharged);
        assert_eq!(engine.get_lab_order(order.id).await.unwrap().status, LabOrderStatus::Cancelled);
        assert!(engine.list_queue(Department::Lab).await.unwrap().is_empty());

        let events = notifier.drain();
        assert!(matches!(events[0], ClinicEvent::PatientStatusChanged { forced: true, .. }));

        // 已离院时再次强制离院不产生事件
        engine.discharge_failsafe(id).await.unwrap();
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn test_revisit_opens_new_encounter() {
        let (engine, _) = engine();
        let id = with_doctor(&engine, "Hana").await;
        let before = engine.get_chart(id).await.unwrap().encounter.id;
        engine.advance(id, Status::Discharged, TransitionPayload::None).await.unwrap();

        engine
            .advance(id, Status::Waiting, TransitionPayload::Revisit { urgent: true })
            .await
            .unwrap();
        let chart = engine.get_chart(id).await.unwrap();
        assert_ne!(chart.encounter.id, before);
        assert!(chart.encounter.vitals.is_none());
        assert_eq!(engine.list_queue(Department::Opd).await.unwrap()[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (engine, _) = engine();
        let patient = engine.register_patient(demographics("Hana", false)).await.unwrap();

        let err = engine
            .advance_if_version(patient.id, 7, Status::InTriage, TransitionPayload::None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentModificationError);

        let moved = engine
            .advance_if_version(patient.id, patient.version, Status::InTriage, TransitionPayload::None)
            .await
            .unwrap();
        assert_eq!(moved.version, 2);
    }

    #[tokio::test]
    async fn test_snapshot_restore_keeps_sequences() {
        let (engine, _) = engine();
        engine.register_patient(demographics("Hana", false)).await.unwrap();
        let snapshot = engine.snapshot().await.unwrap();

        let (restored, _) = self::engine();
        restored.restore(snapshot).await.unwrap();
        assert_eq!(restored.list_queue(Department::Opd).await.unwrap().len(), 1);

        let next = restored.register_patient(demographics("Dawit", false)).await.unwrap();
        assert_eq!(next.record_number, "P-0002");

        let snapshot = restored.snapshot().await.unwrap();
        let err = restored.restore(snapshot).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }
}
