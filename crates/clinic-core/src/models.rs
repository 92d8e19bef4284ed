//! 核心数据模型定义

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClinicError, Result};
use crate::utils;

pub type PatientId = Uuid;
pub type EncounterId = Uuid;
pub type LabOrderId = Uuid;
pub type PrescriptionId = Uuid;
/// 药品编码，例如 `AMX-500`
pub type DrugId = String;

/// 患者年龄上限
pub const MAX_PATIENT_AGE: u32 = 150;

/// 性别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Gender {
    Male,
    Female,
    Other,
}

/// 患者在诊所内的流转状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Status {
    Waiting,    // 候诊
    InTriage,   // 分诊中
    WithDoctor, // 医生诊室
    Lab,        // 检验科
    Pharmacy,   // 药房
    Discharged, // 已离院
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Waiting,
        Status::InTriage,
        Status::WithDoctor,
        Status::Lab,
        Status::Pharmacy,
        Status::Discharged,
    ];
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Status::Waiting => "Waiting",
            Status::InTriage => "In Triage",
            Status::WithDoctor => "With Doctor",
            Status::Lab => "Lab",
            Status::Pharmacy => "Pharmacy",
            Status::Discharged => "Discharged",
        };
        f.write_str(label)
    }
}

/// 登记时提交的人口学信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Demographics {
    pub name: String,
    pub age: u32,
    pub gender: Gender,
    pub phone: String,
    /// 急诊标记，决定候诊队列优先级
    #[serde(default)]
    pub urgent: bool,
}

impl Demographics {
    /// 校验必填字段与取值范围
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ClinicError::Validation("patient name is required".to_string()));
        }
        if self.phone.trim().is_empty() {
            return Err(ClinicError::Validation("phone number is required".to_string()));
        }
        if !utils::is_valid_phone(&self.phone) {
            return Err(ClinicError::Validation(format!(
                "phone number '{}' is malformed",
                self.phone
            )));
        }
        if self.age > MAX_PATIENT_AGE {
            return Err(ClinicError::Validation(format!(
                "age {} is out of range 0-{}",
                self.age, MAX_PATIENT_AGE
            )));
        }
        Ok(())
    }
}

/// 患者基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub record_number: String, // 病历号，例如 P-0001
    pub name: String,
    pub age: u32,
    pub gender: Gender,
    pub phone: String,
    pub status: Status,
    pub last_visit: DateTime<Utc>,
    /// 每次状态变更递增，用于乐观并发校验
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 血压
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BloodPressure {
    pub systolic: u16,
    pub diastolic: u16,
}

impl std::fmt::Display for BloodPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.systolic, self.diastolic)
    }
}

/// 生命体征
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vitals {
    pub blood_pressure: BloodPressure,
    pub temperature_c: f32,
    pub heart_rate: u16,
    pub weight_kg: f32,
    /// 主诉，分诊时与体征一并记录
    pub chief_complaint: String,
}

impl Vitals {
    pub fn validate(&self) -> Result<()> {
        if self.chief_complaint.trim().is_empty() {
            return Err(ClinicError::Validation("chief complaint is required".to_string()));
        }
        let bp = self.blood_pressure;
        if bp.systolic == 0 || bp.diastolic == 0 || bp.systolic <= bp.diastolic || bp.systolic > 300 {
            return Err(ClinicError::Validation(format!("blood pressure {} is out of range", bp)));
        }
        if !(25.0..=45.0).contains(&self.temperature_c) {
            return Err(ClinicError::Validation(format!(
                "temperature {} is out of range 25-45",
                self.temperature_c
            )));
        }
        if !(20..=250).contains(&self.heart_rate) {
            return Err(ClinicError::Validation(format!(
                "heart rate {} is out of range 20-250",
                self.heart_rate
            )));
        }
        if !(0.5..=400.0).contains(&self.weight_kg) {
            return Err(ClinicError::Validation(format!(
                "weight {} is out of range 0.5-400",
                self.weight_kg
            )));
        }
        Ok(())
    }
}

/// 就诊记录：一次到院对应一个就诊，约束其体征、检验单和处方
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encounter {
    pub id: EncounterId,
    pub patient_id: PatientId,
    pub started_at: DateTime<Utc>,
    pub urgent: bool,
    pub vitals: Option<Vitals>,
    pub vitals_recorded_at: Option<DateTime<Utc>>,
    pub lab_orders: Vec<LabOrderId>,
    pub prescriptions: Vec<PrescriptionId>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Encounter {
    pub fn open(patient_id: PatientId, urgent: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            patient_id,
            started_at: Utc::now(),
            urgent,
            vitals: None,
            vitals_recorded_at: None,
            lab_orders: Vec::new(),
            prescriptions: Vec::new(),
            closed_at: None,
        }
    }

    pub fn priority(&self) -> Priority {
        if self.urgent {
            Priority::High
        } else {
            Priority::Normal
        }
    }
}

/// 排队优先级，High 排在 Normal 之前
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    High,
    #[default]
    Normal,
}

/// 科室队列
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Department {
    Opd,    // 门诊候诊
    Doctor, // 医生诊室
    Lab,    // 检验设备队列
}

impl std::fmt::Display for Department {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Department::Opd => f.write_str("opd"),
            Department::Doctor => f.write_str("doctor"),
            Department::Lab => f.write_str("lab"),
        }
    }
}

/// 队列条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueEntry {
    /// 排队对象：科室队列为患者ID，检验队列为检验单ID
    pub subject_id: Uuid,
    pub patient_id: PatientId,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
    /// 入队序号，时间戳相同时保证先进先出
    #[serde(default)]
    pub sequence: u64,
}

impl QueueEntry {
    pub fn for_patient(patient_id: PatientId, priority: Priority) -> Self {
        Self {
            subject_id: patient_id,
            patient_id,
            priority,
            enqueued_at: Utc::now(),
            sequence: 0,
        }
    }

    pub fn for_lab_order(order_id: LabOrderId, patient_id: PatientId, priority: Priority) -> Self {
        Self {
            subject_id: order_id,
            patient_id,
            priority,
            enqueued_at: Utc::now(),
            sequence: 0,
        }
    }
}

/// 检验单状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LabOrderStatus {
    PendingCollection, // 待采样
    InProcess,         // 检测中
    Resulted,          // 已出结果
    Cancelled,         // 已撤销（仅限强制离院）
}

impl LabOrderStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, LabOrderStatus::Resulted | LabOrderStatus::Cancelled)
    }
}

/// 检验结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabResult {
    pub payload: String,
    pub uploaded_at: DateTime<Utc>,
}

/// 检验单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabOrder {
    pub id: LabOrderId,
    pub code: String, // 例如 LB-0001
    pub patient_id: PatientId,
    pub encounter_id: EncounterId,
    pub test: String,
    pub priority: Priority,
    pub equipment: String,
    pub status: LabOrderStatus,
    pub result: Option<LabResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 医生开立检验时提交的项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabTestRequest {
    pub test: String,
    #[serde(default)]
    pub priority: Priority,
}

/// 处方状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PrescriptionStatus {
    Pending,
    Dispensed,
    Cancelled,
}

/// 处方
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prescription {
    pub id: PrescriptionId,
    pub code: String, // 例如 RX-0001
    pub patient_id: PatientId,
    pub encounter_id: EncounterId,
    pub drug_id: DrugId,
    /// 发药时需要扣减的库存数量
    pub units: u32,
    pub dosage: String,
    pub prescriber: String,
    pub status: PrescriptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispensed_at: Option<DateTime<Utc>>,
}

/// 医生开立处方时提交的内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrescriptionRequest {
    pub drug_id: DrugId,
    pub units: u32,
    pub dosage: String,
    pub prescriber: String,
}

impl PrescriptionRequest {
    pub fn validate(&self) -> Result<()> {
        if self.units == 0 {
            return Err(ClinicError::Validation(format!(
                "prescription for {} must dispense at least one unit",
                self.drug_id
            )));
        }
        if self.dosage.trim().is_empty() || self.prescriber.trim().is_empty() {
            return Err(ClinicError::Validation(
                "dosage and prescriber are required".to_string(),
            ));
        }
        Ok(())
    }
}

/// 药品库存
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub drug_id: DrugId,
    pub name: String,
    pub quantity: u32,
    pub expiry: NaiveDate,
    /// 由效期巡检标记，临近有效期
    #[serde(default)]
    pub expiring_soon: bool,
    pub updated_at: DateTime<Utc>,
}

impl InventoryItem {
    pub fn new(drug_id: impl Into<String>, name: impl Into<String>, quantity: u32, expiry: NaiveDate) -> Self {
        Self {
            drug_id: drug_id.into(),
            name: name.into(),
            quantity,
            expiry,
            expiring_soon: false,
            updated_at: Utc::now(),
        }
    }

    /// 有效期当天及之后视为过期
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry <= today
    }
}
