//! 命令与查询接口
//!
//! 界面层通过 JSON 形式的命令和查询访问引擎，每个请求得到成功快照或结构化错误。

use crate::engine::{PatientChart, TransitionPayload, WorkflowEngine};
use crate::inventory::ExpiryFlag;
use crate::lab::EquipmentStatus;
use chrono::NaiveDate;
use clinic_core::utils::parse_blood_pressure;
use clinic_core::{
    ClinicError, Demographics, Department, DrugId, ErrorKind, InventoryItem, LabOrder, LabOrderId, Patient, PatientId,
    Prescription, PrescriptionId, Priority, QueueEntry, Result, Status, Vitals,
};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// 终端录入的生命体征，血压为 `120/80` 形式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VitalsInput {
    pub blood_pressure: String,
    pub temperature_c: f32,
    pub heart_rate: u16,
    pub weight_kg: f32,
    pub chief_complaint: String,
}

impl VitalsInput {
    pub fn into_vitals(self) -> Result<Vitals> {
        Ok(Vitals {
            blood_pressure: parse_blood_pressure(&self.blood_pressure)?,
            temperature_c: self.temperature_c,
            heart_rate: self.heart_rate,
            weight_kg: self.weight_kg,
            chief_complaint: self.chief_complaint.trim().to_string(),
        })
    }
}

/// 修改状态的命令
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    RegisterPatient {
        demographics: Demographics,
    },
    Advance {
        patient_id: PatientId,
        target: Status,
        #[serde(default)]
        payload: TransitionPayload,
        /// 提供时按版本校验
        #[serde(default)]
        expected_version: Option<u64>,
    },
    RecordVitals {
        patient_id: PatientId,
        vitals: VitalsInput,
    },
    CallNext {
        department: Department,
    },
    CreateLabOrder {
        patient_id: PatientId,
        test: String,
        #[serde(default)]
        priority: Priority,
    },
    BeginProcessing {
        order_id: LabOrderId,
    },
    UploadResult {
        order_id: LabOrderId,
        payload: String,
    },
    Dispense {
        prescription_id: PrescriptionId,
    },
    CancelPrescription {
        prescription_id: PrescriptionId,
    },
    DischargeFailsafe {
        patient_id: PatientId,
    },
    Restock {
        drug_id: DrugId,
        quantity: u32,
        #[serde(default)]
        expiry: Option<NaiveDate>,
    },
    AddInventoryItem {
        drug_id: DrugId,
        name: String,
        quantity: u32,
        expiry: NaiveDate,
    },
    ExpirySweep {
        #[serde(default)]
        today: Option<NaiveDate>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterPatient { .. } => "register_patient",
            Command::Advance { .. } => "advance",
            Command::RecordVitals { .. } => "record_vitals",
            Command::CallNext { .. } => "call_next",
            Command::CreateLabOrder { .. } => "create_lab_order",
            Command::BeginProcessing { .. } => "begin_processing",
            Command::UploadResult { .. } => "upload_result",
            Command::Dispense { .. } => "dispense",
            Command::CancelPrescription { .. } => "cancel_prescription",
            Command::DischargeFailsafe { .. } => "discharge_failsafe",
            Command::Restock { .. } => "restock",
            Command::AddInventoryItem { .. } => "add_inventory_item",
            Command::ExpirySweep { .. } => "expiry_sweep",
        }
    }
}

/// 只读查询
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
pub enum Query {
    GetPatient { patient_id: PatientId },
    GetChart { patient_id: PatientId },
    ListPatients,
    /// 按姓名、电话、病历号或患者 ID 检索
    SearchPatients { term: String },
    /// 患者当前可推进到的状态
    PossibleTransitions { patient_id: PatientId },
    ListQueue { department: Department },
    ListActiveLabOrders,
    EquipmentStatus,
    ListPendingPrescriptions,
    GetInventoryLevel { drug_id: DrugId },
    ListInventory,
}

/// 一行请求：命令或查询
///
/// 先按 `command` / `query` 字段确定类别，再解码对应枚举，错误信息指向具体字段。
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Request {
    Command(Command),
    Query(Query),
}

impl TryFrom<Value> for Request {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> std::result::Result<Self, Self::Error> {
        let has_command = value.get("command").is_some();
        let has_query = value.get("query").is_some();
        match (has_command, has_query) {
            (true, false) => Ok(Request::Command(serde_json::from_value(value)?)),
            (false, true) => Ok(Request::Query(serde_json::from_value(value)?)),
            (true, true) => Err(de::Error::custom("request has both `command` and `query` fields")),
            (false, false) => Err(de::Error::custom("request needs a `command` or `query` field")),
        }
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Request::try_from(value).map_err(de::Error::custom)
    }
}

impl Request {
    pub fn is_command(&self) -> bool {
        matches!(self, Request::Command(_))
    }
}

/// 成功结果携带的实体快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Snapshot {
    Patient(Patient),
    Patients(Vec<Patient>),
    Transitions(Vec<Status>),
    Chart(PatientChart),
    /// 叫号结果，队列为空时为 null
    Called(Option<Patient>),
    Queue(Vec<QueueEntry>),
    LabOrder(LabOrder),
    LabOrders(Vec<LabOrder>),
    Equipment(Vec<EquipmentStatus>),
    Prescription(Prescription),
    Prescriptions(Vec<Prescription>),
    InventoryItem(InventoryItem),
    Inventory(Vec<InventoryItem>),
    ExpiryFlags(Vec<ExpiryFlag>),
}

/// 请求结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok { data: Snapshot },
    Error { kind: ErrorKind, message: String },
}

impl Response {
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

impl From<Result<Snapshot>> for Response {
    fn from(result: Result<Snapshot>) -> Self {
        match result {
            Ok(data) => Response::Ok { data },
            Err(e) => Response::Error {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

/// 引擎门面
#[derive(Debug, Clone)]
pub struct ClinicService {
    engine: Arc<WorkflowEngine>,
}

impl ClinicService {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// 解析一行 JSON 请求
    pub fn parse(line: &str) -> Result<Request> {
        serde_json::from_str::<Value>(line)
            .and_then(Request::try_from)
            .map_err(|e| {
                tracing::warn!("Rejected malformed request: {}", e);
                ClinicError::Validation(format!("malformed request: {}", e))
            })
    }

    /// 将响应编码为一行 JSON
    pub fn encode(response: &Response) -> String {
        serde_json::to_string(response).unwrap_or_else(|e| {
            format!(
                r#"{{"status":"error","kind":"InternalError","message":"{}"}}"#,
                e.to_string().replace('"', "'")
            )
        })
    }

    /// 处理一行 JSON 请求并返回一行 JSON 响应
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match Self::parse(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => e.into(),
        };
        Self::encode(&response)
    }

    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Command(command) => self.execute(command).await,
            Request::Query(query) => self.query(query).await,
        }
    }

    /// 执行命令
    pub async fn execute(&self, command: Command) -> Response {
        let name = command.name();
        tracing::debug!("Executing command {}", name);
        let result = self.run_command(command).await;
        if let Err(e) = &result {
            tracing::warn!("Command {} failed: {}", name, e);
        }
        result.into()
    }

    /// 执行查询
    pub async fn query(&self, query: Query) -> Response {
        self.run_query(query).await.into()
    }

    async fn run_command(&self, command: Command) -> Result<Snapshot> {
        let engine = &self.engine;
        let data = match command {
            Command::RegisterPatient { demographics } => Snapshot::Patient(engine.register_patient(demographics).await?),
            Command::Advance {
                patient_id,
                target,
                payload,
                expected_version,
            } => {
                let patient = match expected_version {
                    Some(version) => engine.advance_if_version(patient_id, version, target, payload).await?,
                    None => engine.advance(patient_id, target, payload).await?,
                };
                Snapshot::Patient(patient)
            }
            Command::RecordVitals { patient_id, vitals } => {
                Snapshot::Chart(engine.record_vitals(patient_id, vitals.into_vitals()?).await?)
            }
            Command::CallNext { department } => Snapshot::Called(engine.call_next(department).await?),
            Command::CreateLabOrder {
                patient_id,
                test,
                priority,
            } => Snapshot::LabOrder(engine.create_lab_order(patient_id, &test, priority).await?),
            Command::BeginProcessing { order_id } => Snapshot::LabOrder(engine.begin_processing(order_id).await?),
            Command::UploadResult { order_id, payload } => {
                Snapshot::LabOrder(engine.upload_result(order_id, &payload).await?)
            }
            Command::Dispense { prescription_id } => Snapshot::Prescription(engine.dispense(prescription_id).await?),
            Command::CancelPrescription { prescription_id } => {
                Snapshot::Prescription(engine.cancel_prescription(prescription_id).await?)
            }
            Command::DischargeFailsafe { patient_id } => {
                Snapshot::Patient(engine.discharge_failsafe(patient_id).await?)
            }
            Command::Restock {
                drug_id,
                quantity,
                expiry,
            } => Snapshot::InventoryItem(engine.restock(&drug_id, quantity, expiry).await?),
            Command::AddInventoryItem {
                drug_id,
                name,
                quantity,
                expiry,
            } => {
                let item = InventoryItem::new(drug_id, name, quantity, expiry);
                Snapshot::InventoryItem(engine.add_inventory_item(item).await?)
            }
            Command::ExpirySweep { today } => Snapshot::ExpiryFlags(engine.expiry_sweep(today).await?),
        };
        Ok(data)
    }

    async fn run_query(&self, query: Query) -> Result<Snapshot> {
        let engine = &self.engine;
        let data = match query {
            Query::GetPatient { patient_id } => Snapshot::Patient(engine.get_patient(patient_id).await?),
            Query::GetChart { patient_id } => Snapshot::Chart(engine.get_chart(patient_id).await?),
            Query::ListPatients => Snapshot::Patients(engine.list_patients().await?),
            Query::SearchPatients { term } => Snapshot::Patients(engine.search_patients(&term).await?),
            Query::PossibleTransitions { patient_id } => {
                Snapshot::Transitions(engine.possible_transitions(patient_id).await?)
            }
            Query::ListQueue { department } => Snapshot::Queue(engine.list_queue(department).await?),
            Query::ListActiveLabOrders => Snapshot::LabOrders(engine.list_active_lab_orders().await?),
            Query::EquipmentStatus => Snapshot::Equipment(engine.equipment_status().await?),
            Query::ListPendingPrescriptions => Snapshot::Prescriptions(engine.list_pending_prescriptions().await?),
            Query::GetInventoryLevel { drug_id } => {
                Snapshot::InventoryItem(engine.get_inventory_level(&drug_id).await?)
            }
            Query::ListInventory => Snapshot::Inventory(engine.list_inventory().await?),
        };
        Ok(data)
    }
}

impl From<ClinicError> for Response {
    fn from(e: ClinicError) -> Self {
        Err::<Snapshot, _>(e).into()
    }
}
