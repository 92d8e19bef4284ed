//! # 诊所患者流转工作流模块
//!
//! 提供诊所患者流转的完整后端能力，包括：
//! - 患者状态机：管理患者从登记到离院的状态转换
//! - 排队管理：按优先级和到达时间维护各科室候诊队列
//! - 检验单跟踪：管理检验单生命周期和检验设备占用
//! - 药房发药：以原子方式扣减库存并完成处方
//! - 领域事件：向外部通知组件推送状态变化
//! - 快照存储：以 JSON 文件保存和恢复全部状态

mod lock;

pub mod engine;
pub mod events;
pub mod inventory;
pub mod lab;
pub mod pharmacy;
pub mod queue;
pub mod registry;
pub mod service;
pub mod settings;
pub mod state_machine;
pub mod store;

// 重新导出主要类型
pub use engine::{PatientChart, TransitionPayload, WorkflowEngine};
pub use events::{BroadcastNotifier, ClinicEvent, EventNotifier, MemoryNotifier, TracingNotifier};
pub use inventory::{ExpiryFlag, InventoryLedger};
pub use lab::{EquipmentStatus, LabOrderTracker};
pub use pharmacy::PharmacyDispenser;
pub use queue::QueueManager;
pub use registry::{PatientRecord, PatientRegistry};
pub use service::{ClinicService, Command, Query, Request, Response, Snapshot, VitalsInput};
pub use settings::{EngineSettings, LabRouting};
pub use state_machine::{PatientStateMachine, SideEffect};
pub use store::{ClinicSnapshot, JsonFileStore, QueueSnapshot, Sequences, SnapshotStore};
