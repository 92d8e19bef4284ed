//! 患者状态机
//!
//! 管理患者从登记到离院的状态转换，每条合法边绑定一个副作用

use clinic_core::{ClinicError, Result, Status};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 状态转换附带的副作用
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SideEffect {
    LeaveOpdQueue,       // 开始分诊，离开门诊候诊队列
    EnterDoctorQueue,    // 分诊完成，进入医生队列
    OrderLabTests,       // 医生开立检验
    WritePrescriptions,  // 医生开立处方
    ReturnToDoctor,      // 检验完成，回到医生复诊
    CompleteDispensing,  // 处方全部完成后离院
    DischargeFromDoctor, // 医生直接安排离院
    Revisit,             // 已离院患者再次就诊
}

/// 患者状态机
#[derive(Debug)]
pub struct PatientStateMachine {
    transitions: HashMap<(Status, Status), SideEffect>,
}

impl PatientStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((Status::Waiting, Status::InTriage), SideEffect::LeaveOpdQueue);
        transitions.insert((Status::InTriage, Status::WithDoctor), SideEffect::EnterDoctorQueue);
        transitions.insert((Status::WithDoctor, Status::Lab), SideEffect::OrderLabTests);
        transitions.insert((Status::WithDoctor, Status::Pharmacy), SideEffect::WritePrescriptions);
        transitions.insert((Status::Lab, Status::WithDoctor), SideEffect::ReturnToDoctor);
        transitions.insert((Status::Pharmacy, Status::Discharged), SideEffect::CompleteDispensing);
        transitions.insert((Status::WithDoctor, Status::Discharged), SideEffect::DischargeFromDoctor);
        transitions.insert((Status::Discharged, Status::Waiting), SideEffect::Revisit);

        Self { transitions }
    }

    /// 校验状态转换并返回对应副作用
    pub fn transition(&self, from: Status, to: Status) -> Result<SideEffect> {
        self.transitions
            .get(&(from, to))
            .copied()
            .ok_or_else(|| ClinicError::illegal_transition(from, to))
    }

    /// 获取当前状态可到达的目标状态
    pub fn get_possible_targets(&self, current: Status) -> Vec<Status> {
        let mut targets: Vec<Status> = self
            .transitions
            .keys()
            .filter(|(from, _)| *from == current)
            .map(|(_, to)| *to)
            .collect();
        targets.sort_by_key(|status| Status::ALL.iter().position(|s| s == status));
        targets
    }
}

impl Default for PatientStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
