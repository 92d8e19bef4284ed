//! 工作流引擎运行参数

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// 检验项目到检验设备的路由表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabRouting {
    /// 检验项目名称（忽略大小写）-> 设备编号
    pub routes: HashMap<String, String>,
    /// 未匹配项目使用的设备
    pub default_equipment: String,
}

impl LabRouting {
    pub fn new(default_equipment: impl Into<String>) -> Self {
        Self {
            routes: HashMap::new(),
            default_equipment: default_equipment.into(),
        }
    }

    pub fn with_route(mut self, test: &str, equipment: impl Into<String>) -> Self {
        self.routes.insert(test.trim().to_lowercase(), equipment.into());
        self
    }

    /// 为检验项目选择设备
    pub fn equipment_for(&self, test: &str) -> &str {
        self.routes
            .get(&test.trim().to_lowercase())
            .map(String::as_str)
            .unwrap_or(&self.default_equipment)
    }
}

impl Default for LabRouting {
    fn default() -> Self {
        LabRouting::new("general-analyzer")
            .with_route("Complete Blood Count", "hematology-analyzer")
            .with_route("Lipid Profile", "chemistry-analyzer")
            .with_route("Glucose Fasting", "chemistry-analyzer")
    }
}

/// 引擎参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// 获取患者、队列、药品锁的最长等待时间
    pub lock_timeout: Duration,
    pub lab: LabRouting,
    /// 发药后剩余库存不高于该值时发出 InventoryLow 事件
    pub low_stock_threshold: u32,
    /// 效期巡检的预警天数
    pub expiry_warning_days: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
            lab: LabRouting::default(),
            low_stock_threshold: 10,
            expiry_warning_days: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equipment_routing_is_case_insensitive() {
        let routing = LabRouting::default();
        assert_eq!(routing.equipment_for("complete blood count"), "hematology-analyzer");
        assert_eq!(routing.equipment_for(" Lipid Profile "), "chemistry-analyzer");
        assert_eq!(routing.equipment_for("Malaria Smear"), "general-analyzer");
    }
}
