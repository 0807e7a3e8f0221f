use crate::OperandType;

/// Relative performance of a driver for one operand type. Lower is better;
/// figures are relative to a baseline CPU implementation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PerformanceInfo {
    pub exec_time: f32,
    pub power_usage: f32,
}

impl Default for PerformanceInfo {
    fn default() -> Self {
        Self {
            exec_time: f32::MAX,
            power_usage: f32::MAX,
        }
    }
}

/// Performance figures reported by a driver at connect time. Immutable once
/// queried.
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub relaxed_float32_performance_scalar: PerformanceInfo,
    pub relaxed_float32_performance_tensor: PerformanceInfo,
    pub operand_performance: Vec<(OperandType, PerformanceInfo)>,
    pub if_performance: PerformanceInfo,
    pub while_performance: PerformanceInfo,
}

impl Capabilities {
    pub fn performance_for(&self, ty: OperandType) -> PerformanceInfo {
        self.operand_performance
            .iter()
            .find(|(t, _)| *t == ty)
            .map(|(_, p)| *p)
            .unwrap_or_default()
    }
}
