//! 性能调节器
//!
//! 记录每个决策周期的耗时，滚动均值持续超预算时要求降级到 Standard 模式，
//! 持续低于预算的 60% 时再升回 Accelerated。只在流水线线程上修改。

use super::config::GovernorConfig;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// GPU / NNAPI 加速推理
    #[default]
    Accelerated,
    /// 降采样 + CPU 推理
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GovernorSignal {
    Steady,
    /// 切换到 Standard；已经是 Standard 时宿主可以降低帧率
    Degrade,
    Upgrade,
}

/// 滚动窗口快照，供健康上报读取
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub durations_ms: Vec<f64>,
    pub mode: ProcessingMode,
}

impl PerformanceSample {
    pub fn mean_ms(&self) -> f64 {
        if self.durations_ms.is_empty() {
            0.0
        } else {
            self.durations_ms.iter().sum::<f64>() / self.durations_ms.len() as f64
        }
    }
}

pub struct PerformanceGovernor {
    window: VecDeque<f64>,
    mode: ProcessingMode,
    over_budget_streak: u32,
    under_budget_streak: u32,
    anomalies: u64,
}

impl PerformanceGovernor {
    pub fn new() -> Self {
        Self::with_mode(ProcessingMode::Accelerated)
    }

    pub fn with_mode(mode: ProcessingMode) -> Self {
        Self {
            window: VecDeque::new(),
            mode,
            over_budget_streak: 0,
            under_budget_streak: 0,
            anomalies: 0,
        }
    }

    /// 每个完成的决策周期调用一次
    pub fn record(
        &mut self,
        duration_ms: f64,
        max_processing_time_ms: u64,
        config: &GovernorConfig,
    ) -> GovernorSignal {
        let duration_ms = self.sanitize(duration_ms);

        let window_size = config.window_size.max(1);
        self.window.push_back(duration_ms);
        while self.window.len() > window_size {
            self.window.pop_front();
        }

        let mean = self.mean_ms();
        let budget = max_processing_time_ms as f64;
        let required = config.consecutive_cycles.max(1);

        if mean > budget {
            self.over_budget_streak += 1;
            self.under_budget_streak = 0;
        } else if mean < budget * config.upgrade_ratio {
            self.under_budget_streak += 1;
            self.over_budget_streak = 0;
        } else {
            self.over_budget_streak = 0;
            self.under_budget_streak = 0;
        }

        if self.over_budget_streak >= required {
            self.over_budget_streak = 0;
            if self.mode == ProcessingMode::Accelerated {
                info!(
                    "⚠️ [GOVERNOR] mean {:.1}ms over {}ms budget for {} cycles, degrading to Standard",
                    mean, max_processing_time_ms, required
                );
            } else {
                warn!(
                    "⚠️ [GOVERNOR] still over budget in Standard mode (mean {:.1}ms)",
                    mean
                );
            }
            self.mode = ProcessingMode::Standard;
            return GovernorSignal::Degrade;
        }

        if self.under_budget_streak >= required {
            self.under_budget_streak = 0;
            if self.mode == ProcessingMode::Standard && config.accelerated_available {
                info!(
                    "🚀 [GOVERNOR] mean {:.1}ms well under {}ms budget, upgrading to Accelerated",
                    mean, max_processing_time_ms
                );
                self.mode = ProcessingMode::Accelerated;
                return GovernorSignal::Upgrade;
            }
        }

        GovernorSignal::Steady
    }

    fn sanitize(&mut self, duration_ms: f64) -> f64 {
        if duration_ms.is_finite() && duration_ms > 0.0 {
            return duration_ms;
        }
        self.anomalies += 1;
        warn!(
            "[GOVERNOR] anomalous duration sample {:?}ms clamped to 0",
            duration_ms
        );
        0.0
    }

    pub fn mean_ms(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }

    pub fn mode(&self) -> ProcessingMode {
        self.mode
    }

    /// 目前为止被钳制的异常样本数
    pub fn anomaly_count(&self) -> u64 {
        self.anomalies
    }

    pub fn sample(&self) -> PerformanceSample {
        PerformanceSample {
            durations_ms: self.window.iter().copied().collect(),
            mode: self.mode,
        }
    }

    pub fn reset(&mut self) {
        debug!("[GOVERNOR] reset");
        self.window.clear();
        self.over_budget_streak = 0;
        self.under_budget_streak = 0;
        self.anomalies = 0;
    }
}

impl Default for PerformanceGovernor {
    fn default() -> Self {
        Self::new()
    }
}
