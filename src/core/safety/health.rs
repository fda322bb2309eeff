//! 健康与遥测上报
//!
//! 引擎（唯一写者）在每个周期结束或宿主状态变化时发布一份 `EngineHealth`，
//! 调试界面通过 `HealthReporter::snapshot()` 按需拉取，不会阻塞决策路径。

use super::escalation::EscalationAction;
use super::governor::ProcessingMode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    Completed,
    /// 超出 max_processing_time_ms，但仍给出了尽力而为的结果
    MissedDeadline,
    /// 配置错误导致本周期没有决策
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub is_healthy: bool,
    pub face_model_ready: bool,
    pub nsfw_model_ready: bool,
    pub capture_active: bool,
    pub overlay_active: bool,
    pub override_engaged: bool,
    pub processing_mode: ProcessingMode,
    pub last_error: Option<String>,
    /// 存在时引擎暂停决策
    pub fatal_error: Option<String>,
    /// 最近一个周期是否超时
    pub missed_deadline: bool,
    pub last_action: EscalationAction,
    pub last_processing_ms: f64,
    pub average_processing_ms: f64,
    pub recent_cycles: Vec<CycleStatus>,
    pub cycles_total: u64,
    pub missed_deadlines_total: u64,
    pub fallback_activations: u64,
}

impl Default for EngineHealth {
    fn default() -> Self {
        Self {
            is_healthy: false,
            face_model_ready: false,
            nsfw_model_ready: false,
            capture_active: false,
            overlay_active: false,
            override_engaged: false,
            processing_mode: ProcessingMode::Accelerated,
            last_error: None,
            fatal_error: None,
            missed_deadline: false,
            last_action: EscalationAction::None,
            last_processing_ms: 0.0,
            average_processing_ms: 0.0,
            recent_cycles: vec![],
            cycles_total: 0,
            missed_deadlines_total: 0,
            fallback_activations: 0,
        }
    }
}

impl EngineHealth {
    pub fn last_cycle_within_budget(&self) -> bool {
        !self.missed_deadline
    }
}

/// 只读句柄，可以任意克隆给 UI 刷新任务
#[derive(Clone)]
pub struct HealthReporter {
    rx: watch::Receiver<EngineHealth>,
}

impl HealthReporter {
    /// 最近一次发布的快照，无副作用
    pub fn snapshot(&self) -> EngineHealth {
        self.rx.borrow().clone()
    }

    /// 上次 `mark_seen` 之后是否发布过新快照
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    pub fn mark_seen(&mut self) {
        self.rx.borrow_and_update();
    }
}

/// 写入端，由引擎独占
pub(crate) struct HealthMonitor {
    tx: watch::Sender<EngineHealth>,
    current: EngineHealth,
    recent: VecDeque<CycleStatus>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        let current = EngineHealth::default();
        let (tx, _rx) = watch::channel(current.clone());
        Self {
            tx,
            current,
            recent: VecDeque::new(),
        }
    }

    pub fn reporter(&self) -> HealthReporter {
        HealthReporter {
            rx: self.tx.subscribe(),
        }
    }

    pub fn set_readiness(&mut self, face_ready: bool, nsfw_ready: bool) {
        self.current.face_model_ready = face_ready;
        self.current.nsfw_model_ready = nsfw_ready;
    }

    pub fn set_capture_active(&mut self, active: bool) {
        self.current.capture_active = active;
    }

    pub fn set_overlay_active(&mut self, active: bool) {
        self.current.overlay_active = active;
    }

    pub fn set_override_engaged(&mut self, engaged: bool) {
        self.current.override_engaged = engaged;
    }

    pub fn set_processing_mode(&mut self, mode: ProcessingMode) {
        self.current.processing_mode = mode;
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.current.last_error = Some(message.into());
    }

    pub fn set_fatal(&mut self, fatal: Option<String>) {
        if let Some(message) = &fatal {
            self.current.last_error = Some(message.clone());
        }
        self.current.fatal_error = fatal;
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.current.fatal_error.as_deref()
    }

    pub fn record_fallback(&mut self) {
        self.current.fallback_activations += 1;
    }

    pub fn record_cycle(
        &mut self,
        status: CycleStatus,
        action: EscalationAction,
        processing_ms: f64,
        average_ms: f64,
        window: usize,
    ) {
        self.recent.push_back(status);
        while self.recent.len() > window.max(1) {
            self.recent.pop_front();
        }

        self.current.cycles_total += 1;
        self.current.missed_deadline = status == CycleStatus::MissedDeadline;
        if self.current.missed_deadline {
            self.current.missed_deadlines_total += 1;
        }
        self.current.last_action = action;
        self.current.last_processing_ms = processing_ms;
        self.current.average_processing_ms = average_ms;
    }

    /// 重新计算 is_healthy 并广播
    pub fn publish(&mut self) {
        self.current.recent_cycles = self.recent.iter().copied().collect();
        self.current.is_healthy = self.current.face_model_ready
            && self.current.nsfw_model_ready
            && self.current.fatal_error.is_none()
            && self.recent.iter().all(|s| *s == CycleStatus::Completed);

        self.tx.send_replace(self.current.clone());
    }

    pub fn reset_cycles(&mut self) {
        self.recent.clear();
        self.current.missed_deadline = false;
        self.current.last_action = EscalationAction::None;
        self.current.last_processing_ms = 0.0;
        self.current.average_processing_ms = 0.0;
    }
}
