//! 渲染端动作与外部控制信号

use super::escalation::EscalationDecision;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// 渲染端执行一次动作后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Success { message: String },
    Failure { reason: String },
}

impl ActionResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self::Success {
            message: message.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success { .. })
    }
}

/// 遮罩渲染端（外部协作者），负责模糊样式、强度和区域外扩
pub trait OverlaySink: Send + Sync {
    fn apply(&self, decision: &EscalationDecision) -> ActionResult;

    /// 紧急隐藏所有遮罩
    fn hide_all(&self) -> ActionResult;
}

/// 紧急覆盖开关：“隐藏所有遮罩”
///
/// 宿主任意线程调用 `engage()`，引擎在下一个周期边界生效，
/// 之后每个周期都输出 `None`，直到 `release()`。
#[derive(Clone, Default)]
pub struct EmergencyOverride {
    engaged: Arc<AtomicBool>,
}

impl EmergencyOverride {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        if !self.engaged.swap(true, Ordering::SeqCst) {
            warn!("🛑 [OVERRIDE] hide all overlays requested");
        }
    }

    pub fn release(&self) {
        if self.engaged.swap(false, Ordering::SeqCst) {
            info!("✅ [OVERRIDE] overlays restored");
        }
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

/// 暂停/取消句柄：息屏或服务暂停时丢弃进行中的周期
#[derive(Clone)]
pub struct PauseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl PauseHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn pause(&self) {
        if !self.tx.send_replace(true) {
            info!("⏸️ [PIPELINE] paused, in-flight cycle will be discarded");
        }
    }

    pub fn resume(&self) {
        if self.tx.send_replace(false) {
            info!("▶️ [PIPELINE] resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}
