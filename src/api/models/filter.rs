use crate::core::safety::{
    CycleOutcome, CycleStatus, DetectedRegion, EngineHealth, EscalationAction, Gender,
    GovernorSignal, ProcessingMode, RegionRect, RegionSource,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionKind {
    Face,
    Nsfw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GenderLabel {
    Female,
    Male,
    #[default]
    Unknown,
}

/// 遮罩动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlurAction {
    #[default]
    None,
    SelectiveBlur,
    FullScreenBlur,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModeLabel {
    #[default]
    Accelerated,
    Standard,
}

/// 给宿主的调节建议：Degrade 时可以降低采集帧率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GovernorHint {
    #[default]
    Steady,
    Degrade,
    Upgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigPreset {
    Default,
    LowEndDevice,
    Strict,
}

/// 宿主侧模型输出的一个区域（归一化坐标）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInput {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// 仅人脸区域需要
    pub gender: Option<GenderLabel>,
    pub gender_confidence: f32,
}

impl RegionInput {
    fn rect(&self) -> RegionRect {
        RegionRect::new(self.x, self.y, self.width, self.height)
    }

    pub(crate) fn to_face(&self) -> DetectedRegion {
        let gender = self.gender.unwrap_or_default();
        DetectedRegion::face(self.rect(), self.confidence, gender.into(), self.gender_confidence)
    }

    pub(crate) fn to_nsfw(&self) -> DetectedRegion {
        DetectedRegion::nsfw(self.rect(), self.confidence)
    }
}

/// 宿主完成推理后提交的一帧信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameSignals {
    pub frame_number: u64,
    pub faces: Vec<RegionInput>,
    pub nsfw: Vec<RegionInput>,
    /// 模型未加载完成时为 false，对应一路按空结果处理
    pub face_model_ready: bool,
    pub nsfw_model_ready: bool,
    pub face_error: Option<String>,
    pub nsfw_error: Option<String>,
    pub face_timed_out: bool,
    pub nsfw_timed_out: bool,
    /// 捕获到推理结束的耗时
    pub processing_time_ms: f64,
}

/// RGBA 原始帧，用于 Rust 侧启发式检测
#[derive(Debug, Clone)]
pub struct FrameInput {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    pub timestamp_ms: u64,
    pub frame_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionOutput {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub kind: RegionKind,
    pub confidence: f32,
}

impl From<&DetectedRegion> for RegionOutput {
    fn from(region: &DetectedRegion) -> Self {
        Self {
            x: region.rect.x,
            y: region.rect.y,
            width: region.rect.width,
            height: region.rect.height,
            kind: region.source.into(),
            confidence: region.confidence,
        }
    }
}

/// 一帧的决策结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameVerdict {
    pub frame_number: u64,
    /// false 时宿主保持上一帧的遮罩不变（暂停或引擎挂起）
    pub emitted: bool,
    pub action: BlurAction,
    /// 已按 margin 外扩，只在 SelectiveBlur 时非空
    pub regions: Vec<RegionOutput>,
    /// 本帧检测到的全部区域（未外扩），FullScreenBlur 时也保留，供调试界面使用
    pub diagnostic_regions: Vec<RegionOutput>,
    pub triggered_by_region_count: bool,
    pub triggered_by_confidence: bool,
    pub nsfw_region_count: u32,
    pub female_face_count: u32,
    pub max_nsfw_confidence: f32,
    pub processing_time_ms: f64,
    pub missed_deadline: bool,
    pub overridden: bool,
    pub governor_hint: GovernorHint,
    pub processing_mode: ModeLabel,
    pub suspended_reason: Option<String>,
}

impl FrameVerdict {
    pub(crate) fn from_outcome(frame_number: u64, outcome: &CycleOutcome) -> Self {
        match outcome {
            CycleOutcome::Decided(report) => {
                let decision = &report.decision;
                Self {
                    frame_number,
                    emitted: true,
                    action: decision.action.into(),
                    regions: decision.overlay_regions().iter().map(RegionOutput::from).collect(),
                    diagnostic_regions: decision.regions.iter().map(RegionOutput::from).collect(),
                    triggered_by_region_count: decision.triggered_by_region_count,
                    triggered_by_confidence: decision.triggered_by_confidence,
                    nsfw_region_count: decision.analysis.nsfw_region_count,
                    female_face_count: decision.analysis.female_face_count,
                    max_nsfw_confidence: decision.analysis.max_nsfw_confidence,
                    processing_time_ms: decision.analysis.processing_time_ms,
                    missed_deadline: report.status == CycleStatus::MissedDeadline,
                    overridden: false,
                    governor_hint: report.governor_signal.into(),
                    processing_mode: report.mode.into(),
                    suspended_reason: None,
                }
            }
            CycleOutcome::Overridden => Self {
                frame_number,
                emitted: true,
                overridden: true,
                ..Default::default()
            },
            CycleOutcome::Cancelled => Self {
                frame_number,
                ..Default::default()
            },
            CycleOutcome::Suspended { reason } => Self {
                frame_number,
                suspended_reason: Some(reason.clone()),
                ..Default::default()
            },
        }
    }
}

/// 调试界面使用的健康快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub is_healthy: bool,
    pub face_model_ready: bool,
    pub nsfw_model_ready: bool,
    pub capture_active: bool,
    pub overlay_active: bool,
    pub override_engaged: bool,
    pub processing_mode: ModeLabel,
    pub last_error: Option<String>,
    pub fatal_error: Option<String>,
    pub last_cycle_within_budget: bool,
    pub last_action: BlurAction,
    pub last_processing_ms: f64,
    pub average_processing_ms: f64,
    pub cycles_total: u64,
    pub missed_deadlines_total: u64,
    pub fallback_activations: u64,
}

impl From<EngineHealth> for HealthReport {
    fn from(health: EngineHealth) -> Self {
        Self {
            last_cycle_within_budget: health.last_cycle_within_budget(),
            is_healthy: health.is_healthy,
            face_model_ready: health.face_model_ready,
            nsfw_model_ready: health.nsfw_model_ready,
            capture_active: health.capture_active,
            overlay_active: health.overlay_active,
            override_engaged: health.override_engaged,
            processing_mode: health.processing_mode.into(),
            last_error: health.last_error,
            fatal_error: health.fatal_error,
            last_action: health.last_action.into(),
            last_processing_ms: health.last_processing_ms,
            average_processing_ms: health.average_processing_ms,
            cycles_total: health.cycles_total,
            missed_deadlines_total: health.missed_deadlines_total,
            fallback_activations: health.fallback_activations,
        }
    }
}

impl From<GenderLabel> for Gender {
    fn from(label: GenderLabel) -> Self {
        match label {
            GenderLabel::Female => Gender::Female,
            GenderLabel::Male => Gender::Male,
            GenderLabel::Unknown => Gender::Unknown,
        }
    }
}

impl From<RegionSource> for RegionKind {
    fn from(source: RegionSource) -> Self {
        match source {
            RegionSource::Face => RegionKind::Face,
            RegionSource::Nsfw => RegionKind::Nsfw,
        }
    }
}

impl From<EscalationAction> for BlurAction {
    fn from(action: EscalationAction) -> Self {
        match action {
            EscalationAction::None => BlurAction::None,
            EscalationAction::SelectiveBlur => BlurAction::SelectiveBlur,
            EscalationAction::FullScreenBlur => BlurAction::FullScreenBlur,
        }
    }
}

impl From<ProcessingMode> for ModeLabel {
    fn from(mode: ProcessingMode) -> Self {
        match mode {
            ProcessingMode::Accelerated => ModeLabel::Accelerated,
            ProcessingMode::Standard => ModeLabel::Standard,
        }
    }
}

impl From<GovernorSignal> for GovernorHint {
    fn from(signal: GovernorSignal) -> Self {
        match signal {
            GovernorSignal::Steady => GovernorHint::Steady,
            GovernorSignal::Degrade => GovernorHint::Degrade,
            GovernorSignal::Upgrade => GovernorHint::Upgrade,
        }
    }
}
