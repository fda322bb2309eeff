use super::config::EngineConfig;
use super::fusion::FrameAnalysis;
use super::region::DetectedRegion;
use log::{debug, info};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationAction {
    None,
    /// 只遮挡命中区域（按 margin 外扩）
    SelectiveBlur,
    /// 遮挡整个画面
    FullScreenBlur,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EscalationState {
    #[default]
    Idle,
    SelectiveBlur,
    /// `clean_frames`: 连续未满足升级条件的帧数（迟滞计数器）
    FullScreenBlur { clean_frames: u32 },
}

/// 为什么满足了全屏升级条件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EscalationTrigger {
    pub by_region_count: bool,
    pub by_confidence: bool,
}

impl EscalationTrigger {
    pub fn evaluate(analysis: &FrameAnalysis, config: &EngineConfig) -> Self {
        let by_region_count =
            analysis.nsfw_region_count >= config.full_screen_escalation_region_count;
        let by_confidence = config.enable_full_screen_blur_for_nsfw
            && config
                .nsfw_emergency_confidence
                .map(|ceiling| analysis.max_nsfw_confidence > ceiling)
                .unwrap_or(false);

        Self {
            by_region_count,
            by_confidence,
        }
    }

    pub fn holds(&self) -> bool {
        self.by_region_count || self.by_confidence
    }
}

impl EscalationState {
    pub fn action(&self) -> EscalationAction {
        match self {
            EscalationState::Idle => EscalationAction::None,
            EscalationState::SelectiveBlur => EscalationAction::SelectiveBlur,
            EscalationState::FullScreenBlur { .. } => EscalationAction::FullScreenBlur,
        }
    }

    pub fn transition(
        &self,
        should_blur: bool,
        trigger: EscalationTrigger,
        hysteresis_frames: u32,
    ) -> EscalationState {
        if trigger.holds() {
            return EscalationState::FullScreenBlur { clean_frames: 0 };
        }

        let settled = if should_blur {
            EscalationState::SelectiveBlur
        } else {
            EscalationState::Idle
        };

        match self {
            EscalationState::Idle | EscalationState::SelectiveBlur => settled,
            EscalationState::FullScreenBlur { clean_frames } => {
                let clean_frames = clean_frames + 1;
                if clean_frames > hysteresis_frames {
                    settled
                } else {
                    EscalationState::FullScreenBlur { clean_frames }
                }
            }
        }
    }
}

/// 每帧输出给渲染端的决策
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationDecision {
    pub action: EscalationAction,
    pub state: EscalationState,
    /// FullScreenBlur 时仍然输出，仅供诊断
    pub regions: Vec<DetectedRegion>,
    pub triggered_by_region_count: bool,
    pub triggered_by_confidence: bool,
    pub blur_margin: f32,
    pub analysis: FrameAnalysis,
}

impl EscalationDecision {
    /// 禁止绘制时使用的决策（紧急覆盖、引擎挂起）
    pub fn none() -> Self {
        Self {
            action: EscalationAction::None,
            state: EscalationState::Idle,
            regions: vec![],
            triggered_by_region_count: false,
            triggered_by_confidence: false,
            blur_margin: 0.0,
            analysis: FrameAnalysis::empty(),
        }
    }

    /// 渲染端实际需要遮挡的区域
    pub fn overlay_regions(&self) -> Vec<DetectedRegion> {
        match self.action {
            EscalationAction::None | EscalationAction::FullScreenBlur => vec![],
            EscalationAction::SelectiveBlur => self
                .regions
                .iter()
                .map(|r| r.expanded(self.blur_margin))
                .collect(),
        }
    }
}

/// 升级决策状态机，唯一的持久字段是状态本身（含迟滞计数器）
pub struct EscalationMachine {
    state: EscalationState,
    frame_counter: u64,
}

impl EscalationMachine {
    pub fn new() -> Self {
        Self {
            state: EscalationState::Idle,
            frame_counter: 0,
        }
    }

    pub fn evaluate(&mut self, analysis: FrameAnalysis, config: &EngineConfig) -> EscalationDecision {
        self.frame_counter += 1;

        let trigger = EscalationTrigger::evaluate(&analysis, config);
        let next = self
            .state
            .transition(analysis.should_blur, trigger, config.hysteresis_frames);

        if next.action() != self.state.action() {
            info!(
                "🔁 [ESCALATION] {:?} -> {:?} (nsfw={}, max={:.2}, faces={})",
                self.state.action(),
                next.action(),
                analysis.nsfw_region_count,
                analysis.max_nsfw_confidence,
                analysis.female_face_count
            );
        } else if let EscalationState::FullScreenBlur { clean_frames } = next {
            if clean_frames > 0 {
                debug!(
                    "[ESCALATION] holding full-screen blur, clean frames {}/{}",
                    clean_frames, config.hysteresis_frames
                );
            }
        }
        self.state = next;

        EscalationDecision {
            action: self.state.action(),
            state: self.state.clone(),
            regions: analysis.regions.clone(),
            triggered_by_region_count: trigger.by_region_count,
            triggered_by_confidence: trigger.by_confidence,
            blur_margin: config.blur_margin,
            analysis,
        }
    }

    pub fn current_state(&self) -> &EscalationState {
        &self.state
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    pub fn reset(&mut self) {
        self.state = EscalationState::Idle;
        self.frame_counter = 0;
    }
}

impl Default for EscalationMachine {
    fn default() -> Self {
        Self::new()
    }
}
