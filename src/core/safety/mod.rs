//! 内容风险决策引擎 - 实时屏幕内容过滤
//!
//! 每个决策周期：
//! 1. 并行检测 - 人脸/性别 与 NSFW 两路适配器，截止时间兜底
//! 2. 风险融合 - 按阈值过滤后合并区域
//! 3. 升级决策 - None / SelectiveBlur / FullScreenBlur，带迟滞
//! 4. 性能调节 - 超预算降级到 Standard 模式，空闲时升级回来

pub mod action;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod frame;
pub mod fusion;
pub mod governor;
pub mod health;
pub mod region;
pub mod skin_detector;

pub use action::{ActionResult, EmergencyOverride, OverlaySink, PauseHandle};
pub use config::{ConfigSource, ConfigStore, EngineConfig, GovernorConfig};
pub use detector::{DetectionRequest, MockDetector, NoOpDetector, RegionDetector};
pub use engine::{
    detect_before, CycleOutcome, CycleReport, CycleSignals, DetectionOutcome, DetectorSlot,
    Engine, EngineBuilder, SignalStatus,
};
pub use error::{ConfigError, DetectorError, EngineError};
pub use escalation::{EscalationAction, EscalationDecision, EscalationMachine, EscalationState};
pub use frame::Frame;
pub use fusion::{fuse, FrameAnalysis, RiskLevel};
pub use governor::{GovernorSignal, PerformanceGovernor, PerformanceSample, ProcessingMode};
pub use health::{CycleStatus, EngineHealth, HealthReporter};
pub use region::{DetectedRegion, Gender, GenderClassification, RegionRect, RegionSource};
pub use skin_detector::SkinToneDetector;
