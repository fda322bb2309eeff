//! 阈值与引擎配置
//!
//! 配置归外部设置存储所有，引擎在每个决策周期开始时读取一份只读快照，
//! 从不跨周期缓存（last-known-good 除外，仅用于配置出错时兜底）。

use super::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GovernorConfig {
    /// 滚动窗口长度
    pub window_size: usize,
    /// 连续多少个周期满足条件才发出信号 (M)
    pub consecutive_cycles: u32,
    /// 均值低于 max_processing_time_ms * upgrade_ratio 时考虑升级
    pub upgrade_ratio: f64,
    /// 设备是否支持加速推理
    pub accelerated_available: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            consecutive_cycles: 3,
            upgrade_ratio: 0.6,
            accelerated_available: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    pub gender_confidence_threshold: f32,
    pub nsfw_confidence_threshold: f32,
    /// 透传给检测适配器，融合策略不使用
    pub detection_sensitivity: f32,
    pub max_processing_time_ms: u64,
    pub full_screen_escalation_region_count: u32,
    pub enable_fallback_detection: bool,
    pub enable_full_screen_blur_for_nsfw: bool,
    /// 紧急全屏升级的置信度下限；开启 `enable_full_screen_blur_for_nsfw` 时必须显式设置
    pub nsfw_emergency_confidence: Option<f32>,
    /// K: clean frames needed before leaving full-screen blur
    pub hysteresis_frames: u32,
    pub blur_margin: f32,
    /// N: cycles considered by the health check
    pub health_window: usize,
    pub standard_mode_max_dimension: u32,
    pub governor: GovernorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gender_confidence_threshold: 0.7,
            nsfw_confidence_threshold: 0.6,
            detection_sensitivity: 0.5,
            max_processing_time_ms: 100,
            full_screen_escalation_region_count: 5,
            enable_fallback_detection: true,
            enable_full_screen_blur_for_nsfw: false,
            nsfw_emergency_confidence: None,
            hysteresis_frames: 2,
            blur_margin: 0.02,
            health_window: 5,
            standard_mode_max_dimension: 320,
            governor: GovernorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// 低端机：放宽时间预算，直接以 Standard 模式运行
    pub fn for_low_end_device() -> Self {
        Self {
            max_processing_time_ms: 150,
            standard_mode_max_dimension: 256,
            governor: GovernorConfig {
                accelerated_available: false,
                ..GovernorConfig::default()
            },
            ..Self::default()
        }
    }

    /// 严格模式：更低阈值，更早全屏升级
    pub fn for_strict_mode() -> Self {
        Self {
            gender_confidence_threshold: 0.55,
            nsfw_confidence_threshold: 0.4,
            detection_sensitivity: 0.8,
            full_screen_escalation_region_count: 3,
            hysteresis_frames: 4,
            blur_margin: 0.05,
            ..Self::default()
        }
    }

    /// 同时接受普通 JSON 和 JSON5（注释、尾逗号）
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Err(ConfigError::Missing);
        }

        let config: EngineConfig = match serde_json::from_str(text) {
            Ok(config) => config,
            Err(_) => json5::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("genderConfidenceThreshold", self.gender_confidence_threshold)?;
        check_unit("nsfwConfidenceThreshold", self.nsfw_confidence_threshold)?;
        check_unit("detectionSensitivity", self.detection_sensitivity)?;
        check_unit("blurMargin", self.blur_margin)?;

        if self.max_processing_time_ms == 0 {
            return Err(ConfigError::invalid("maxProcessingTimeMs", "must be positive"));
        }
        if self.full_screen_escalation_region_count == 0 {
            return Err(ConfigError::invalid(
                "fullScreenEscalationRegionCount",
                "must be at least 1",
            ));
        }
        if self.hysteresis_frames == 0 {
            return Err(ConfigError::invalid("hysteresisFrames", "must be at least 1"));
        }
        if self.health_window == 0 {
            return Err(ConfigError::invalid("healthWindow", "must be at least 1"));
        }

        match (self.enable_full_screen_blur_for_nsfw, self.nsfw_emergency_confidence) {
            (true, None) => {
                return Err(ConfigError::invalid(
                    "nsfwEmergencyConfidence",
                    "required when enableFullScreenBlurForNsfw is set",
                ));
            }
            (_, Some(ceiling)) => check_unit("nsfwEmergencyConfidence", ceiling)?,
            (false, None) => {}
        }

        let governor = &self.governor;
        if governor.window_size == 0 {
            return Err(ConfigError::invalid("governor.windowSize", "must be at least 1"));
        }
        if governor.consecutive_cycles == 0 {
            return Err(ConfigError::invalid(
                "governor.consecutiveCycles",
                "must be at least 1",
            ));
        }
        if !(governor.upgrade_ratio > 0.0 && governor.upgrade_ratio < 1.0) {
            return Err(ConfigError::invalid(
                "governor.upgradeRatio",
                format!("{} not in (0, 1)", governor.upgrade_ratio),
            ));
        }

        Ok(())
    }
}

fn check_unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("{} not in [0, 1]", value)))
    }
}

/// 配置存储接缝：引擎每个周期调用一次 `load`
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<EngineConfig, ConfigError>;
}

impl ConfigSource for EngineConfig {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        Ok(self.clone())
    }
}

/// 宿主可写的内存配置存储
///
/// 设置页面通过 `apply_json` 写入 JSON 文本，无效文本被拒绝、原配置不变；
/// `replace_from_json` 会把解析失败也存下来，下一个周期由引擎上报。
pub struct ConfigStore {
    current: RwLock<Result<EngineConfig, ConfigError>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Err(ConfigError::Missing)),
        }
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            current: RwLock::new(Ok(config)),
        }
    }

    pub fn replace(&self, config: EngineConfig) {
        self.set(Ok(config));
    }

    /// 只在解析和校验都通过时替换当前配置，失败时保留原值
    pub fn apply_json(&self, text: &str) -> Result<EngineConfig, ConfigError> {
        let config = EngineConfig::from_json(text)?;
        self.replace(config.clone());
        Ok(config)
    }

    /// 返回解析结果；无论成败都会写入存储
    pub fn replace_from_json(&self, text: &str) -> Result<(), ConfigError> {
        let parsed = EngineConfig::from_json(text);
        let outcome = parsed.as_ref().map(|_| ()).map_err(|e| e.clone());
        self.set(parsed);
        outcome
    }

    pub fn clear(&self) {
        self.set(Err(ConfigError::Missing));
    }

    fn set(&self, value: Result<EngineConfig, ConfigError>) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = value;
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for ConfigStore {
    fn load(&self) -> Result<EngineConfig, ConfigError> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
