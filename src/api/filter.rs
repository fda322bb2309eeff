//! 内容过滤器 - 屏幕内容风险决策

use crate::api::models::filter::{
    ConfigPreset, FrameInput, FrameSignals, FrameVerdict, HealthReport, RegionInput,
};
use crate::core::safety::{
    detect_before, ConfigError, ConfigSource, ConfigStore, CycleSignals, DetectedRegion,
    DetectionOutcome, DetectionRequest, EmergencyOverride, Engine, EngineConfig, Frame,
    DetectorSlot, HealthReporter, PauseHandle, ProcessingMode, SignalStatus, SkinToneDetector,
};
use flutter_rust_bridge::frb;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// 过滤器 API 错误类型，FRB 友好的设计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterApiError {
    pub error_type: String,
    pub message: String,
}

impl FilterApiError {
    fn invalid_config(e: ConfigError) -> Self {
        Self {
            error_type: "InvalidConfig".to_string(),
            message: format!("配置无效: {}", e),
        }
    }

    fn invalid_frame(message: String) -> Self {
        Self {
            error_type: "InvalidFrame".to_string(),
            message,
        }
    }

    fn runtime(e: String) -> Self {
        Self {
            error_type: "Runtime".to_string(),
            message: format!("运行时初始化失败: {}", e),
        }
    }

    fn lock_poisoned(e: String) -> Self {
        Self {
            error_type: "LockPoisoned".to_string(),
            message: format!("引擎锁已损坏: {}", e),
        }
    }
}

impl std::fmt::Display for FilterApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error_type, self.message)
    }
}

impl std::error::Error for FilterApiError {}

/// 内容过滤器 - 推理在宿主侧运行，Rust 侧负责融合、升级和调节
///
/// ```dart
/// final filter = ContentFilter.create(configJson: settingsJson);
/// final verdict = filter.evaluate(signals: signals);
/// if (verdict.emitted) overlay.render(verdict);
/// ```
#[frb(opaque)]
pub struct ContentFilter {
    engine: Mutex<Engine>,
    config: Arc<ConfigStore>,
    heuristic: DetectorSlot,
    runtime: tokio::runtime::Runtime,
    health: HealthReporter,
    emergency: EmergencyOverride,
    pause: PauseHandle,
}

impl ContentFilter {
    /// 创建过滤器；不传配置时使用默认值
    #[frb(sync)]
    pub fn create(config_json: Option<String>) -> Result<Self, FilterApiError> {
        crate::init_logging();
        let config = match config_json {
            Some(text) => EngineConfig::from_json(&text).map_err(FilterApiError::invalid_config)?,
            None => EngineConfig::default(),
        };
        Self::with_config(config)
    }

    #[frb(sync)]
    pub fn create_with_preset(preset: ConfigPreset) -> Result<Self, FilterApiError> {
        crate::init_logging();
        Self::with_config(preset_config(preset))
    }

    fn with_config(config: EngineConfig) -> Result<Self, FilterApiError> {
        let workers = num_cpus::get().clamp(1, 2);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers * 2)
            .thread_name("screen-guard")
            .enable_time()
            .build()
            .map_err(|e| FilterApiError::runtime(e.to_string()))?;

        let store = Arc::new(ConfigStore::with_config(config));
        let engine = Engine::builder().config_source(store.clone()).build();
        let health = engine.health_reporter();
        let emergency = engine.emergency_override();
        let pause = engine.pause_handle();

        info!("🛡️ ContentFilter: created ({} runtime workers)", workers);
        Ok(Self {
            engine: Mutex::new(engine),
            config: store,
            heuristic: DetectorSlot::new(Arc::new(SkinToneDetector::new())),
            runtime,
            health,
            emergency,
            pause,
        })
    }

    /// 提交宿主侧推理结果，得到本帧决策
    #[frb(sync)]
    pub fn evaluate(&self, signals: FrameSignals) -> Result<FrameVerdict, FilterApiError> {
        let cycle = CycleSignals {
            face: host_outcome(
                &signals.faces,
                RegionInput::to_face,
                signals.face_model_ready,
                signals.face_error.as_deref(),
                signals.face_timed_out,
            ),
            nsfw: host_outcome(
                &signals.nsfw,
                RegionInput::to_nsfw,
                signals.nsfw_model_ready,
                signals.nsfw_error.as_deref(),
                signals.nsfw_timed_out,
            ),
            elapsed_ms: signals.processing_time_ms,
        };

        let mut engine = self.lock_engine()?;
        engine.set_model_readiness(signals.face_model_ready, signals.nsfw_model_ready);
        let outcome = engine.decide(cycle);
        Ok(FrameVerdict::from_outcome(signals.frame_number, &outcome))
    }

    /// 宿主没有 NSFW 模型时使用：人脸由宿主提供，NSFW 信号来自肤色启发式
    #[frb]
    pub fn analyze_frame(
        &self,
        frame: FrameInput,
        faces: Vec<RegionInput>,
    ) -> Result<FrameVerdict, FilterApiError> {
        let started = Instant::now();
        let frame_number = frame.frame_number;
        let frame = Frame::new(
            frame.width,
            frame.height,
            frame.rgba,
            frame.timestamp_ms,
            frame.frame_number,
        );
        if !frame.is_well_formed() {
            return Err(FilterApiError::invalid_frame(format!(
                "{}x{} 帧只有 {} 字节",
                frame.width,
                frame.height,
                frame.data.len()
            )));
        }

        let config = self.config.load().map_err(FilterApiError::invalid_config)?;
        let mode = self.lock_engine()?.mode();
        let frame = match mode {
            ProcessingMode::Accelerated => frame,
            ProcessingMode::Standard => frame
                .downscaled(config.standard_mode_max_dimension)
                .unwrap_or(frame),
        };
        let frame = Arc::new(frame);
        let request = DetectionRequest {
            mode,
            sensitivity: config.detection_sensitivity,
        };
        let deadline = tokio::time::Instant::from_std(started)
            + Duration::from_millis(config.max_processing_time_ms);

        let nsfw = self
            .runtime
            .block_on(detect_before(&self.heuristic, &frame, request, deadline));

        let cycle = CycleSignals {
            face: DetectionOutcome::detected(faces.iter().map(RegionInput::to_face).collect()),
            nsfw,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        let outcome = self.lock_engine()?.decide(cycle);
        Ok(FrameVerdict::from_outcome(frame_number, &outcome))
    }

    /// 更新配置（JSON / JSON5）；无效配置会被拒绝，引擎继续使用上一份有效配置
    #[frb(sync)]
    pub fn update_config(&self, config_json: String) -> Result<(), FilterApiError> {
        match self.config.apply_json(&config_json) {
            Ok(_) => {
                info!("⚙️ ContentFilter: config updated");
                Ok(())
            }
            Err(e) => {
                warn!("⚠️ ContentFilter: rejected config update: {}", e);
                Err(FilterApiError::invalid_config(e))
            }
        }
    }

    #[frb(sync)]
    pub fn apply_preset(&self, preset: ConfigPreset) {
        info!("⚙️ ContentFilter: preset {:?}", preset);
        self.config.replace(preset_config(preset));
    }

    /// 当前生效的配置 JSON
    #[frb(sync, getter)]
    pub fn config_json(&self) -> Result<String, FilterApiError> {
        self.config
            .load()
            .and_then(|config| config.to_json())
            .map_err(FilterApiError::invalid_config)
    }

    /// 获取健康快照（无副作用）
    #[frb(sync, getter)]
    pub fn health(&self) -> HealthReport {
        HealthReport::from(self.health.snapshot())
    }

    /// 紧急隐藏所有遮罩，直到 restore_overlays
    #[frb(sync)]
    pub fn hide_all_overlays(&self) {
        self.emergency.engage();
    }

    #[frb(sync)]
    pub fn restore_overlays(&self) {
        self.emergency.release();
    }

    /// 息屏或服务暂停时调用，进行中的帧会被丢弃
    #[frb(sync)]
    pub fn pause(&self) {
        self.pause.pause();
    }

    #[frb(sync)]
    pub fn resume(&self) {
        self.pause.resume();
    }

    #[frb(sync)]
    pub fn set_capture_active(&self, active: bool) -> Result<(), FilterApiError> {
        self.lock_engine()?.set_capture_active(active);
        Ok(())
    }

    #[frb(sync)]
    pub fn set_overlay_active(&self, active: bool) -> Result<(), FilterApiError> {
        self.lock_engine()?.set_overlay_active(active);
        Ok(())
    }

    #[frb(sync)]
    pub fn set_model_readiness(
        &self,
        face_ready: bool,
        nsfw_ready: bool,
    ) -> Result<(), FilterApiError> {
        self.lock_engine()?.set_model_readiness(face_ready, nsfw_ready);
        Ok(())
    }

    /// 重置状态
    #[frb(sync)]
    pub fn reset(&self) -> Result<(), FilterApiError> {
        self.lock_engine()?.reset();
        Ok(())
    }

    fn lock_engine(&self) -> Result<MutexGuard<'_, Engine>, FilterApiError> {
        self.engine
            .lock()
            .map_err(|e| FilterApiError::lock_poisoned(e.to_string()))
    }
}

impl Drop for ContentFilter {
    fn drop(&mut self) {
        info!("🗑️ ContentFilter: released");
    }
}

fn preset_config(preset: ConfigPreset) -> EngineConfig {
    match preset {
        ConfigPreset::Default => EngineConfig::default(),
        ConfigPreset::LowEndDevice => EngineConfig::for_low_end_device(),
        ConfigPreset::Strict => EngineConfig::for_strict_mode(),
    }
}

/// 宿主上报的一路信号折算成引擎的检测结果
fn host_outcome(
    regions: &[RegionInput],
    convert: fn(&RegionInput) -> DetectedRegion,
    model_ready: bool,
    error: Option<&str>,
    timed_out: bool,
) -> DetectionOutcome {
    if !model_ready {
        return DetectionOutcome::empty(SignalStatus::ModelNotReady);
    }
    if timed_out {
        return DetectionOutcome::empty(SignalStatus::TimedOut);
    }
    if let Some(message) = error {
        return DetectionOutcome::empty(SignalStatus::InferenceError(message.to_string()));
    }
    DetectionOutcome::detected(regions.iter().map(convert).collect())
}
