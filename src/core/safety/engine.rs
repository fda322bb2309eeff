//! 决策引擎：一帧一个周期，fuse → escalate → emit
//!
//! 周期之间严格串行（`&mut self`），周期内人脸和 NSFW 两路检测并行，
//! 由 `max_processing_time_ms` 截止时间兜底。

use super::action::{ActionResult, EmergencyOverride, OverlaySink, PauseHandle};
use super::config::{ConfigSource, EngineConfig};
use super::detector::{DetectionRequest, RegionDetector};
use super::error::{ConfigError, DetectorError, EngineError};
use super::escalation::{EscalationAction, EscalationDecision, EscalationMachine};
use super::frame::Frame;
use super::fusion::fuse;
use super::governor::{GovernorSignal, PerformanceGovernor, PerformanceSample, ProcessingMode};
use super::health::{CycleStatus, HealthMonitor, HealthReporter};
use super::region::DetectedRegion;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 单路信号在本周期的结果状态
#[derive(Debug, Clone, PartialEq)]
pub enum SignalStatus {
    Detected,
    NotConfigured,
    ModelNotReady,
    InferenceError(String),
    TimedOut,
    /// 主检测器出错后由降级检测器给出的结果
    Fallback { detector: String },
}

impl SignalStatus {
    fn from_error(error: &DetectorError) -> Self {
        match error {
            DetectorError::ModelNotReady => SignalStatus::ModelNotReady,
            DetectorError::InferenceError(message) => SignalStatus::InferenceError(message.clone()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, SignalStatus::Detected | SignalStatus::NotConfigured)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionOutcome {
    pub regions: Vec<DetectedRegion>,
    pub status: SignalStatus,
}

impl DetectionOutcome {
    pub fn detected(regions: Vec<DetectedRegion>) -> Self {
        Self {
            regions,
            status: SignalStatus::Detected,
        }
    }

    /// 出错/超时一律按空结果处理
    pub fn empty(status: SignalStatus) -> Self {
        Self {
            regions: vec![],
            status,
        }
    }

    fn from_result(result: Result<Vec<DetectedRegion>, DetectorError>) -> Self {
        match result {
            Ok(regions) => Self::detected(regions),
            Err(e) => Self::empty(SignalStatus::from_error(&e)),
        }
    }
}

/// 一个周期内两路检测的汇总
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSignals {
    pub face: DetectionOutcome,
    pub nsfw: DetectionOutcome,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub decision: EscalationDecision,
    pub status: CycleStatus,
    pub governor_signal: GovernorSignal,
    /// 本周期检测使用的模式（调节器可能已为下一周期切换）
    pub mode: ProcessingMode,
    pub face_status: SignalStatus,
    pub nsfw_status: SignalStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Decided(Box<CycleReport>),
    /// 紧急覆盖生效，输出 Idle / None
    Overridden,
    /// 宿主暂停，本帧不输出任何结果
    Cancelled,
    /// 没有可用配置，暂停决策
    Suspended { reason: String },
}

impl CycleOutcome {
    /// 交给遮罩层的动作，本帧不输出时为 `None`
    pub fn action(&self) -> Option<EscalationAction> {
        match self {
            CycleOutcome::Decided(report) => Some(report.decision.action),
            CycleOutcome::Overridden => Some(EscalationAction::None),
            CycleOutcome::Cancelled | CycleOutcome::Suspended { .. } => None,
        }
    }

    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Decided(report) => Some(report),
            _ => None,
        }
    }
}

type DetectionTask = JoinHandle<Result<Vec<DetectedRegion>, DetectorError>>;

/// 检测器 + 在途标记：上一次调用没有返回前不再派发新的调用
#[derive(Clone)]
pub struct DetectorSlot {
    detector: Arc<dyn RegionDetector>,
    in_flight: Arc<AtomicBool>,
}

/// 阻塞调用结束（包括 panic）时清除在途标记
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum PendingDetection {
    NotConfigured,
    /// 上一帧的调用还在运行
    Busy,
    Running(DetectionTask),
}

impl DetectorSlot {
    pub fn new(detector: Arc<dyn RegionDetector>) -> Self {
        Self {
            detector,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        self.detector.name()
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_ready()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn spawn(&self, frame: &Arc<Frame>, request: DetectionRequest) -> PendingDetection {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("[DETECT] '{}' still running an earlier frame, skipped", self.name());
            return PendingDetection::Busy;
        }

        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let detector = Arc::clone(&self.detector);
        let frame = Arc::clone(frame);
        PendingDetection::Running(tokio::task::spawn_blocking(move || {
            let _guard = guard;
            detector.detect(&frame, &request)
        }))
    }
}

pub struct EngineBuilder {
    face_detector: Option<Arc<dyn RegionDetector>>,
    nsfw_detector: Option<Arc<dyn RegionDetector>>,
    fallback_face_detector: Option<Arc<dyn RegionDetector>>,
    fallback_nsfw_detector: Option<Arc<dyn RegionDetector>>,
    config_source: Arc<dyn ConfigSource>,
    overlay: Option<Arc<dyn OverlaySink>>,
    initial_mode: ProcessingMode,
}

impl EngineBuilder {
    pub fn face_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.face_detector = Some(detector);
        self
    }

    pub fn nsfw_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.nsfw_detector = Some(detector);
        self
    }

    pub fn fallback_face_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.fallback_face_detector = Some(detector);
        self
    }

    pub fn fallback_nsfw_detector(mut self, detector: Arc<dyn RegionDetector>) -> Self {
        self.fallback_nsfw_detector = Some(detector);
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = source;
        self
    }

    pub fn overlay(mut self, overlay: Arc<dyn OverlaySink>) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn initial_mode(mut self, mode: ProcessingMode) -> Self {
        self.initial_mode = mode;
        self
    }

    pub fn build(self) -> Engine {
        let (pause, pause_rx) = PauseHandle::new();
        let mut engine = Engine {
            face_detector: self.face_detector.map(DetectorSlot::new),
            nsfw_detector: self.nsfw_detector.map(DetectorSlot::new),
            fallback_face_detector: self.fallback_face_detector.map(DetectorSlot::new),
            fallback_nsfw_detector: self.fallback_nsfw_detector.map(DetectorSlot::new),
            config_source: self.config_source,
            overlay: self.overlay,
            escalation: EscalationMachine::new(),
            governor: PerformanceGovernor::with_mode(self.initial_mode),
            health: HealthMonitor::new(),
            emergency: EmergencyOverride::new(),
            pause,
            pause_rx,
            host_readiness: (false, false),
            last_good_config: None,
            reported_config_error: None,
            override_applied: false,
        };
        engine.health.set_processing_mode(self.initial_mode);
        engine.refresh_readiness();

        info!(
            "🛡️ Engine: created (face={}, nsfw={}, mode={:?})",
            engine.face_detector.as_ref().map(|d| d.name()).unwrap_or("host"),
            engine.nsfw_detector.as_ref().map(|d| d.name()).unwrap_or("host"),
            self.initial_mode
        );
        engine
    }
}

/// 内容风险决策引擎，宿主启动时构造一个实例并把句柄分发给协作者
pub struct Engine {
    face_detector: Option<DetectorSlot>,
    nsfw_detector: Option<DetectorSlot>,
    fallback_face_detector: Option<DetectorSlot>,
    fallback_nsfw_detector: Option<DetectorSlot>,
    config_source: Arc<dyn ConfigSource>,
    overlay: Option<Arc<dyn OverlaySink>>,
    escalation: EscalationMachine,
    governor: PerformanceGovernor,
    health: HealthMonitor,
    emergency: EmergencyOverride,
    pause: PauseHandle,
    pause_rx: watch::Receiver<bool>,
    /// 推理在宿主侧运行时由宿主上报的就绪状态 (face, nsfw)
    host_readiness: (bool, bool),
    last_good_config: Option<EngineConfig>,
    reported_config_error: Option<ConfigError>,
    override_applied: bool,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            face_detector: None,
            nsfw_detector: None,
            fallback_face_detector: None,
            fallback_nsfw_detector: None,
            config_source: Arc::new(EngineConfig::default()),
            overlay: None,
            initial_mode: ProcessingMode::Accelerated,
        }
    }

    pub fn health_reporter(&self) -> HealthReporter {
        self.health.reporter()
    }

    pub fn emergency_override(&self) -> EmergencyOverride {
        self.emergency.clone()
    }

    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    pub fn mode(&self) -> ProcessingMode {
        self.governor.mode()
    }

    pub fn performance(&self) -> PerformanceSample {
        self.governor.sample()
    }

    pub fn frame_count(&self) -> u64 {
        self.escalation.frame_count()
    }

    pub fn set_capture_active(&mut self, active: bool) {
        self.health.set_capture_active(active);
        self.health.publish();
    }

    pub fn set_overlay_active(&mut self, active: bool) {
        self.health.set_overlay_active(active);
        self.health.publish();
    }

    /// 推理在宿主侧运行时，由宿主告知模型是否就绪
    pub fn set_model_readiness(&mut self, face_ready: bool, nsfw_ready: bool) {
        self.host_readiness = (face_ready, nsfw_ready);
        self.refresh_readiness();
    }

    pub fn refresh_readiness(&mut self) {
        let face_ready = self
            .face_detector
            .as_ref()
            .map(|d| d.is_ready())
            .unwrap_or(self.host_readiness.0);
        let nsfw_ready = self
            .nsfw_detector
            .as_ref()
            .map(|d| d.is_ready())
            .unwrap_or(self.host_readiness.1);
        self.health.set_readiness(face_ready, nsfw_ready);
        self.health.publish();
    }

    pub fn reset(&mut self) {
        info!("🔄 Engine: reset");
        self.escalation.reset();
        self.governor.reset();
        self.health.reset_cycles();
        self.health.publish();
    }

    /// 完整决策周期：并行检测 + 截止时间 + 降级 + 融合 + 升级
    pub async fn run_cycle(&mut self, frame: Arc<Frame>) -> CycleOutcome {
        let started = Instant::now();
        let config = match self.prepare_cycle() {
            Ok(config) => config,
            Err(outcome) => return outcome,
        };
        self.refresh_readiness();

        let mode = self.governor.mode();
        let request = DetectionRequest {
            mode,
            sensitivity: config.detection_sensitivity,
        };
        let frame = match mode {
            ProcessingMode::Accelerated => frame,
            ProcessingMode::Standard => frame
                .downscaled(config.standard_mode_max_dimension)
                .map(Arc::new)
                .unwrap_or(frame),
        };
        let deadline = tokio::time::Instant::from_std(started)
            + Duration::from_millis(config.max_processing_time_ms);

        debug!(
            "[CYCLE] frame {} ({}x{}) mode={:?}",
            frame.frame_number, frame.width, frame.height, mode
        );

        let face_task = Self::spawn_detection(self.face_detector.as_ref(), &frame, request);
        let nsfw_task = Self::spawn_detection(self.nsfw_detector.as_ref(), &frame, request);

        let mut pause_rx = self.pause_rx.clone();
        let (face, nsfw) = tokio::select! {
            biased;
            _ = wait_for_pause(&mut pause_rx) => {
                info!("⏸️ [CYCLE] frame {} cancelled, discarding partial results", frame.frame_number);
                return CycleOutcome::Cancelled;
            }
            gathered = async {
                tokio::join!(
                    Self::await_detection(face_task, deadline),
                    Self::await_detection(nsfw_task, deadline)
                )
            } => gathered,
        };

        let (face, nsfw) = if config.enable_fallback_detection {
            let face_fallback = Self::with_fallback(
                face,
                self.fallback_face_detector.as_ref(),
                &frame,
                request,
                deadline,
            );
            let nsfw_fallback = Self::with_fallback(
                nsfw,
                self.fallback_nsfw_detector.as_ref(),
                &frame,
                request,
                deadline,
            );
            tokio::select! {
                biased;
                _ = wait_for_pause(&mut pause_rx) => {
                    info!("⏸️ [CYCLE] frame {} cancelled during fallback", frame.frame_number);
                    return CycleOutcome::Cancelled;
                }
                outcome = async { tokio::join!(face_fallback, nsfw_fallback) } => outcome,
            }
        } else {
            (face, nsfw)
        };

        let signals = CycleSignals {
            face,
            nsfw,
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        self.finish_cycle(signals, &config, mode)
    }

    /// 宿主已经完成推理时使用：直接从两路结果做决策
    pub fn decide(&mut self, signals: CycleSignals) -> CycleOutcome {
        let config = match self.prepare_cycle() {
            Ok(config) => config,
            Err(outcome) => return outcome,
        };
        let mode = self.governor.mode();
        self.finish_cycle(signals, &config, mode)
    }

    /// 周期边界检查：暂停、紧急覆盖、配置
    fn prepare_cycle(&mut self) -> Result<EngineConfig, CycleOutcome> {
        if self.pause.is_paused() {
            return Err(CycleOutcome::Cancelled);
        }

        if self.emergency.is_engaged() {
            if !self.override_applied {
                self.override_applied = true;
                self.escalation.reset();
                self.health.set_override_engaged(true);
                if let Some(overlay) = &self.overlay {
                    if let ActionResult::Failure { reason } = overlay.hide_all() {
                        error!("❌ [OVERRIDE] hide_all failed: {}", reason);
                        self.health.record_error(format!("hide_all failed: {}", reason));
                    }
                }
                self.health.publish();
            }
            return Err(CycleOutcome::Overridden);
        }
        if self.override_applied {
            self.override_applied = false;
            self.health.set_override_engaged(false);
            self.health.publish();
        }

        match self.resolve_config() {
            Ok(config) => Ok(config),
            Err(e) => {
                let reason = e.to_string();
                self.health.set_fatal(Some(reason.clone()));
                self.health.record_cycle(
                    CycleStatus::Failed,
                    EscalationAction::None,
                    0.0,
                    self.governor.mean_ms(),
                    EngineConfig::default().health_window,
                );
                self.health.publish();
                Err(CycleOutcome::Suspended { reason })
            }
        }
    }

    /// 读取本周期配置；出错时上报一次并回退到 last-known-good
    fn resolve_config(&mut self) -> Result<EngineConfig, EngineError> {
        let loaded = self
            .config_source
            .load()
            .and_then(|config| config.validate().map(|_| config));

        match loaded {
            Ok(config) => {
                if self.reported_config_error.take().is_some() {
                    info!("✅ [CONFIG] valid configuration restored");
                }
                if self.health.fatal_error().is_some() {
                    self.health.set_fatal(None);
                }
                self.last_good_config = Some(config.clone());
                Ok(config)
            }
            Err(e) => {
                if self.reported_config_error.as_ref() != Some(&e) {
                    error!("❌ [CONFIG] {}", EngineError::from(e.clone()));
                    self.health.record_error(EngineError::from(e.clone()).to_string());
                    self.reported_config_error = Some(e.clone());
                }
                match &self.last_good_config {
                    Some(config) => {
                        debug!("[CONFIG] using last-known-good configuration");
                        Ok(config.clone())
                    }
                    None => Err(EngineError::InvalidConfig(e)),
                }
            }
        }
    }

    fn finish_cycle(
        &mut self,
        signals: CycleSignals,
        config: &EngineConfig,
        mode: ProcessingMode,
    ) -> CycleOutcome {
        self.note_signal("face", &signals.face.status);
        self.note_signal("nsfw", &signals.nsfw.status);

        let analysis = fuse(&signals.face.regions, &signals.nsfw.regions, config)
            .with_processing_time(signals.elapsed_ms);
        let decision = self.escalation.evaluate(analysis, config);

        let timed_out = signals.face.status == SignalStatus::TimedOut
            || signals.nsfw.status == SignalStatus::TimedOut;
        let status = if timed_out || signals.elapsed_ms > config.max_processing_time_ms as f64 {
            warn!(
                "⏱️ [CYCLE] missed deadline: {:.1}ms > {}ms",
                signals.elapsed_ms, config.max_processing_time_ms
            );
            CycleStatus::MissedDeadline
        } else {
            CycleStatus::Completed
        };

        let governor_signal = self.governor.record(
            signals.elapsed_ms,
            config.max_processing_time_ms,
            &config.governor,
        );

        if let Some(overlay) = &self.overlay {
            if let ActionResult::Failure { reason } = overlay.apply(&decision) {
                warn!("⚠️ [OVERLAY] apply failed: {}", reason);
                self.health.record_error(format!("overlay apply failed: {}", reason));
            }
        }

        self.health.set_processing_mode(self.governor.mode());
        self.health.record_cycle(
            status,
            decision.action,
            signals.elapsed_ms,
            self.governor.mean_ms(),
            config.health_window,
        );
        self.health.publish();

        CycleOutcome::Decided(Box::new(CycleReport {
            decision,
            status,
            governor_signal,
            mode,
            face_status: signals.face.status,
            nsfw_status: signals.nsfw.status,
        }))
    }

    fn note_signal(&mut self, signal: &str, status: &SignalStatus) {
        match status {
            SignalStatus::Detected | SignalStatus::NotConfigured => {}
            SignalStatus::Fallback { detector } => {
                self.health.record_fallback();
                info!("🩹 [{}] primary failed, used fallback '{}'", signal, detector);
            }
            SignalStatus::ModelNotReady => {
                debug!("[{}] model not ready, treated as empty", signal);
                self.health.record_error(format!("{}: model not ready", signal));
            }
            SignalStatus::InferenceError(message) => {
                warn!("⚠️ [{}] inference error: {}", signal, message);
                self.health.record_error(format!("{}: {}", signal, message));
            }
            SignalStatus::TimedOut => {
                warn!("⏱️ [{}] detector missed the deadline, treated as empty", signal);
                self.health.record_error(format!("{}: timed out", signal));
            }
        }
    }

    fn spawn_detection(
        slot: Option<&DetectorSlot>,
        frame: &Arc<Frame>,
        request: DetectionRequest,
    ) -> PendingDetection {
        match slot {
            Some(slot) => slot.spawn(frame, request),
            None => PendingDetection::NotConfigured,
        }
    }

    /// 超时后丢弃 JoinHandle，阻塞线程上的结果不再被读取；
    /// 在途标记保留到调用真正返回
    async fn await_detection(
        pending: PendingDetection,
        deadline: tokio::time::Instant,
    ) -> DetectionOutcome {
        let task = match pending {
            PendingDetection::NotConfigured => {
                return DetectionOutcome::empty(SignalStatus::NotConfigured)
            }
            PendingDetection::Busy => return DetectionOutcome::empty(SignalStatus::TimedOut),
            PendingDetection::Running(task) => task,
        };

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => DetectionOutcome::from_result(result),
            Ok(Err(join_error)) => DetectionOutcome::empty(SignalStatus::InferenceError(format!(
                "detector task failed: {}",
                join_error
            ))),
            Err(_) => DetectionOutcome::empty(SignalStatus::TimedOut),
        }
    }

    async fn with_fallback(
        primary: DetectionOutcome,
        fallback: Option<&DetectorSlot>,
        frame: &Arc<Frame>,
        request: DetectionRequest,
        deadline: tokio::time::Instant,
    ) -> DetectionOutcome {
        if !matches!(primary.status, SignalStatus::InferenceError(_)) {
            return primary;
        }
        let Some(fallback) = fallback else {
            return primary;
        };
        if tokio::time::Instant::now() >= deadline {
            debug!("[FALLBACK] no budget left for '{}'", fallback.name());
            return primary;
        }

        let name = fallback.name().to_string();
        let outcome = detect_before(fallback, frame, request, deadline).await;
        match outcome.status {
            SignalStatus::Detected => DetectionOutcome {
                regions: outcome.regions,
                status: SignalStatus::Fallback { detector: name },
            },
            other => {
                warn!("⚠️ [FALLBACK] '{}' also failed: {:?}", name, other);
                primary
            }
        }
    }
}

/// 在截止时间前运行单个检测器，迟到或出错都折算成空结果
pub async fn detect_before(
    slot: &DetectorSlot,
    frame: &Arc<Frame>,
    request: DetectionRequest,
    deadline: tokio::time::Instant,
) -> DetectionOutcome {
    Engine::await_detection(slot.spawn(frame, request), deadline).await
}

async fn wait_for_pause(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::safety::config::ConfigStore;
    use crate::core::safety::detector::MockDetector;
    use crate::core::safety::escalation::EscalationState;
    use crate::core::safety::region::{Gender, RegionRect, RegionSource};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_frame(frame_number: u64) -> Arc<Frame> {
        Arc::new(Frame::new(
            64,
            64,
            vec![128u8; 64 * 64 * 4],
            frame_number * 33,
            frame_number,
        ))
    }

    fn female_face(gender_confidence: f32) -> DetectedRegion {
        DetectedRegion::face(
            RegionRect::new(0.3, 0.2, 0.2, 0.25),
            0.9,
            Gender::Female,
            gender_confidence,
        )
    }

    fn nsfw_regions(count: u32) -> Vec<DetectedRegion> {
        (0..count)
            .map(|i| DetectedRegion::nsfw(RegionRect::new(0.1 * i as f32, 0.5, 0.1, 0.1), 0.9))
            .collect()
    }

    fn config_with_budget(max_processing_time_ms: u64) -> EngineConfig {
        EngineConfig {
            max_processing_time_ms,
            ..Default::default()
        }
    }

    fn engine_with(
        face: MockDetector,
        nsfw: MockDetector,
        config: EngineConfig,
    ) -> Engine {
        Engine::builder()
            .face_detector(Arc::new(face))
            .nsfw_detector(Arc::new(nsfw))
            .config_source(Arc::new(config))
            .build()
    }

    fn signals(face: Vec<DetectedRegion>, nsfw: Vec<DetectedRegion>) -> CycleSignals {
        CycleSignals {
            face: DetectionOutcome::detected(face),
            nsfw: DetectionOutcome::detected(nsfw),
            elapsed_ms: 10.0,
        }
    }

    fn action_of(outcome: &CycleOutcome) -> EscalationAction {
        outcome.action().expect("cycle should emit an action")
    }

    #[derive(Default)]
    struct RecordingOverlay {
        applied: Mutex<Vec<EscalationAction>>,
        hides: AtomicUsize,
    }

    impl OverlaySink for RecordingOverlay {
        fn apply(&self, decision: &EscalationDecision) -> ActionResult {
            self.applied.lock().unwrap().push(decision.action);
            ActionResult::success(format!("{:?}", decision.action))
        }

        fn hide_all(&self) -> ActionResult {
            self.hides.fetch_add(1, Ordering::SeqCst);
            ActionResult::success("hidden")
        }
    }

    struct BrokenOverlay;

    impl OverlaySink for BrokenOverlay {
        fn apply(&self, _decision: &EscalationDecision) -> ActionResult {
            ActionResult::failure("surface lost")
        }

        fn hide_all(&self) -> ActionResult {
            ActionResult::failure("surface lost")
        }
    }

    #[tokio::test]
    async fn test_empty_frame_yields_none() {
        let mut engine = engine_with(
            MockDetector::new(RegionSource::Face),
            MockDetector::new(RegionSource::Nsfw),
            EngineConfig::default(),
        );

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert_eq!(report.decision.action, EscalationAction::None);
        assert!(!report.decision.analysis.should_blur);
        assert_eq!(report.status, CycleStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_face_selective_blur() {
        let mut engine = engine_with(
            MockDetector::with_regions(RegionSource::Face, vec![female_face(0.75)]),
            MockDetector::new(RegionSource::Nsfw),
            EngineConfig::default(),
        );

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert_eq!(report.decision.action, EscalationAction::SelectiveBlur);
        assert_eq!(report.decision.analysis.nsfw_region_count, 0);
        assert_eq!(report.decision.regions.len(), 1);
    }

    #[tokio::test]
    async fn test_region_count_escalation_and_hysteresis() {
        let mut engine = engine_with(
            MockDetector::new(RegionSource::Face),
            MockDetector::with_pattern(RegionSource::Nsfw, |n| {
                if n == 1 {
                    nsfw_regions(8)
                } else {
                    vec![]
                }
            }),
            EngineConfig::default(),
        );

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.decision.action, EscalationAction::FullScreenBlur);
        assert!(report.decision.triggered_by_region_count);

        for n in 2..=3 {
            let outcome = engine.run_cycle(test_frame(n)).await;
            assert_eq!(action_of(&outcome), EscalationAction::FullScreenBlur);
        }

        let outcome = engine.run_cycle(test_frame(4)).await;
        assert_eq!(action_of(&outcome), EscalationAction::None);
    }

    #[tokio::test]
    async fn test_hung_face_detector_uses_nsfw_only() {
        let mut engine = engine_with(
            MockDetector::with_regions(RegionSource::Face, vec![female_face(0.9)])
                .delayed(Duration::from_millis(400)),
            MockDetector::with_regions(RegionSource::Nsfw, nsfw_regions(1)),
            config_with_budget(50),
        );
        let reporter = engine.health_reporter();

        let started = Instant::now();
        let outcome = engine.run_cycle(test_frame(1)).await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(250), "took {:?}", elapsed);
        let report = outcome.report().unwrap();
        assert_eq!(report.face_status, SignalStatus::TimedOut);
        assert_eq!(report.status, CycleStatus::MissedDeadline);
        assert_eq!(report.decision.action, EscalationAction::SelectiveBlur);
        assert_eq!(report.decision.analysis.female_face_count, 0);
        assert_eq!(report.decision.analysis.nsfw_region_count, 1);

        let health = reporter.snapshot();
        assert!(health.missed_deadline);
        assert!(!health.is_healthy);
    }

    #[tokio::test]
    async fn test_both_detectors_hung_yields_none() {
        let mut engine = engine_with(
            MockDetector::with_regions(RegionSource::Face, vec![female_face(0.9)])
                .delayed(Duration::from_millis(300)),
            MockDetector::with_regions(RegionSource::Nsfw, nsfw_regions(6))
                .delayed(Duration::from_millis(300)),
            config_with_budget(30),
        );

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert_eq!(report.decision.action, EscalationAction::None);
        assert_eq!(report.nsfw_status, SignalStatus::TimedOut);
    }

    /// 一直阻塞到 release 为止，记录调用次数和最大并发
    #[derive(Default)]
    struct GateDetector {
        released: AtomicBool,
        calls: AtomicUsize,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl RegionDetector for GateDetector {
        fn name(&self) -> &str {
            "gate"
        }

        fn source(&self) -> RegionSource {
            RegionSource::Face
        }

        fn detect(
            &self,
            _frame: &Frame,
            _request: &DetectionRequest,
        ) -> Result<Vec<DetectedRegion>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![female_face(0.9)])
        }
    }

    #[tokio::test]
    async fn test_hung_detector_is_not_spawned_again() {
        let gate = Arc::new(GateDetector::default());
        let mut engine = Engine::builder()
            .face_detector(gate.clone())
            .nsfw_detector(Arc::new(MockDetector::new(RegionSource::Nsfw)))
            .config_source(Arc::new(config_with_budget(20)))
            .build();

        for n in 1..=5 {
            let outcome = engine.run_cycle(test_frame(n)).await;
            let report = outcome.report().expect("cycle should decide");
            assert_eq!(report.face_status, SignalStatus::TimedOut);
            assert_eq!(report.decision.action, EscalationAction::None);
        }
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gate.max_running.load(Ordering::SeqCst), 1);

        let slot = engine.face_detector.clone().expect("face slot");
        assert!(slot.is_busy());
        gate.released.store(true, Ordering::SeqCst);
        for _ in 0..200 {
            if !slot.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!slot.is_busy());

        let outcome = engine.run_cycle(test_frame(6)).await;
        let report = outcome.report().expect("cycle should decide");
        assert_eq!(report.face_status, SignalStatus::Detected);
        assert_eq!(report.decision.action, EscalationAction::SelectiveBlur);
        assert_eq!(gate.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_inference_error_uses_fallback() {
        let mut engine = Engine::builder()
            .face_detector(Arc::new(MockDetector::failing(
                RegionSource::Face,
                DetectorError::InferenceError("delegate crashed".to_string()),
            )))
            .fallback_face_detector(Arc::new(
                MockDetector::with_regions(RegionSource::Face, vec![female_face(0.8)])
                    .named("cpu-face"),
            ))
            .nsfw_detector(Arc::new(MockDetector::new(RegionSource::Nsfw)))
            .build();
        let reporter = engine.health_reporter();

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert_eq!(
            report.face_status,
            SignalStatus::Fallback {
                detector: "cpu-face".to_string()
            }
        );
        assert_eq!(report.decision.action, EscalationAction::SelectiveBlur);
        assert_eq!(reporter.snapshot().fallback_activations, 1);
    }

    #[tokio::test]
    async fn test_fallback_disabled_treats_error_as_empty() {
        let config = EngineConfig {
            enable_fallback_detection: false,
            ..Default::default()
        };
        let mut engine = Engine::builder()
            .face_detector(Arc::new(MockDetector::failing(
                RegionSource::Face,
                DetectorError::InferenceError("delegate crashed".to_string()),
            )))
            .fallback_face_detector(Arc::new(MockDetector::with_regions(
                RegionSource::Face,
                vec![female_face(0.8)],
            )))
            .nsfw_detector(Arc::new(MockDetector::with_regions(
                RegionSource::Nsfw,
                nsfw_regions(1),
            )))
            .config_source(Arc::new(config))
            .build();
        let reporter = engine.health_reporter();

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert!(matches!(report.face_status, SignalStatus::InferenceError(_)));
        assert_eq!(report.decision.analysis.female_face_count, 0);
        assert_eq!(report.decision.action, EscalationAction::SelectiveBlur);
        assert_eq!(report.status, CycleStatus::Completed);

        let health = reporter.snapshot();
        assert!(health.last_error.unwrap().contains("delegate crashed"));
        assert_eq!(health.fallback_activations, 0);
    }

    #[tokio::test]
    async fn test_model_not_ready_is_not_fatal() {
        let face = MockDetector::with_regions(RegionSource::Face, vec![female_face(0.9)]);
        face.set_ready(false);
        let mut engine = engine_with(
            face,
            MockDetector::new(RegionSource::Nsfw),
            EngineConfig::default(),
        );
        let reporter = engine.health_reporter();

        let outcome = engine.run_cycle(test_frame(1)).await;
        let report = outcome.report().unwrap();

        assert_eq!(report.face_status, SignalStatus::ModelNotReady);
        assert_eq!(report.decision.action, EscalationAction::None);

        let health = reporter.snapshot();
        assert!(!health.face_model_ready);
        assert!(!health.is_healthy);
        assert!(health.fatal_error.is_none());
    }

    #[tokio::test]
    async fn test_pause_cancels_in_flight_cycle() {
        let mut engine = engine_with(
            MockDetector::with_regions(RegionSource::Face, vec![female_face(0.9)])
                .delayed(Duration::from_millis(200)),
            MockDetector::new(RegionSource::Nsfw).delayed(Duration::from_millis(200)),
            config_with_budget(1000),
        );
        let pause = engine.pause_handle();

        let pauser = pause.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pauser.pause();
        });

        let outcome = engine.run_cycle(test_frame(1)).await;
        assert_eq!(outcome, CycleOutcome::Cancelled);
        assert_eq!(engine.frame_count(), 0);
        assert!(engine.performance().durations_ms.is_empty());

        let outcome = engine.run_cycle(test_frame(2)).await;
        assert_eq!(outcome, CycleOutcome::Cancelled);

        // 等被取消的检测线程跑完
        tokio::time::sleep(Duration::from_millis(300)).await;
        pause.resume();
        let outcome = engine.run_cycle(test_frame(3)).await;
        assert_eq!(action_of(&outcome), EscalationAction::SelectiveBlur);
    }

    #[tokio::test]
    async fn test_emergency_override_forces_none() {
        let overlay = Arc::new(RecordingOverlay::default());
        let mut engine = Engine::builder()
            .nsfw_detector(Arc::new(MockDetector::with_regions(
                RegionSource::Nsfw,
                nsfw_regions(8),
            )))
            .face_detector(Arc::new(MockDetector::new(RegionSource::Face)))
            .overlay(overlay.clone())
            .build();
        let emergency = engine.emergency_override();
        let reporter = engine.health_reporter();

        let outcome = engine.run_cycle(test_frame(1)).await;
        assert_eq!(action_of(&outcome), EscalationAction::FullScreenBlur);

        emergency.engage();
        for n in 2..=3 {
            let outcome = engine.run_cycle(test_frame(n)).await;
            assert_eq!(outcome, CycleOutcome::Overridden);
            assert_eq!(action_of(&outcome), EscalationAction::None);
        }
        assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);
        assert!(reporter.snapshot().override_engaged);

        emergency.release();
        let outcome = engine.run_cycle(test_frame(4)).await;
        assert_eq!(action_of(&outcome), EscalationAction::FullScreenBlur);
        assert!(!reporter.snapshot().override_engaged);
        assert_eq!(
            *overlay.applied.lock().unwrap(),
            vec![
                EscalationAction::FullScreenBlur,
                EscalationAction::FullScreenBlur
            ]
        );
    }

    #[test]
    fn test_override_resets_hysteresis() {
        let mut engine = Engine::builder().build();
        engine.decide(signals(vec![], nsfw_regions(8)));

        engine.emergency_override().engage();
        assert_eq!(engine.decide(signals(vec![], vec![])), CycleOutcome::Overridden);
        engine.emergency_override().release();

        let outcome = engine.decide(signals(vec![], vec![]));
        let report = outcome.report().unwrap();
        assert_eq!(report.decision.state, EscalationState::Idle);
    }

    #[test]
    fn test_overlay_failure_reported_not_raised() {
        let mut engine = Engine::builder().overlay(Arc::new(BrokenOverlay)).build();
        let reporter = engine.health_reporter();

        let outcome = engine.decide(signals(vec![female_face(0.9)], vec![]));
        assert_eq!(action_of(&outcome), EscalationAction::SelectiveBlur);
        assert!(reporter
            .snapshot()
            .last_error
            .unwrap()
            .contains("surface lost"));
    }

    #[test]
    fn test_missing_config_suspends_until_valid() {
        let store = Arc::new(ConfigStore::new());
        let mut engine = Engine::builder().config_source(store.clone()).build();
        let reporter = engine.health_reporter();

        let outcome = engine.decide(signals(vec![female_face(0.9)], vec![]));
        assert!(matches!(outcome, CycleOutcome::Suspended { .. }));
        assert_eq!(outcome.action(), None);
        let health = reporter.snapshot();
        assert!(health.fatal_error.is_some());
        assert!(!health.is_healthy);
        assert_eq!(health.recent_cycles, vec![CycleStatus::Failed]);

        store.replace(EngineConfig::default());
        let outcome = engine.decide(signals(vec![female_face(0.9)], vec![]));
        assert_eq!(action_of(&outcome), EscalationAction::SelectiveBlur);
        assert!(reporter.snapshot().fatal_error.is_none());
    }

    #[test]
    fn test_invalid_config_falls_back_to_last_known_good() {
        let store = Arc::new(ConfigStore::with_config(EngineConfig {
            full_screen_escalation_region_count: 2,
            ..Default::default()
        }));
        let mut engine = Engine::builder().config_source(store.clone()).build();
        let reporter = engine.health_reporter();

        engine.decide(signals(vec![], vec![]));

        assert!(store.replace_from_json(r#"{"nsfwConfidenceThreshold": 7}"#).is_err());
        let outcome = engine.decide(signals(vec![], nsfw_regions(2)));
        assert_eq!(action_of(&outcome), EscalationAction::FullScreenBlur);

        let health = reporter.snapshot();
        assert!(health.fatal_error.is_none());
        assert!(health
            .last_error
            .unwrap()
            .contains("nsfwConfidenceThreshold"));
    }

    #[test]
    fn test_invalid_static_config_is_rejected() {
        let mut engine = Engine::builder()
            .config_source(Arc::new(EngineConfig {
                enable_full_screen_blur_for_nsfw: true,
                ..Default::default()
            }))
            .build();

        let outcome = engine.decide(signals(vec![], nsfw_regions(1)));
        match outcome {
            CycleOutcome::Suspended { reason } => {
                assert!(reason.contains("nsfwEmergencyConfidence"))
            }
            other => panic!("expected suspension, got {:?}", other),
        }
    }

    #[test]
    fn test_governor_degrades_after_slow_cycles() {
        let mut engine = Engine::builder().build();
        let reporter = engine.health_reporter();

        let mut last = GovernorSignal::Steady;
        for _ in 0..3 {
            let outcome = engine.decide(CycleSignals {
                elapsed_ms: 250.0,
                ..signals(vec![], vec![])
            });
            last = outcome.report().unwrap().governor_signal;
        }

        assert_eq!(last, GovernorSignal::Degrade);
        assert_eq!(engine.mode(), ProcessingMode::Standard);
        assert_eq!(reporter.snapshot().processing_mode, ProcessingMode::Standard);
    }

    #[tokio::test]
    async fn test_standard_mode_downscales_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        struct SizeRecorder(Arc<Mutex<Vec<(u32, u32, ProcessingMode)>>>);
        impl RegionDetector for SizeRecorder {
            fn name(&self) -> &str {
                "size-recorder"
            }
            fn source(&self) -> RegionSource {
                RegionSource::Nsfw
            }
            fn detect(
                &self,
                frame: &Frame,
                request: &DetectionRequest,
            ) -> Result<Vec<DetectedRegion>, DetectorError> {
                self.0
                    .lock()
                    .unwrap()
                    .push((frame.width, frame.height, request.mode));
                Ok(vec![])
            }
        }

        let mut engine = Engine::builder()
            .nsfw_detector(Arc::new(SizeRecorder(seen.clone())))
            .initial_mode(ProcessingMode::Standard)
            .build();
        let frame = Arc::new(Frame::new(1280, 640, vec![0u8; 1280 * 640 * 4], 0, 1));
        engine.run_cycle(frame).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![(320, 160, ProcessingMode::Standard)]
        );
    }

    #[tokio::test]
    async fn test_health_snapshot_idempotent_between_cycles() {
        let mut engine = engine_with(
            MockDetector::with_regions(RegionSource::Face, vec![female_face(0.9)]),
            MockDetector::new(RegionSource::Nsfw),
            EngineConfig::default(),
        );
        let reporter = engine.health_reporter();
        engine.run_cycle(test_frame(1)).await;

        let first = reporter.snapshot();
        let second = reporter.snapshot();
        assert_eq!(first, second);
        assert!(first.is_healthy);
        assert_eq!(first.last_action, EscalationAction::SelectiveBlur);
        assert_eq!(first.cycles_total, 1);
    }

    #[test]
    fn test_host_readiness_without_detectors() {
        let mut engine = Engine::builder().build();
        let reporter = engine.health_reporter();
        assert!(!reporter.snapshot().is_healthy);

        engine.set_model_readiness(true, true);
        engine.set_capture_active(true);
        engine.set_overlay_active(true);

        let health = reporter.snapshot();
        assert!(health.is_healthy);
        assert!(health.capture_active);
        assert!(health.overlay_active);
    }
}
