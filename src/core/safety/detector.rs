use super::error::DetectorError;
use super::frame::Frame;
use super::governor::ProcessingMode;
use super::region::{DetectedRegion, RegionSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// 每个周期传给适配器的参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionRequest {
    pub mode: ProcessingMode,
    /// 全局灵敏度滑块 (0.0 - 1.0)，由适配器自行解释
    pub sensitivity: f32,
}

impl Default for DetectionRequest {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Accelerated,
            sensitivity: 0.5,
        }
    }
}

/// 检测信号适配器：包装外部的人脸/性别分类器或 NSFW 分类器
///
/// 实现可以阻塞（推理是 CPU/GPU 密集型），引擎会在独立的阻塞线程上调用。
pub trait RegionDetector: Send + Sync {
    fn name(&self) -> &str;

    /// 该适配器产出哪一路信号
    fn source(&self) -> RegionSource;

    fn is_ready(&self) -> bool {
        true
    }

    fn detect(
        &self,
        frame: &Frame,
        request: &DetectionRequest,
    ) -> Result<Vec<DetectedRegion>, DetectorError>;
}

type RegionPattern = Box<dyn Fn(u64) -> Vec<DetectedRegion> + Send + Sync>;

/// 测试用检测器：按帧号返回预设区域，可模拟延迟、错误和未就绪
pub struct MockDetector {
    name: String,
    source: RegionSource,
    pattern: Option<RegionPattern>,
    error: Option<DetectorError>,
    latency: Option<Duration>,
    ready: AtomicBool,
}

impl MockDetector {
    pub fn new(source: RegionSource) -> Self {
        Self {
            name: format!("mock-{:?}", source).to_lowercase(),
            source,
            pattern: None,
            error: None,
            latency: None,
            ready: AtomicBool::new(true),
        }
    }

    pub fn with_pattern<F>(source: RegionSource, pattern: F) -> Self
    where
        F: Fn(u64) -> Vec<DetectedRegion> + Send + Sync + 'static,
    {
        Self {
            pattern: Some(Box::new(pattern)),
            ..Self::new(source)
        }
    }

    pub fn with_regions(source: RegionSource, regions: Vec<DetectedRegion>) -> Self {
        Self::with_pattern(source, move |_| regions.clone())
    }

    pub fn failing(source: RegionSource, error: DetectorError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(source)
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn delayed(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl RegionDetector for MockDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> RegionSource {
        self.source
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn detect(
        &self,
        frame: &Frame,
        _request: &DetectionRequest,
    ) -> Result<Vec<DetectedRegion>, DetectorError> {
        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }
        if !self.is_ready() {
            return Err(DetectorError::ModelNotReady);
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }

        Ok(self
            .pattern
            .as_ref()
            .map(|p| p(frame.frame_number))
            .unwrap_or_default())
    }
}

/// 空检测器：永远返回安全，用于关闭某一路信号
pub struct NoOpDetector {
    source: RegionSource,
}

impl NoOpDetector {
    pub fn new(source: RegionSource) -> Self {
        Self { source }
    }
}

impl RegionDetector for NoOpDetector {
    fn name(&self) -> &str {
        "noop"
    }

    fn source(&self) -> RegionSource {
        self.source
    }

    fn detect(
        &self,
        _frame: &Frame,
        _request: &DetectionRequest,
    ) -> Result<Vec<DetectedRegion>, DetectorError> {
        Ok(vec![])
    }
}
