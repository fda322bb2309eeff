//! 风险融合策略
//!
//! 把人脸/性别信号和 NSFW 信号按各自阈值过滤后合并成一个区域集合。
//! 纯函数：同样的输入和配置永远得到同样的 `FrameAnalysis`。

use super::config::EngineConfig;
use super::region::{DetectedRegion, RegionSource};
use serde::{Deserialize, Serialize};

/// 整帧风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum RiskLevel {
    #[default]
    Safe,
    /// 只有目标人脸
    Sensitive,
    /// 至少一个 NSFW 区域
    Explicit,
}

/// 单帧融合结果，决策周期内由引擎独占，之后以只读快照交给调用方
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub regions: Vec<DetectedRegion>,
    pub nsfw_region_count: u32,
    pub max_nsfw_confidence: f32,
    pub female_face_count: u32,
    pub should_blur: bool,
    pub processing_time_ms: f64,
    pub risk: RiskLevel,
}

impl FrameAnalysis {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_processing_time(mut self, processing_time_ms: f64) -> Self {
        self.processing_time_ms = processing_time_ms;
        self
    }
}

/// 闭区间比较；NaN 一律不通过
fn passes(confidence: f32, threshold: f32) -> bool {
    confidence >= threshold
}

fn keep_face(region: &DetectedRegion, config: &EngineConfig) -> bool {
    region.source == RegionSource::Face
        && region.is_female_face()
        && region
            .gender
            .map(|g| passes(g.confidence, config.gender_confidence_threshold))
            .unwrap_or(false)
}

fn keep_nsfw(region: &DetectedRegion, config: &EngineConfig) -> bool {
    region.source == RegionSource::Nsfw && passes(region.confidence, config.nsfw_confidence_threshold)
}

/// 融合两路检测结果
///
/// 不做去重：不同来源的区域即使空间重叠也分别保留，重叠由渲染端处理。
/// 任一路没有结果都是合法的（视为安全），不会出错。
pub fn fuse(
    face_regions: &[DetectedRegion],
    nsfw_regions: &[DetectedRegion],
    config: &EngineConfig,
) -> FrameAnalysis {
    let faces: Vec<DetectedRegion> = face_regions
        .iter()
        .filter(|r| keep_face(r, config))
        .cloned()
        .collect();
    let nsfw: Vec<DetectedRegion> = nsfw_regions
        .iter()
        .filter(|r| keep_nsfw(r, config))
        .cloned()
        .collect();

    let female_face_count = faces.len() as u32;
    let nsfw_region_count = nsfw.len() as u32;
    let max_nsfw_confidence = nsfw.iter().map(|r| r.confidence).fold(0.0f32, f32::max);

    let risk = if nsfw_region_count > 0 {
        RiskLevel::Explicit
    } else if female_face_count > 0 {
        RiskLevel::Sensitive
    } else {
        RiskLevel::Safe
    };

    let mut regions = faces;
    regions.extend(nsfw);

    FrameAnalysis {
        should_blur: !regions.is_empty(),
        regions,
        nsfw_region_count,
        max_nsfw_confidence,
        female_face_count,
        processing_time_ms: 0.0,
        risk,
    }
}
