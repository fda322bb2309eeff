//! 基于肤色比例的轻量 NSFW 检测器（用于降级场景）
//!
//! 主模型出错时作为替补方法：把画面切成网格，统计每格的肤色像素比例，
//! 比例过高的格子作为 NSFW 区域上报。精度远低于模型，只求不漏掉大面积裸露。

use super::detector::{DetectionRequest, RegionDetector};
use super::error::DetectorError;
use super::frame::Frame;
use super::governor::ProcessingMode;
use super::region::{DetectedRegion, RegionRect, RegionSource};
use rayon::prelude::*;

/// 启发式结果的置信度上限，避免触发紧急全屏升级
const HEURISTIC_CONFIDENCE_CAP: f32 = 0.75;

pub struct SkinToneDetector {
    grid_cols: u32,
    grid_rows: u32,
    min_skin_ratio: f32,
}

impl SkinToneDetector {
    pub fn new() -> Self {
        Self {
            grid_cols: 4,
            grid_rows: 4,
            min_skin_ratio: 0.45,
        }
    }

    pub fn with_grid(cols: u32, rows: u32) -> Self {
        Self {
            grid_cols: cols.max(1),
            grid_rows: rows.max(1),
            ..Self::new()
        }
    }

    /// Kovac RGB skin rule (daylight).
    fn is_skin(r: u8, g: u8, b: u8) -> bool {
        let (r, g, b) = (r as i16, g as i16, b as i16);
        let max = r.max(g).max(b);
        let min = r.min(g).min(b);

        r > 95 && g > 40 && b > 20 && max - min > 15 && (r - g).abs() > 15 && r > g && r > b
    }

    fn cell_skin_ratio(frame: &Frame, x0: u32, y0: u32, x1: u32, y1: u32, step: usize) -> f32 {
        let w = frame.width as usize;
        let mut skin = 0u32;
        let mut total = 0u32;

        for y in (y0 as usize..y1 as usize).step_by(step) {
            for x in (x0 as usize..x1 as usize).step_by(step) {
                let idx = (y * w + x) * 4;
                let px = &frame.data[idx..idx + 4];
                if Self::is_skin(px[0], px[1], px[2]) {
                    skin += 1;
                }
                total += 1;
            }
        }

        if total == 0 {
            0.0
        } else {
            skin as f32 / total as f32
        }
    }

    /// 灵敏度越高阈值越低；0.5 时等于基准值
    fn effective_ratio(&self, sensitivity: f32) -> f32 {
        let sensitivity = if sensitivity.is_finite() {
            sensitivity.clamp(0.0, 1.0)
        } else {
            0.5
        };
        (self.min_skin_ratio * (1.5 - sensitivity)).clamp(0.05, 1.0)
    }
}

impl Default for SkinToneDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionDetector for SkinToneDetector {
    fn name(&self) -> &str {
        "skin-tone"
    }

    fn source(&self) -> RegionSource {
        RegionSource::Nsfw
    }

    fn detect(
        &self,
        frame: &Frame,
        request: &DetectionRequest,
    ) -> Result<Vec<DetectedRegion>, DetectorError> {
        if !frame.is_well_formed() {
            return Err(DetectorError::InferenceError(format!(
                "frame {} has {} bytes for {}x{}",
                frame.frame_number,
                frame.data.len(),
                frame.width,
                frame.height
            )));
        }

        let cols = self.grid_cols.min(frame.width);
        let rows = self.grid_rows.min(frame.height);
        let cell_w = frame.width / cols;
        let cell_h = frame.height / rows;
        // Standard 模式下隔点采样
        let step = match request.mode {
            ProcessingMode::Accelerated => 1,
            ProcessingMode::Standard => 3,
        };
        let min_ratio = self.effective_ratio(request.sensitivity);

        let regions: Vec<DetectedRegion> = (0..rows * cols)
            .into_par_iter()
            .filter_map(|cell| {
                let col = cell % cols;
                let row = cell / cols;
                let x0 = col * cell_w;
                let y0 = row * cell_h;
                // 最后一列/行吃掉余数
                let x1 = if col == cols - 1 { frame.width } else { x0 + cell_w };
                let y1 = if row == rows - 1 { frame.height } else { y0 + cell_h };

                let ratio = Self::cell_skin_ratio(frame, x0, y0, x1, y1, step);
                if ratio < min_ratio {
                    return None;
                }

                let rect = RegionRect::new(
                    x0 as f32 / frame.width as f32,
                    y0 as f32 / frame.height as f32,
                    (x1 - x0) as f32 / frame.width as f32,
                    (y1 - y0) as f32 / frame.height as f32,
                );
                Some(DetectedRegion::nsfw(
                    rect,
                    (ratio * HEURISTIC_CONFIDENCE_CAP).min(HEURISTIC_CONFIDENCE_CAP),
                ))
            })
            .collect();

        log::debug!(
            "[SKIN] frame {}: {} of {} cells above {:.2}",
            frame.frame_number,
            regions.len(),
            rows * cols,
            min_ratio
        );

        Ok(regions)
    }
}
