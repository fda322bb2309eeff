use serde::{Deserialize, Serialize};

/// 检测信号来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegionSource {
    Face,
    Nsfw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gender {
    Female,
    Male,
    #[default]
    Unknown,
}

/// 人脸区域的性别分类结果，置信度独立于人脸检测置信度
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenderClassification {
    pub gender: Gender,
    pub confidence: f32,
}

/// 归一化坐标矩形 (0.0 - 1.0)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RegionRect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RegionRect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 整帧
    pub fn full() -> Self {
        Self::new(0.0, 0.0, 1.0, 1.0)
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// 四边各外扩 `margin`，结果限制在单位正方形内
    pub fn expanded(&self, margin: f32) -> Self {
        let margin = if margin.is_finite() { margin.max(0.0) } else { 0.0 };
        let left = (self.x - margin).clamp(0.0, 1.0);
        let top = (self.y - margin).clamp(0.0, 1.0);
        let right = (self.x + self.width + margin).clamp(0.0, 1.0);
        let bottom = (self.y + self.height + margin).clamp(0.0, 1.0);

        Self {
            x: left,
            y: top,
            width: (right - left).max(0.0),
            height: (bottom - top).max(0.0),
        }
    }
}

/// 单帧检测到的区域，只在一个决策周期内有效
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub rect: RegionRect,
    pub source: RegionSource,
    pub confidence: f32,
    /// 仅 Face 区域有值
    pub gender: Option<GenderClassification>,
}

impl DetectedRegion {
    pub fn face(rect: RegionRect, confidence: f32, gender: Gender, gender_confidence: f32) -> Self {
        Self {
            rect,
            source: RegionSource::Face,
            confidence,
            gender: Some(GenderClassification {
                gender,
                confidence: gender_confidence,
            }),
        }
    }

    pub fn nsfw(rect: RegionRect, confidence: f32) -> Self {
        Self {
            rect,
            source: RegionSource::Nsfw,
            confidence,
            gender: None,
        }
    }

    pub fn is_female_face(&self) -> bool {
        self.source == RegionSource::Face
            && matches!(
                self.gender,
                Some(GenderClassification {
                    gender: Gender::Female,
                    ..
                })
            )
    }

    pub fn expanded(&self, margin: f32) -> Self {
        Self {
            rect: self.rect.expanded(margin),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_clamps_to_unit_square() {
        let rect = RegionRect::new(0.02, 0.9, 0.2, 0.08);
        let expanded = rect.expanded(0.05);

        assert_eq!(expanded.x, 0.0);
        assert!((expanded.y - 0.85).abs() < 1e-6);
        assert!((expanded.width - 0.27).abs() < 1e-6);
        assert!((expanded.height - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_expand_ignores_bad_margin() {
        let rect = RegionRect::new(0.1, 0.1, 0.2, 0.2);
        assert_eq!(rect.expanded(-1.0), rect);
        assert_eq!(rect.expanded(f32::NAN), rect);
    }

    #[test]
    fn test_female_face_detection() {
        let face = DetectedRegion::face(RegionRect::full(), 0.9, Gender::Female, 0.8);
        let male = DetectedRegion::face(RegionRect::full(), 0.9, Gender::Male, 0.8);
        let nsfw = DetectedRegion::nsfw(RegionRect::full(), 0.9);

        assert!(face.is_female_face());
        assert!(!male.is_female_face());
        assert!(!nsfw.is_female_face());
    }
}
