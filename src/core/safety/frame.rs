use std::time::Duration;

/// 屏幕帧数据结构（由采集端传入，周期结束即丢弃）
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // RGBA 格式
    /// 单调时间戳
    pub timestamp: Duration,
    pub frame_number: u64,
}

impl Frame {
    pub fn new(
        width: u32,
        height: u32,
        data: Vec<u8>,
        timestamp_ms: u64,
        frame_number: u64,
    ) -> Self {
        Self {
            width,
            height,
            data,
            timestamp: Duration::from_millis(timestamp_ms),
            frame_number,
        }
    }

    pub fn pixel_count(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp.as_millis() as u64
    }

    /// RGBA buffer matches the declared dimensions.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0 && self.height > 0 && self.data.len() == self.pixel_count() * 4
    }

    /// Standard 模式下的降采样：最长边缩放到 `max_dimension`。
    ///
    /// 已经足够小或数据不完整的帧返回 `None`，调用方继续使用原帧。
    pub fn downscaled(&self, max_dimension: u32) -> Option<Frame> {
        let longest = self.width.max(self.height);
        if max_dimension == 0 || longest <= max_dimension {
            return None;
        }

        let img = image::RgbaImage::from_raw(self.width, self.height, self.data.clone())?;

        let scale = max_dimension as f32 / longest as f32;
        let target_width = ((self.width as f32 * scale).round() as u32).max(1);
        let target_height = ((self.height as f32 * scale).round() as u32).max(1);

        let resized = image::imageops::resize(
            &img,
            target_width,
            target_height,
            image::imageops::FilterType::Triangle,
        );

        Some(Frame {
            width: target_width,
            height: target_height,
            data: resized.into_raw(),
            timestamp: self.timestamp,
            frame_number: self.frame_number,
        })
    }
}
