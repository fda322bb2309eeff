use thiserror::Error;

/// 检测适配器错误，引擎一律按“本周期无结果”处理
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectorError {
    #[error("Model not ready")]
    ModelNotReady,
    #[error("Inference error: {0}")]
    InferenceError(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Configuration missing")]
    Missing,
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Configuration parse failed: {0}")]
    Parse(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// 引擎级失败只保留给配置错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("Engine failure: {0}")]
    InvalidConfig(#[from] ConfigError),
}
