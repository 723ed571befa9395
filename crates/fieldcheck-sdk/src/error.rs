use thiserror::Error;

/// SDK 统一错误类型
#[derive(Debug, Error)]
pub enum FieldcheckError {
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Migration error: {0}")]
    Migration(String),
    /// 本地存储不可用（初始化失败后进入降级模式）
    #[error("Store unavailable")]
    StoreUnavailable,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Config error: {0}")]
    Config(String),
    /// 网络不可达（连接失败、DNS 失败等）
    #[error("Network error: {0}")]
    Network(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    /// 服务端返回非 2xx 状态码
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<serde_json::Value>,
    },
    #[error("Other error: {0}")]
    Other(String),
}

impl From<sled::Error> for FieldcheckError {
    fn from(error: sled::Error) -> Self {
        FieldcheckError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for FieldcheckError {
    fn from(error: serde_json::Error) -> Self {
        FieldcheckError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for FieldcheckError {
    fn from(error: std::io::Error) -> Self {
        FieldcheckError::IO(error.to_string())
    }
}

impl From<reqwest::Error> for FieldcheckError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            FieldcheckError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            FieldcheckError::Http {
                status: status.as_u16(),
                message: error.to_string(),
                body: None,
            }
        } else if error.is_decode() {
            FieldcheckError::Serialization(error.to_string())
        } else {
            // connect / request / body 错误统一视为网络层失败
            FieldcheckError::Network(error.to_string())
        }
    }
}

impl FieldcheckError {
    /// HTTP 状态码（如果这是一个 HTTP 错误）
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FieldcheckError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 是否为传输层失败（网络不可达或超时），此类失败意味着设备实际上处于离线状态
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, FieldcheckError::Network(_) | FieldcheckError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, FieldcheckError>;
