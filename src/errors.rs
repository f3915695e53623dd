//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Malformed wire frame or missing required protocol fields.
    Protocol(String),
    /// JSON-RPC response carried an error object.
    Rpc(String),
    /// Request or approval deadline exceeded.
    Timeout(String),
    /// Agent subprocess failure (stderr, unexpected exit).
    Process(String),
    /// Approval policy evaluation or routing failure.
    Policy(String),
    /// Session spawn or handshake failure.
    Session(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Policy(msg) => write!(f, "policy: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Derive a stable, user-facing summary from raw error details.
///
/// Case-insensitive substring match, first rule wins:
///
/// | Details contain              | Summary                |
/// |------------------------------|------------------------|
/// | `401` or `invalid_api_key`   | 鉴权失败：API Key 无效 |
/// | `timeout`                    | 请求超时               |
/// | *(anything else)*            | Codex 进程错误         |
#[must_use]
pub fn classify_error(details: &str) -> String {
    let lower = details.to_lowercase();
    if lower.contains("401") || lower.contains("invalid_api_key") {
        "鉴权失败：API Key 无效".to_owned()
    } else if lower.contains("timeout") {
        "请求超时".to_owned()
    } else {
        "Codex 进程错误".to_owned()
    }
}
