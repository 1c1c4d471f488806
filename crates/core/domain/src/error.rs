//! 通信错误分类与错误码

use serde::Serialize;
use std::fmt;

/// 固定错误码。
///
/// 连接失败不使用固定码：其错误码为连续失败次数取负，
/// 便于区分首次失败与持续故障。
pub mod codes {
    pub const SUCCESS: i32 = 0;
    pub const TIMEOUT: i32 = 10001;
    pub const REMOTE_CLOSED: i32 = 10002;
    pub const SEND_FAILED: i32 = 10003;
    pub const RECEIVE_FAILED: i32 = 10004;
    pub const FRAME_REALIGNMENT_EXCEEDED: i32 = 10005;
    pub const HEAD_VALIDATION_FAILED: i32 = 10006;
    pub const TOO_MANY_WAITERS: i32 = 10007;
    pub const FORWARD_OPEN_REJECTED: i32 = 10008;
    pub const INVALID_FRAME: i32 = 10009;
    pub const INVALID_STATE: i32 = 10010;
}

/// 超时发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutStage {
    /// 建立连接
    Connect,
    /// 等待并发闸门
    Gate,
    /// 发送
    Send,
    /// 接收
    Receive,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::Gate => "gate",
            Self::Send => "send",
            Self::Receive => "receive",
        };
        f.write_str(name)
    }
}

/// Forward Open 被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardOpenReason {
    /// 连接已被占用或重复的 Forward Open（可换候选 ID 重试）
    InUse,
    /// 目标资源不足
    OutOfResources,
    /// 其他原因
    Other,
}

impl fmt::Display for ForwardOpenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InUse => "in use",
            Self::OutOfResources => "out of resources",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// 通信错误
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    /// 建立连接失败
    #[error("connect to {endpoint} failed (consecutive failures: {failures}): {reason}")]
    ConnectFailed {
        endpoint: String,
        failures: u32,
        reason: String,
    },

    /// 超时
    #[error("{stage} timed out after {timeout_ms}ms")]
    Timeout { stage: TimeoutStage, timeout_ms: u64 },

    /// 对端关闭连接
    #[error("remote closed the connection")]
    RemoteClosed,

    /// 发送失败
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// 接收失败（非超时、非 EOF 的读错误）
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// 帧头对齐重试次数耗尽
    #[error("frame realignment exceeded after {attempts} attempts")]
    FrameRealignmentExceeded { attempts: usize },

    /// 帧头校验失败（会话 / 令牌不匹配）
    #[error("head validation failed: {reason}")]
    HeadValidationFailed { reason: String },

    /// 驱动报告的协议错误
    #[error("protocol error {code}: {message}")]
    ProtocolUnpackFailed {
        code: i32,
        message: String,
        /// 为 true 时物理链路仍可用，只是本次请求被拒绝
        soft: bool,
    },

    /// 排队等待者过多（准入控制）
    #[error("too many waiters on connection (limit {limit})")]
    TooManyWaiters { limit: usize },

    /// Forward Open 被拒绝
    #[error("forward open rejected ({reason}): {message}")]
    ForwardOpenRejected {
        reason: ForwardOpenReason,
        general_status: u8,
        extended_status: u16,
        message: String,
    },

    /// 帧格式错误
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// 当前状态不允许该操作
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CommError {
    /// 构造协议错误。
    pub fn protocol(code: i32, message: impl Into<String>, soft: bool) -> Self {
        Self::ProtocolUnpackFailed {
            code,
            message: message.into(),
            soft,
        }
    }

    /// 构造帧格式错误。
    pub fn invalid_frame(reason: impl Into<String>) -> Self {
        Self::InvalidFrame(reason.into())
    }

    /// 数值错误码。
    pub fn code(&self) -> i32 {
        match self {
            Self::ConnectFailed { failures, .. } => {
                -(i32::try_from(*failures).unwrap_or(i32::MAX))
            }
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::RemoteClosed => codes::REMOTE_CLOSED,
            Self::SendFailed(_) => codes::SEND_FAILED,
            Self::ReceiveFailed(_) => codes::RECEIVE_FAILED,
            Self::FrameRealignmentExceeded { .. } => codes::FRAME_REALIGNMENT_EXCEEDED,
            Self::HeadValidationFailed { .. } => codes::HEAD_VALIDATION_FAILED,
            Self::ProtocolUnpackFailed { code, .. } => *code,
            Self::TooManyWaiters { .. } => codes::TOO_MANY_WAITERS,
            Self::ForwardOpenRejected { .. } => codes::FORWARD_OPEN_REJECTED,
            Self::InvalidFrame(_) => codes::INVALID_FRAME,
            Self::InvalidState(_) => codes::INVALID_STATE,
        }
    }

    /// 软错误：物理链路仍然可用，连接不标记为故障。
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::ProtocolUnpackFailed { soft: true, .. }
                | Self::TooManyWaiters { .. }
                | Self::Timeout {
                    stage: TimeoutStage::Gate,
                    ..
                }
                | Self::InvalidState(_)
        )
    }

    /// 连接级故障（连接失败、超时、对端关闭、发送失败）。
    pub fn is_connection_fault(&self) -> bool {
        match self {
            Self::ConnectFailed { .. }
            | Self::RemoteClosed
            | Self::SendFailed(_)
            | Self::ReceiveFailed(_) => true,
            Self::Timeout { stage, .. } => *stage != TimeoutStage::Gate,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_failed_code_is_negated_counter() {
        let err = CommError::ConnectFailed {
            endpoint: "127.0.0.1:502".to_string(),
            failures: 3,
            reason: "refused".to_string(),
        };
        assert_eq!(err.code(), -3);
        assert!(err.to_string().contains("consecutive failures: 3"));
        assert!(err.is_connection_fault());
        assert!(!err.is_soft());
    }

    #[test]
    fn gate_timeout_is_soft() {
        let err = CommError::Timeout {
            stage: TimeoutStage::Gate,
            timeout_ms: 100,
        };
        assert!(err.is_soft());
        assert!(!err.is_connection_fault());
        assert_eq!(err.to_string(), "gate timed out after 100ms");

        let err = CommError::Timeout {
            stage: TimeoutStage::Receive,
            timeout_ms: 100,
        };
        assert!(!err.is_soft());
        assert!(err.is_connection_fault());
    }

    #[test]
    fn protocol_error_softness() {
        let nak = CommError::protocol(0x02, "illegal data address", true);
        assert!(nak.is_soft());
        assert_eq!(nak.code(), 0x02);

        let hard = CommError::protocol(0x64, "invalid session handle", false);
        assert!(!hard.is_soft());
    }
}
