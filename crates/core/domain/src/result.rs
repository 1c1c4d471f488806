//! 统一结果封装。

use crate::error::{CommError, codes};
use serde::Serialize;

/// 统一成功/失败封装。
#[derive(Debug, Serialize)]
pub struct OperateResult<T> {
    pub ok: bool,
    pub value: Option<T>,
    pub error_code: i32,
    pub message: String,
}

impl<T> OperateResult<T> {
    pub fn success(value: T) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error_code: codes::SUCCESS,
            message: String::new(),
        }
    }

    pub fn failure(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error_code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.ok
    }

    /// 转换成功值，失败信息原样保留。
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperateResult<U> {
        OperateResult {
            ok: self.ok,
            value: self.value.map(f),
            error_code: self.error_code,
            message: self.message,
        }
    }
}

impl<T> From<&CommError> for OperateResult<T> {
    fn from(err: &CommError) -> Self {
        Self::failure(err.code(), err.to_string())
    }
}

impl<T> From<Result<T, CommError>> for OperateResult<T> {
    fn from(result: Result<T, CommError>) -> Self {
        match result {
            Ok(value) => Self::success(value),
            Err(err) => Self::from(&err),
        }
    }
}
