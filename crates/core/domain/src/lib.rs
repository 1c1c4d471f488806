//! 通信核心共享类型：错误分类、错误码与统一结果封装。
//!
//! 所有协议驱动与传输引擎都以 `Result<T, CommError>` 返回预期内的失败；
//! 需要扁平结构（`ok` / `value` / `error_code` / `message`）的调用方
//! 使用 [`OperateResult`]。

pub mod error;
pub mod result;

pub use error::{CommError, ForwardOpenReason, TimeoutStage, codes};
pub use result::OperateResult;
