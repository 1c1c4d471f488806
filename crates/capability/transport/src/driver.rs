//! 协议驱动钩子
//!
//! 引擎本身不理解任何协议。每个驱动实现 [`Driver`]，提供：
//! - 响应帧的识别规则（[`FrameDescriptor`]）
//! - 发送前封装、接收后校验与解包
//! - 每条物理连接建立后 / 断开前执行一次的握手与收尾
//!
//! 握手钩子拿到的是 [`Link`]：直接在新建连接上收发，不再经过并发闸门。

use crate::connection::ConnectionOptions;
use crate::frame::{FrameDescriptor, FrameShape};
use crate::receiver::FrameReceiver;
use crate::socket::{Deadline, PipeSocket};
use async_trait::async_trait;
use domain::CommError;
use tracing::{debug, warn};

#[async_trait]
pub trait Driver: Send + Sync {
    /// 为刚发送的请求生成响应帧描述
    fn frame_descriptor(&self, sent: &[u8]) -> Box<dyn FrameDescriptor>;

    /// 封装待发送负载（长度前缀、校验、会话包装等）
    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    /// 校验完整响应帧并取出负载
    fn unpack_response(&self, _sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        Ok(received.to_vec())
    }

    /// 物理连接建立后的握手
    async fn initialize_on_connect(&self, _link: &mut Link<'_>) -> Result<(), CommError> {
        Ok(())
    }

    /// 物理连接关闭前的收尾（尽力而为）
    async fn extra_on_disconnect(&self, _link: &mut Link<'_>) -> Result<(), CommError> {
        Ok(())
    }

    /// 连接因硬错误被丢弃；此后不会再为该连接执行断开钩子
    fn on_fault(&self) {}
}

/// 一条已建立连接上的收发通道
pub struct Link<'a> {
    socket: &'a mut PipeSocket,
    driver: &'a dyn Driver,
    options: &'a ConnectionOptions,
    receiver: &'a FrameReceiver,
}

impl<'a> Link<'a> {
    pub(crate) fn new(
        socket: &'a mut PipeSocket,
        driver: &'a dyn Driver,
        options: &'a ConnectionOptions,
        receiver: &'a FrameReceiver,
    ) -> Self {
        Self {
            socket,
            driver,
            options,
            receiver,
        }
    }

    pub fn socket_id(&self) -> u64 {
        self.socket.id()
    }

    /// 单次收发：封装 → 发送 →（可选）等待 → 接收一帧 → 帧头校验 → 解包。
    ///
    /// `expect_response` 为 false 或接收超时配置为"不等待响应"时，发送后立即返回空负载。
    /// `use_framing` 为 false 时跳过封装、帧头校验与解包，返回原始帧。
    pub async fn exchange(
        &mut self,
        payload: &[u8],
        expect_response: bool,
        use_framing: bool,
    ) -> Result<Vec<u8>, CommError> {
        let sent = if use_framing {
            self.driver.pack_header(payload)
        } else {
            payload.to_vec()
        };

        let io_timeout = self.options.receive_timeout.as_duration();
        self.socket.send_all(&sent, Deadline::after(io_timeout)).await?;

        if !expect_response || self.options.receive_timeout.is_no_response() {
            return Ok(Vec::new());
        }

        if !self.options.sleep_before_receive.is_zero() {
            tokio::time::sleep(self.options.sleep_before_receive).await;
        }

        let descriptor = self.driver.frame_descriptor(&sent);
        let received = self
            .receiver
            .receive(&mut *self.socket, descriptor.as_ref(), Deadline::after(io_timeout))
            .await?;

        if !use_framing {
            return Ok(received);
        }

        let head = match descriptor.shape() {
            FrameShape::Fixed { head_len } => &received[..head_len.min(received.len())],
            FrameShape::Delimited { .. } => &received[..],
        };
        if !descriptor.check_head(head) {
            warn!(target: "plc.transport", socket_id = self.socket.id(), head = %hex::encode_upper(head), "response head rejected");
            return Err(CommError::HeadValidationFailed {
                reason: format!("unexpected response head {}", hex::encode_upper(head)),
            });
        }

        let unpacked = self.driver.unpack_response(&sent, &received)?;
        debug!(target: "plc.transport", socket_id = self.socket.id(), sent = sent.len(), received = received.len(), "exchange complete");
        Ok(unpacked)
    }
}
