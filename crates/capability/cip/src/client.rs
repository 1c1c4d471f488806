//! 标签读写客户端

use crate::frame::{self, read_u16};
use crate::session::{CipSessionOptions, ConnectedCipDriver, SessionInfo, SessionState};
use crate::status::CipReply;
use domain::CommError;
use plc_config::ConnectionConfig;
use plc_transport::{ConnectionOptions, Connector, TransactionPipeline, connector_for};
use std::sync::Arc;
use tokio::sync::watch;

/// 结构体数据类型码，其后紧跟 2 字节结构句柄
pub const STRUCTURE_TYPE: u16 = 0x02A0;

/// 读取到的标签值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipValue {
    pub type_code: u16,
    /// 仅结构体类型携带
    pub structure_handle: Option<u16>,
    /// 设备只返回了部分数据
    pub partial: bool,
    pub data: Vec<u8>,
}

impl CipValue {
    pub fn from_reply(reply: &CipReply) -> Result<Self, CommError> {
        if reply.data.len() < 2 {
            return Err(CommError::invalid_frame("read reply is missing the type code"));
        }
        let type_code = read_u16(&reply.data, 0);
        let (structure_handle, offset) = if type_code == STRUCTURE_TYPE {
            if reply.data.len() < 4 {
                return Err(CommError::invalid_frame(
                    "structure reply is missing the structure handle",
                ));
            }
            (Some(read_u16(&reply.data, 2)), 4)
        } else {
            (None, 2)
        };
        Ok(Self {
            type_code,
            structure_handle,
            partial: reply.partial,
            data: reply.data[offset..].to_vec(),
        })
    }
}

/// 面向连接的 CIP 客户端。
///
/// 会话总是运行在长连接上：注册与 Forward Open 只在物理连接建立时执行一次。
pub struct CipClient {
    pipeline: TransactionPipeline<ConnectedCipDriver>,
}

impl CipClient {
    pub fn new(config: &ConnectionConfig, options: CipSessionOptions) -> Self {
        Self::with_connector(connector_for(config), ConnectionOptions::from(config), options)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        connection: ConnectionOptions,
        options: CipSessionOptions,
    ) -> Self {
        let connection = ConnectionOptions {
            persistent: true,
            ..connection
        };
        Self {
            pipeline: TransactionPipeline::new(
                Arc::new(ConnectedCipDriver::new(options)),
                connector,
                connection,
            ),
        }
    }

    /// 建立连接并完成注册与 Forward Open
    pub async fn connect(&self) -> Result<(), CommError> {
        self.pipeline.connect().await
    }

    /// Forward Close、注销会话并关闭连接
    pub async fn disconnect(&self) -> Result<(), CommError> {
        let result = self.pipeline.disconnect().await;
        self.pipeline.driver().reset();
        result
    }

    pub fn state(&self) -> SessionState {
        self.pipeline.driver().state()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.pipeline.driver().subscribe()
    }

    pub fn session(&self) -> SessionInfo {
        self.pipeline.driver().session()
    }

    pub fn pipeline(&self) -> &TransactionPipeline<ConnectedCipDriver> {
        &self.pipeline
    }

    /// 在已建立的连接上发送一条 CIP 请求
    pub async fn send_cip(&self, request: &[u8]) -> Result<CipReply, CommError> {
        frame::check_request_len(request)?;
        let raw = self.pipeline.send_receive(request).await?;
        let reply = CipReply::parse(&raw)?;
        if let Some(&service) = request.first()
            && reply.service != service
        {
            return Err(CommError::HeadValidationFailed {
                reason: format!(
                    "reply service 0x{:02X} does not answer request 0x{service:02X}",
                    reply.service
                ),
            });
        }
        Ok(reply)
    }

    pub async fn read_tag(&self, tag: &str, elements: u16) -> Result<CipValue, CommError> {
        let reply = self
            .send_cip(&frame::read_tag_request(tag, elements)?)
            .await?;
        CipValue::from_reply(&reply)
    }

    pub async fn write_tag(
        &self,
        tag: &str,
        type_code: u16,
        elements: u16,
        data: &[u8],
    ) -> Result<(), CommError> {
        self.send_cip(&frame::write_tag_request(tag, type_code, elements, data)?)
            .await
            .map(|_| ())
    }
}
