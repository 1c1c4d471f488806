//! 连接管理
//!
//! 一个 [`ConnectionManager`] 对应一个设备端点，支持两种套接字生命周期：
//! - 短连接：每次事务新建连接、执行握手，事务结束后无论成败都关闭
//! - 长连接：复用已保存的连接；缺失或已故障时重建并保存
//!
//! 连接只会被替换，不会原地修改；同一时刻最多存在一条活动连接。

use crate::driver::{Driver, Link};
use crate::receiver::FrameReceiver;
use crate::socket::{Connector, FailureCounter, PipeSocket, TcpConnector, next_socket_id};
use crate::udp::UdpConnector;
use domain::CommError;
use plc_config::{ConnectionConfig, TransportKind};
use plc_telemetry::{record_connect, record_connect_failure};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 接收超时策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveTimeout {
    /// 不等待响应（发送后立即返回）
    NoResponse,
    /// 不限时等待
    Unlimited,
    /// 限时等待
    After(Duration),
}

impl ReceiveTimeout {
    /// 负数不等待响应，0 不限时，正数为毫秒
    pub fn from_millis(value: i64) -> Self {
        match value {
            v if v < 0 => Self::NoResponse,
            0 => Self::Unlimited,
            v => Self::After(Duration::from_millis(v as u64)),
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::After(timeout) => Some(*timeout),
            _ => None,
        }
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse)
    }
}

/// 运行期连接参数（由 [`ConnectionConfig`] 转换而来）
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    pub receive_timeout: ReceiveTimeout,
    pub sleep_before_receive: Duration,
    pub keep_alive: Option<Duration>,
    pub persistent: bool,
    pub lock_limit: usize,
    pub max_realign_attempts: usize,
    pub max_content_length: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&ConnectionConfig::new("127.0.0.1", 0))
    }
}

impl From<&ConnectionConfig> for ConnectionOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            receive_timeout: ReceiveTimeout::from_millis(config.receive_timeout_ms),
            sleep_before_receive: Duration::from_millis(config.sleep_before_receive_ms),
            keep_alive: config
                .keep_alive_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            persistent: config.persistent,
            lock_limit: config.lock_limit,
            max_realign_attempts: config.max_realign_attempts,
            max_content_length: config.max_content_length,
        }
    }
}

/// 按配置选择连接建立器
pub fn connector_for(config: &ConnectionConfig) -> Arc<dyn Connector> {
    match config.transport {
        TransportKind::Tcp => Arc::new(tcp_connector(config)),
        TransportKind::Udp => Arc::new(UdpConnector::new(config.endpoint())),
    }
}

fn tcp_connector(config: &ConnectionConfig) -> TcpConnector {
    TcpConnector::new(config.endpoint()).with_keep_alive(ConnectionOptions::from(config).keep_alive)
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    receiver: FrameReceiver,
    socket: Option<PipeSocket>,
    is_faulted: bool,
    is_persistent: bool,
    failures: FailureCounter,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        Self {
            connector,
            receiver: FrameReceiver::new(options.max_realign_attempts, options.max_content_length),
            is_persistent: options.persistent,
            options,
            socket: None,
            is_faulted: false,
            failures: FailureCounter::default(),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn receiver(&self) -> &FrameReceiver {
        &self.receiver
    }

    pub fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    pub fn is_persistent(&self) -> bool {
        self.is_persistent
    }

    pub fn is_faulted(&self) -> bool {
        self.is_faulted
    }

    /// 连续连接失败次数
    pub fn failure_count(&self) -> u32 {
        self.failures.get()
    }

    /// 当前保存的长连接编号
    pub fn current_socket_id(&self) -> Option<u64> {
        self.socket.as_ref().map(PipeSocket::id)
    }

    /// 取得一条可用连接（所有权转移给调用方，用完须交还 [`Self::release`]）
    pub async fn get_socket(&mut self, driver: &dyn Driver) -> Result<PipeSocket, CommError> {
        if self.is_persistent {
            if let Some(socket) = self.socket.take() {
                if !self.is_faulted {
                    return Ok(socket);
                }
                debug!(target: "plc.transport", socket_id = socket.id(), "discarding faulted socket");
                socket.close().await;
            }
        }
        self.create_socket(driver).await
    }

    async fn create_socket(&mut self, driver: &dyn Driver) -> Result<PipeSocket, CommError> {
        let endpoint = self.connector.endpoint();
        let stream = match tokio::time::timeout(self.options.connect_timeout, self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(self.connect_failed(endpoint, e.to_string())),
            Err(_) => {
                let reason = format!(
                    "timed out after {}ms",
                    self.options.connect_timeout.as_millis()
                );
                return Err(self.connect_failed(endpoint, reason));
            }
        };

        let id = next_socket_id();
        let mut socket = PipeSocket::new(id, endpoint, stream);
        record_connect();
        info!(target: "plc.transport", socket_id = id, endpoint = %socket.peer(), persistent = self.is_persistent, "connected");

        let init = {
            let mut link = Link::new(&mut socket, driver, &self.options, &self.receiver);
            driver.initialize_on_connect(&mut link).await
        };
        if let Err(e) = init {
            warn!(target: "plc.transport", socket_id = id, error = %e, "initialize on connect failed");
            socket.close().await;
            self.is_faulted = true;
            return Err(e);
        }
        Ok(socket)
    }

    fn connect_failed(&mut self, endpoint: String, reason: String) -> CommError {
        let failures = self.failures.increment();
        self.is_faulted = true;
        record_connect_failure();
        warn!(target: "plc.transport", endpoint = %endpoint, failures, reason = %reason, "connect failed");
        CommError::ConnectFailed {
            endpoint,
            failures,
            reason,
        }
    }

    /// 交还连接并按事务结果更新连接健康状态。
    ///
    /// 成功清除故障标记与失败计数；软错误保持连接可用；其他错误标记故障并直接关闭连接。
    /// 短连接在成功或软错误后执行断开钩子再关闭。
    pub async fn release<T>(
        &mut self,
        driver: &dyn Driver,
        socket: PipeSocket,
        result: &Result<T, CommError>,
    ) {
        match result {
            Ok(_) => {
                self.is_faulted = false;
                self.failures.reset();
            }
            Err(e) if e.is_soft() => {}
            Err(e) => {
                self.is_faulted = true;
                if e.is_connection_fault() {
                    warn!(target: "plc.transport", socket_id = socket.id(), error = %e, "connection lost");
                } else {
                    debug!(target: "plc.transport", socket_id = socket.id(), error = %e, "closing socket after fault");
                }
                driver.on_fault();
                socket.close().await;
                return;
            }
        }
        if self.is_persistent {
            self.socket = Some(socket);
        } else {
            let _ = self.shutdown(driver, socket).await;
        }
    }

    /// 切换到长连接模式并立即建立连接
    pub async fn connect(&mut self, driver: &dyn Driver) -> Result<(), CommError> {
        self.is_persistent = true;
        let socket = self.get_socket(driver).await?;
        self.is_faulted = false;
        self.failures.reset();
        self.socket = Some(socket);
        Ok(())
    }

    /// 执行断开钩子并关闭连接，同时退出长连接模式。
    ///
    /// 钩子失败时连接仍会关闭，错误原样返回。已故障的连接不执行钩子。
    pub async fn close(&mut self, driver: &dyn Driver) -> Result<(), CommError> {
        self.is_persistent = false;
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };
        let result = if self.is_faulted {
            socket.close().await;
            Ok(())
        } else {
            self.shutdown(driver, socket).await
        };
        self.is_faulted = false;
        result
    }

    /// 断开钩子（尽力而为）后关闭连接
    async fn shutdown(&self, driver: &dyn Driver, mut socket: PipeSocket) -> Result<(), CommError> {
        let result = {
            let mut link = Link::new(&mut socket, driver, &self.options, &self.receiver);
            driver.extra_on_disconnect(&mut link).await
        };
        if let Err(e) = &result {
            warn!(target: "plc.transport", socket_id = socket.id(), error = %e, "disconnect hook failed");
        }
        socket.close().await;
        result
    }

    /// 切换长 / 短连接；切到短连接时关闭已保存的连接
    pub async fn set_persistent(&mut self, driver: &dyn Driver, persistent: bool) -> Result<(), CommError> {
        if persistent {
            self.is_persistent = true;
            Ok(())
        } else {
            self.close(driver).await
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.connector.endpoint())
            .field("socket", &self.socket)
            .field("is_faulted", &self.is_faulted)
            .field("is_persistent", &self.is_persistent)
            .field("failures", &self.failures.get())
            .finish()
    }
}
