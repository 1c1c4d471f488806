//! 原始套接字操作
//!
//! 只处理字节的收发、超时与连接建立，不理解任何协议语义。
//! - [`Connector`]：建立一条新的字节流（TCP / UDP / 测试用内存管道）
//! - [`PipeSocket`]：带编号的字节流，收发均受 [`Deadline`] 约束
//! - [`FailureCounter`]：连续连接失败计数，作为负错误码使用

use async_trait::async_trait;
use domain::{CommError, TimeoutStage};
use plc_telemetry::{record_bytes_received, record_bytes_sent};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream, lookup_host};
use tokio::time::Instant;
use tracing::{debug, trace};

/// 连续失败计数上限
pub const FAILURE_CEILING: u32 = 100_000_000;

/// 按分隔符接收时单行最大长度
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// 关闭连接时等待对端确认的最长时间
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// 分配进程内唯一的连接编号
pub fn next_socket_id() -> u64 {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// 可异步读写的字节流
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

/// 连接建立器
#[async_trait]
pub trait Connector: Send + Sync {
    /// 建立一条新的字节流（不含超时，由调用方控制）
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>>;

    /// 端点描述，用于日志与错误信息
    fn endpoint(&self) -> String;
}

/// TCP 连接建立器
#[derive(Debug, Clone)]
pub struct TcpConnector {
    endpoint: String,
    keep_alive: Option<Duration>,
}

impl TcpConnector {
    /// `endpoint` 为 `host:port`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            keep_alive: None,
        }
    }

    /// 启用 TCP keep-alive，空闲 `interval` 后开始探测并按同一间隔重复；`None` 或 0 不启用
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval.filter(|interval| !interval.is_zero());
        self
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }
}

fn apply_keep_alive(stream: &TcpStream, interval: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(interval);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        windows
    ))]
    let keepalive = keepalive.with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let mut last_error = None;
        for addr in lookup_host(&self.endpoint).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    if let Some(interval) = self.keep_alive {
                        apply_keep_alive(&stream, interval)?;
                    }
                    debug!(target: "plc.transport", endpoint = %self.endpoint, peer = %addr, keep_alive_ms = self.keep_alive.map(|d| d.as_millis() as u64), "tcp connected");
                    return Ok(Box::new(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {}", self.endpoint),
            )
        }))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// 收发截止时间
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
    timeout: Duration,
}

impl Deadline {
    /// 从现在起 `timeout` 后到期；`None` 表示不限时
    pub fn after(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self {
                at: Some(Instant::now() + timeout),
                timeout,
            },
            None => Self::unbounded(),
        }
    }

    /// 不限时
    pub fn unbounded() -> Self {
        Self {
            at: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.at.is_some()
    }

    /// 在截止时间内完成 `fut`，否则返回 `stage` 阶段的超时错误
    pub async fn guard<T>(
        &self,
        stage: TimeoutStage,
        fut: impl Future<Output = T>,
    ) -> Result<T, CommError> {
        match self.at {
            None => Ok(fut.await),
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| CommError::Timeout {
                    stage,
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
        }
    }
}

/// 已建立的连接（独占所有权，替换而非原地修改）
pub struct PipeSocket {
    id: u64,
    peer: String,
    stream: Box<dyn AsyncStream>,
}

impl PipeSocket {
    pub fn new(id: u64, peer: impl Into<String>, stream: Box<dyn AsyncStream>) -> Self {
        Self {
            id,
            peer: peer.into(),
            stream,
        }
    }

    /// 连接编号（在所属连接管理器内唯一）
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// 发送全部字节；部分写入会继续写完，只有硬错误才失败
    pub async fn send_all(&mut self, data: &[u8], deadline: Deadline) -> Result<(), CommError> {
        let stream = &mut self.stream;
        deadline
            .guard(TimeoutStage::Send, async move {
                stream.write_all(data).await?;
                stream.flush().await
            })
            .await?
            .map_err(CommError::SendFailed)?;
        record_bytes_sent(data.len());
        trace!(target: "plc.transport", socket_id = self.id, bytes = data.len(), data = %hex::encode_upper(data), "sent");
        Ok(())
    }

    /// 精确读满 `buf`
    pub async fn receive_into(&mut self, buf: &mut [u8], deadline: Deadline) -> Result<(), CommError> {
        let result = deadline
            .guard(TimeoutStage::Receive, self.stream.read_exact(buf))
            .await?;
        match result {
            Ok(_) => {
                record_bytes_received(buf.len());
                trace!(target: "plc.transport", socket_id = self.id, bytes = buf.len(), data = %hex::encode_upper(&*buf), "received");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(CommError::RemoteClosed),
            Err(e) => Err(CommError::ReceiveFailed(e)),
        }
    }

    /// 精确读取 `len` 字节
    pub async fn receive_exact(&mut self, len: usize, deadline: Deadline) -> Result<Vec<u8>, CommError> {
        let mut buf = vec![0u8; len];
        if len > 0 {
            self.receive_into(&mut buf, deadline).await?;
        }
        Ok(buf)
    }

    /// 读取到以 `delimiter` 结尾的一行（包含分隔符）
    pub async fn receive_line(&mut self, delimiter: &[u8], deadline: Deadline) -> Result<Vec<u8>, CommError> {
        let stream = &mut self.stream;
        let line = deadline
            .guard(TimeoutStage::Receive, async move {
                let mut line = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    let n = stream
                        .read(&mut byte)
                        .await
                        .map_err(CommError::ReceiveFailed)?;
                    if n == 0 {
                        return Err(CommError::RemoteClosed);
                    }
                    line.push(byte[0]);
                    if line.ends_with(delimiter) {
                        return Ok(line);
                    }
                    if line.len() >= MAX_LINE_LENGTH {
                        return Err(CommError::invalid_frame(format!(
                            "line exceeds {MAX_LINE_LENGTH} bytes without delimiter"
                        )));
                    }
                }
            })
            .await??;
        record_bytes_received(line.len());
        trace!(target: "plc.transport", socket_id = self.id, bytes = line.len(), data = %hex::encode_upper(&line), "received line");
        Ok(line)
    }

    /// 关闭连接（尽力而为）
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await;
        debug!(target: "plc.transport", socket_id = self.id, peer = %self.peer, "socket closed");
    }
}

impl fmt::Debug for PipeSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeSocket")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// 连续连接失败计数（饱和，不溢出）
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureCounter {
    count: u32,
}

impl FailureCounter {
    /// 失败一次，返回累计次数
    pub fn increment(&mut self) -> u32 {
        if self.count < FAILURE_CEILING {
            self.count += 1;
        }
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn get(&self) -> u32 {
        self.count
    }
}
