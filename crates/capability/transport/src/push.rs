//! 设备主动推送
//!
//! 部分设备在应答之外还会主动连到上位机推送报文。[`PushListener`] 在后台监听：
//! - accept 任务接收设备连接
//! - 每条连接一个读取任务，用 [`FrameReceiver`] 拆帧后写入有界通道（满时形成背压）
//!
//! 调用方通过 [`PushListener::wait_for`] 按条件等待匹配的报文。

use crate::frame::FrameDescriptor;
use crate::receiver::FrameReceiver;
use crate::socket::{Deadline, PipeSocket, next_socket_id};
use domain::{CommError, TimeoutStage};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 为每条推送报文创建帧描述
pub type DescriptorFactory = Arc<dyn Fn() -> Box<dyn FrameDescriptor> + Send + Sync>;

/// 收到的推送报文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedFrame {
    pub peer: String,
    pub data: Vec<u8>,
}

pub struct PushListener {
    local_addr: SocketAddr,
    frames: Mutex<mpsc::Receiver<PushedFrame>>,
    cancel: CancellationToken,
}

impl PushListener {
    /// 绑定监听地址并启动后台任务
    pub async fn bind(
        addr: &str,
        descriptor_factory: DescriptorFactory,
        capacity: usize,
    ) -> io::Result<Self> {
        Self::bind_with_receiver(addr, descriptor_factory, capacity, FrameReceiver::default()).await
    }

    pub async fn bind_with_receiver(
        addr: &str,
        descriptor_factory: DescriptorFactory,
        capacity: usize,
        receiver: FrameReceiver,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        info!(target: "plc.transport", addr = %local_addr, "push listener started");
        tokio::spawn(accept_loop(
            listener,
            descriptor_factory,
            receiver,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            frames: Mutex::new(rx),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 等待第一条满足 `predicate` 的推送报文，不满足的报文被丢弃。
    pub async fn wait_for<F>(&self, mut predicate: F, timeout: Duration) -> Result<PushedFrame, CommError>
    where
        F: FnMut(&PushedFrame) -> bool + Send,
    {
        Deadline::after(Some(timeout))
            .guard(TimeoutStage::Receive, async {
                let mut frames = self.frames.lock().await;
                while let Some(frame) = frames.recv().await {
                    if predicate(&frame) {
                        return Ok(frame);
                    }
                    debug!(target: "plc.transport", peer = %frame.peer, bytes = frame.data.len(), "discarding unmatched push frame");
                }
                Err(CommError::InvalidState(
                    "push listener has shut down".to_string(),
                ))
            })
            .await?
    }

    /// 停止监听并结束所有读取任务
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PushListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    factory: DescriptorFactory,
    receiver: FrameReceiver,
    tx: mpsc::Sender<PushedFrame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(target: "plc.transport", peer = %peer, "push connection accepted");
                    tokio::spawn(read_loop(
                        stream,
                        peer,
                        factory.clone(),
                        receiver,
                        tx.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    error!(target: "plc.transport", error = %e, "failed to accept push connection");
                }
            },
        }
    }
    debug!(target: "plc.transport", "push accept loop stopped");
}

async fn read_loop(
    stream: TcpStream,
    peer: SocketAddr,
    factory: DescriptorFactory,
    receiver: FrameReceiver,
    tx: mpsc::Sender<PushedFrame>,
    cancel: CancellationToken,
) {
    let peer = peer.to_string();
    let mut socket = PipeSocket::new(next_socket_id(), peer.clone(), Box::new(stream));
    loop {
        let descriptor = factory();
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.receive(&mut socket, descriptor.as_ref(), Deadline::unbounded()) => received,
        };
        match received {
            Ok(data) => {
                let frame = PushedFrame {
                    peer: peer.clone(),
                    data,
                };
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(frame) => sent,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(CommError::RemoteClosed) => {
                info!(target: "plc.transport", peer = %peer, "push connection closed by device");
                break;
            }
            Err(e) => {
                warn!(target: "plc.transport", peer = %peer, error = %e, "push connection dropped");
                break;
            }
        }
    }
    socket.close().await;
}
