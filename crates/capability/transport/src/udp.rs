//! UDP 传输
//!
//! 将已 `connect` 的 UDP 套接字包装成字节流：每次读取消费一个数据报，
//! 每次写入发送一个数据报。帧接收器只看到连续字节，无需关心底层是否为报文。

use crate::socket::{AsyncStream, Connector};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{UdpSocket, lookup_host};
use tracing::debug;

/// 单个 UDP 数据报最大负载
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// 以字节流方式读写的 UDP 套接字
pub struct UdpStream {
    socket: UdpSocket,
    scratch: Box<[u8]>,
    pending: Vec<u8>,
    offset: usize,
}

impl UdpStream {
    /// `socket` 需已连接到对端
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            scratch: vec![0u8; MAX_DATAGRAM_SIZE].into_boxed_slice(),
            pending: Vec::new(),
            offset: 0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset >= this.pending.len() {
            let mut datagram = ReadBuf::new(&mut this.scratch);
            ready!(this.socket.poll_recv(cx, &mut datagram))?;
            if datagram.filled().is_empty() {
                // 空数据报不能当作 EOF
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            this.pending.clear();
            this.pending.extend_from_slice(datagram.filled());
            this.offset = 0;
        }
        let available = &this.pending[this.offset..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.offset += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for UdpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpStream")
            .field("peer_addr", &self.socket.peer_addr().ok())
            .field("local_addr", &self.socket.local_addr().ok())
            .field("buffered", &(self.pending.len() - self.offset))
            .finish()
    }
}

/// UDP 连接建立器
#[derive(Debug, Clone)]
pub struct UdpConnector {
    endpoint: String,
}

impl UdpConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Connector for UdpConnector {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let addr = lookup_host(&self.endpoint).await?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address resolved for {}", self.endpoint),
            )
        })?;
        let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        debug!(target: "plc.transport", endpoint = %self.endpoint, local = ?socket.local_addr().ok(), "udp connected");
        Ok(Box::new(UdpStream::new(socket)))
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn datagrams_read_as_byte_stream() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let endpoint = server.local_addr().unwrap().to_string();

        let mut stream = UdpConnector::new(endpoint).connect().await.unwrap();
        stream.write_all(&[0x01, 0x02, 0x03]).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, client) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);

        server.send_to(&[0xAA, 0xBB, 0xCC, 0xDD], client).await.unwrap();
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0xAA, 0xBB]);
        let mut tail = [0u8; 2];
        stream.read_exact(&mut tail).await.unwrap();
        assert_eq!(tail, [0xCC, 0xDD]);
    }
}
