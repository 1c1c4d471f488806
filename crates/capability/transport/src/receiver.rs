//! 帧接收器
//!
//! 按 [`FrameDescriptor`] 从 [`PipeSocket`] 中读出一条完整报文：
//! - 分隔符模式：读到分隔符为止，再补读固定尾随字节
//! - 定长帧头模式：读帧头，剔除前部垃圾数据后重新对齐，再按帧头给出的长度读内容

use crate::frame::{FrameDescriptor, FrameShape};
use crate::socket::{Deadline, PipeSocket};
use domain::CommError;
use plc_telemetry::record_realignment;
use tracing::{debug, warn};

/// 默认帧头对齐最大重试次数
pub const DEFAULT_MAX_REALIGN_ATTEMPTS: usize = 10;

/// 默认单帧内容最大长度
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FrameReceiver {
    max_realign_attempts: usize,
    max_content_length: usize,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REALIGN_ATTEMPTS, DEFAULT_MAX_CONTENT_LENGTH)
    }
}

impl FrameReceiver {
    pub fn new(max_realign_attempts: usize, max_content_length: usize) -> Self {
        Self {
            max_realign_attempts,
            max_content_length,
        }
    }

    /// 接收一条完整报文（帧头 + 内容，或整行）
    pub async fn receive(
        &self,
        socket: &mut PipeSocket,
        descriptor: &dyn FrameDescriptor,
        deadline: Deadline,
    ) -> Result<Vec<u8>, CommError> {
        match descriptor.shape() {
            FrameShape::Delimited {
                delimiter,
                trailing,
            } => {
                let mut frame = socket.receive_line(delimiter.as_bytes(), deadline).await?;
                if trailing > 0 {
                    let tail = socket.receive_exact(trailing, deadline).await?;
                    frame.extend_from_slice(&tail);
                }
                Ok(frame)
            }
            FrameShape::Fixed { head_len } => {
                self.receive_fixed(socket, descriptor, head_len, deadline)
                    .await
            }
        }
    }

    async fn receive_fixed(
        &self,
        socket: &mut PipeSocket,
        descriptor: &dyn FrameDescriptor,
        head_len: usize,
        deadline: Deadline,
    ) -> Result<Vec<u8>, CommError> {
        let mut head = socket.receive_exact(head_len, deadline).await?;

        let mut realigned = 0usize;
        loop {
            let useless = descriptor.useless_prefix_len(&head);
            if useless == 0 {
                break;
            }
            if realigned >= self.max_realign_attempts {
                warn!(
                    target: "plc.transport",
                    socket_id = socket.id(),
                    attempts = realigned,
                    head = %hex::encode_upper(&head),
                    "frame realignment exceeded"
                );
                return Err(CommError::FrameRealignmentExceeded {
                    attempts: realigned,
                });
            }
            realigned += 1;
            record_realignment();
            debug!(target: "plc.transport", socket_id = socket.id(), useless, attempt = realigned, "realigning frame head");

            if useless >= head_len {
                head = socket.receive_exact(head_len, deadline).await?;
            } else {
                let extra = socket.receive_exact(useless, deadline).await?;
                head.drain(..useless);
                head.extend_from_slice(&extra);
            }
        }

        let content_len = descriptor.content_length(&head);
        if content_len == 0 {
            return Ok(head);
        }
        if content_len > self.max_content_length {
            return Err(CommError::invalid_frame(format!(
                "content length {content_len} exceeds limit {}",
                self.max_content_length
            )));
        }

        let mut frame = vec![0u8; head_len + content_len];
        frame[..head_len].copy_from_slice(&head);
        socket.receive_into(&mut frame[head_len..], deadline).await?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Delimiter, LineFrame};
    use tokio::io::AsyncWriteExt;

    /// 帧头 `AA 55 len 00`，内容长度为 `len`
    struct MarkerFrame;

    impl FrameDescriptor for MarkerFrame {
        fn shape(&self) -> FrameShape {
            FrameShape::fixed(4)
        }

        fn content_length(&self, head: &[u8]) -> usize {
            head[2] as usize
        }

        fn useless_prefix_len(&self, head: &[u8]) -> usize {
            let pos = head.windows(2).position(|w| w == [0xAA, 0x55]);
            match pos {
                Some(pos) => pos,
                None if head.last() == Some(&0xAA) => head.len() - 1,
                None => head.len(),
            }
        }
    }

    fn socket_pair() -> (PipeSocket, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(1024);
        (PipeSocket::new(1, "mem", Box::new(client)), server)
    }

    #[tokio::test]
    async fn garbage_prefix_is_skipped() {
        let (mut socket, mut server) = socket_pair();
        server
            .write_all(&[0x01, 0x02, 0x03, 0xAA, 0x55, 0x02, 0x00, 0x10, 0x20])
            .await
            .unwrap();
        let frame = FrameReceiver::default()
            .receive(&mut socket, &MarkerFrame, Deadline::unbounded())
            .await
            .unwrap();
        assert_eq!(frame, vec![0xAA, 0x55, 0x02, 0x00, 0x10, 0x20]);
    }

    #[tokio::test]
    async fn ten_garbage_heads_still_realign() {
        let (mut socket, mut server) = socket_pair();
        let mut bytes = vec![0u8; 40];
        bytes.extend_from_slice(&[0xAA, 0x55, 0x00, 0x00]);
        server.write_all(&bytes).await.unwrap();
        let frame = FrameReceiver::default()
            .receive(&mut socket, &MarkerFrame, Deadline::unbounded())
            .await
            .unwrap();
        assert_eq!(frame, vec![0xAA, 0x55, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn endless_garbage_exceeds_realignment() {
        let (mut socket, mut server) = socket_pair();
        server.write_all(&[0u8; 80]).await.unwrap();
        let err = FrameReceiver::default()
            .receive(&mut socket, &MarkerFrame, Deadline::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommError::FrameRealignmentExceeded { attempts: 10 }
        ));
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let (mut socket, mut server) = socket_pair();
        server.write_all(&[0xAA, 0x55, 0xFF, 0x00]).await.unwrap();
        let err = FrameReceiver::new(10, 16)
            .receive(&mut socket, &MarkerFrame, Deadline::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::InvalidFrame(_)));
    }

    #[tokio::test]
    async fn delimited_frame_reads_trailing_bytes() {
        let (mut socket, mut server) = socket_pair();
        server.write_all(b"OK\x03\x7F\x01next").await.unwrap();
        let descriptor = LineFrame {
            delimiter: Delimiter::single(0x03),
            trailing: 2,
        };
        let frame = FrameReceiver::default()
            .receive(&mut socket, &descriptor, Deadline::unbounded())
            .await
            .unwrap();
        assert_eq!(frame, b"OK\x03\x7F\x01");
    }
}
