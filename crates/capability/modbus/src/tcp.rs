//! Modbus TCP：MBAP 头 `transaction(2) protocol(2) length(2)` + `unit function data...`

use crate::exception::validate_reply;
use async_trait::async_trait;
use domain::CommError;
use plc_transport::{Driver, FrameDescriptor, FrameShape};
use std::sync::atomic::{AtomicU16, Ordering};

const MBAP_LEN: usize = 6;

/// 应答帧描述：事务号须与请求一致，协议号须为 0
#[derive(Debug, Clone, Copy)]
pub struct MbapFrame {
    transaction_id: u16,
}

impl MbapFrame {
    pub fn for_request(sent: &[u8]) -> Self {
        let transaction_id = match sent {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            _ => 0,
        };
        Self { transaction_id }
    }
}

impl FrameDescriptor for MbapFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::fixed(MBAP_LEN)
    }

    fn content_length(&self, head: &[u8]) -> usize {
        u16::from_be_bytes([head[4], head[5]]) as usize
    }

    fn check_head(&self, head: &[u8]) -> bool {
        u16::from_be_bytes([head[0], head[1]]) == self.transaction_id && head[2..4] == [0, 0]
    }
}

/// 负载为 `unit function data...`，驱动加 MBAP 头并分配事务号
#[derive(Debug, Default)]
pub struct ModbusTcpDriver {
    transaction_id: AtomicU16,
}

impl ModbusTcpDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Driver for ModbusTcpDriver {
    fn frame_descriptor(&self, sent: &[u8]) -> Box<dyn FrameDescriptor> {
        Box::new(MbapFrame::for_request(sent))
    }

    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        let transaction_id = self
            .transaction_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let mut frame = Vec::with_capacity(MBAP_LEN + payload.len());
        frame.extend_from_slice(&transaction_id.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    fn unpack_response(&self, sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        if sent.len() < MBAP_LEN + 2 || received.len() < MBAP_LEN + 2 {
            return Err(CommError::invalid_frame(format!(
                "MBAP reply too short: {}",
                hex::encode_upper(received)
            )));
        }
        validate_reply(sent[MBAP_LEN], sent[MBAP_LEN + 1], &received[MBAP_LEN..])?;
        Ok(received[MBAP_LEN + 2..].to_vec())
    }
}
