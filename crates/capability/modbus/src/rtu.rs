//! Modbus RTU：`station function data... crc_lo crc_hi`

use crate::checksum::crc16;
use crate::exception::{EXCEPTION_FLAG, validate_reply};
use async_trait::async_trait;
use domain::CommError;
use plc_transport::{Driver, FrameDescriptor, FrameShape};

/// 应答帧头：站号、功能码、字节数（或异常码 / 地址高字节）
const HEAD_LEN: usize = 3;

/// 应答帧描述。
///
/// 帧头中站号之前的字节视为线路噪声，由接收器剔除后重新对齐。
#[derive(Debug, Clone, Copy)]
pub struct RtuFrame {
    station: u8,
    function: u8,
}

impl RtuFrame {
    pub fn for_request(sent: &[u8]) -> Self {
        Self {
            station: sent.first().copied().unwrap_or(0),
            function: sent.get(1).copied().unwrap_or(0),
        }
    }
}

impl FrameDescriptor for RtuFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::fixed(HEAD_LEN)
    }

    fn content_length(&self, head: &[u8]) -> usize {
        if head[1] & EXCEPTION_FLAG != 0 {
            return 2;
        }
        match head[1] {
            // 写单个 / 多个线圈与寄存器：回显地址与数量
            0x05 | 0x06 | 0x0F | 0x10 => 5,
            _ => head[2] as usize + 2,
        }
    }

    fn useless_prefix_len(&self, head: &[u8]) -> usize {
        head.iter()
            .position(|&b| b == self.station)
            .unwrap_or(head.len())
    }

    fn check_head(&self, head: &[u8]) -> bool {
        head[0] == self.station && head[1] & !EXCEPTION_FLAG == self.function
    }
}

/// 负载为 `station function data...`，驱动追加 / 校验 CRC
#[derive(Debug, Default)]
pub struct ModbusRtuDriver;

#[async_trait]
impl Driver for ModbusRtuDriver {
    fn frame_descriptor(&self, sent: &[u8]) -> Box<dyn FrameDescriptor> {
        Box::new(RtuFrame::for_request(sent))
    }

    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&crc16(payload).to_le_bytes());
        frame
    }

    fn unpack_response(&self, sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        if received.len() < HEAD_LEN + 2 {
            return Err(CommError::invalid_frame(format!(
                "RTU reply too short: {}",
                hex::encode_upper(received)
            )));
        }
        let (body, crc) = received.split_at(received.len() - 2);
        let expected = crc16(body);
        let actual = u16::from_le_bytes([crc[0], crc[1]]);
        if expected != actual {
            return Err(CommError::invalid_frame(format!(
                "CRC mismatch: expected {expected:04X}, got {actual:04X}"
            )));
        }
        let frame = RtuFrame::for_request(sent);
        validate_reply(frame.station, frame.function, body)?;
        Ok(body[2..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        ModbusRtuDriver.pack_header(body)
    }

    #[test]
    fn content_length_by_function() {
        let frame = RtuFrame::for_request(&[1, 3]);
        assert_eq!(frame.content_length(&[1, 0x03, 4]), 6);
        assert_eq!(frame.content_length(&[1, 0x06, 0]), 5);
        assert_eq!(frame.content_length(&[1, 0x83, 2]), 2);
    }

    #[test]
    fn noise_before_station_is_useless() {
        let frame = RtuFrame::for_request(&[7, 3]);
        assert_eq!(frame.useless_prefix_len(&[7, 3, 2]), 0);
        assert_eq!(frame.useless_prefix_len(&[0, 7, 3]), 1);
        assert_eq!(frame.useless_prefix_len(&[0, 0, 0]), 3);
    }

    #[test]
    fn unpack_strips_station_function_and_crc() {
        let sent = with_crc(&[1, 3, 0, 0, 0, 1]);
        let received = with_crc(&[1, 3, 2, 0, 0x2A]);
        assert_eq!(
            ModbusRtuDriver.unpack_response(&sent, &received).unwrap(),
            vec![2, 0, 0x2A]
        );
    }

    #[test]
    fn corrupted_crc_is_invalid_frame() {
        let sent = with_crc(&[1, 3, 0, 0, 0, 1]);
        let mut received = with_crc(&[1, 3, 2, 0, 0x2A]);
        received[4] ^= 0xFF;
        let err = ModbusRtuDriver.unpack_response(&sent, &received).unwrap_err();
        assert!(matches!(err, CommError::InvalidFrame(_)));
        assert!(!err.is_soft());
    }
}
