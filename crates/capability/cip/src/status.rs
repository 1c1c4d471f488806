//! CIP 状态码表与应答解析
//!
//! 状态码描述属于协议数据；分类规则：
//! - 封装层状态 0x64 / 0x65（会话句柄无效、长度错误）视为连接故障，其余为软错误
//! - CIP 通用状态 0x01（连接失败）视为连接故障，0x06（部分传输）作为数据返回，其余为软错误

use crate::frame::{read_u16, service};
use domain::{CommError, ForwardOpenReason};

/// 封装层状态描述
pub fn encapsulation_status_message(status: u32) -> &'static str {
    match status {
        0x0000 => "success",
        0x0001 => "sender issued an invalid or unsupported encapsulation command",
        0x0002 => "insufficient memory resources in the receiver",
        0x0003 => "poorly formed or incorrect data in the encapsulation message",
        0x0064 => "originator used an invalid session handle",
        0x0065 => "target received a message of invalid length",
        0x0069 => "unsupported encapsulation protocol revision",
        _ => "unknown encapsulation status",
    }
}

/// 检查封装层状态
pub fn check_encapsulation_status(status: u32) -> Result<(), CommError> {
    if status == 0 {
        return Ok(());
    }
    let soft = !matches!(status, 0x0064 | 0x0065);
    Err(CommError::protocol(
        status as i32,
        format!(
            "encapsulation status 0x{status:04X}: {}",
            encapsulation_status_message(status)
        ),
        soft,
    ))
}

/// CIP 通用状态描述
pub fn general_status_message(status: u8) -> &'static str {
    match status {
        0x00 => "success",
        0x01 => "connection failure",
        0x02 => "resource unavailable",
        0x03 => "invalid parameter value",
        0x04 => "path segment error: the tag name is not recognized",
        0x05 => "path destination unknown: the tag or member does not exist",
        0x06 => "partial transfer: only part of the expected data was transferred",
        0x07 => "connection lost",
        0x08 => "service not supported",
        0x09 => "invalid attribute value",
        0x0A => "attribute list error",
        0x0B => "already in requested mode or state",
        0x0C => "object state conflict",
        0x0D => "object already exists",
        0x0E => "attribute not settable",
        0x0F => "privilege violation",
        0x10 => "device state conflict",
        0x11 => "reply data too large",
        0x12 => "fragmentation of a primitive value",
        0x13 => "not enough data",
        0x14 => "attribute not supported",
        0x15 => "too much data",
        0x16 => "object does not exist",
        0x17 => "service fragmentation sequence not in progress",
        0x18 => "no stored attribute data",
        0x19 => "store operation failure",
        0x1A => "routing failure: request packet too large",
        0x1B => "routing failure: response packet too large",
        0x1C => "missing attribute list entry data",
        0x1D => "invalid attribute value list",
        0x1E => "embedded service error",
        0x1F => "vendor specific error",
        0x20 => "invalid parameter",
        0x21 => "write-once value or medium already written",
        0x22 => "invalid reply received",
        0x25 => "key failure in path",
        0x26 => "path size invalid",
        0x27 => "unexpected attribute in list",
        0x28 => "invalid member id",
        0x29 => "member not settable",
        0xFF => "general error: the tag data type does not match the request",
        _ => "unknown CIP status",
    }
}

/// Forward Open 扩展状态分类与描述
pub fn forward_open_rejection(extended_status: u16) -> (ForwardOpenReason, &'static str) {
    match extended_status {
        0x0100 => (
            ForwardOpenReason::InUse,
            "connection in use or duplicate forward open",
        ),
        0x0113 => (
            ForwardOpenReason::OutOfResources,
            "out of connections: the target has no free connection slots",
        ),
        0x0114 => (
            ForwardOpenReason::OutOfResources,
            "vendor id or product code mismatch",
        ),
        0x0115 => (
            ForwardOpenReason::OutOfResources,
            "device type mismatch",
        ),
        0x0103 => (
            ForwardOpenReason::Other,
            "transport class and trigger combination not supported",
        ),
        0x0106 => (ForwardOpenReason::Other, "ownership conflict"),
        0x0107 => (ForwardOpenReason::Other, "target connection not found"),
        0x0108 => (ForwardOpenReason::Other, "invalid network connection parameter"),
        0x0109 => (ForwardOpenReason::Other, "invalid connection size"),
        0x0111 => (ForwardOpenReason::Other, "requested packet interval not supported"),
        0x0116 => (ForwardOpenReason::Other, "revision mismatch"),
        0x0203 => (ForwardOpenReason::Other, "connection timed out"),
        0x0204 => (ForwardOpenReason::Other, "unconnected request timed out"),
        0x0311 => (ForwardOpenReason::Other, "invalid port in connection path"),
        0x0312 => (ForwardOpenReason::Other, "invalid link address in connection path"),
        0x0315 => (ForwardOpenReason::Other, "invalid segment in connection path"),
        _ => (ForwardOpenReason::Other, "forward open rejected by target"),
    }
}

/// 解析后的 CIP 应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipReply {
    /// 应答服务码（已去掉 0x80 应答位）
    pub service: u8,
    pub general_status: u8,
    pub extended_status: Vec<u16>,
    /// 通用状态 0x06：设备只返回了部分数据
    pub partial: bool,
    pub data: Vec<u8>,
}

impl CipReply {
    /// 仅解析结构，不按状态分类
    pub fn parse(bytes: &[u8]) -> Result<Self, CommError> {
        if bytes.len() < 4 {
            return Err(CommError::invalid_frame(format!(
                "CIP reply needs at least 4 bytes, got {}",
                bytes.len()
            )));
        }
        if bytes[0] & service::REPLY_MASK == 0 {
            return Err(CommError::invalid_frame(format!(
                "service 0x{:02X} is not a reply",
                bytes[0]
            )));
        }
        let general_status = bytes[2];
        let words = bytes[3] as usize;
        let data_start = 4 + words * 2;
        if bytes.len() < data_start {
            return Err(CommError::invalid_frame(
                "CIP reply truncated inside extended status",
            ));
        }
        let extended_status = (0..words).map(|i| read_u16(bytes, 4 + i * 2)).collect();
        Ok(Self {
            service: bytes[0] & !service::REPLY_MASK,
            general_status,
            extended_status,
            partial: general_status == 0x06,
            data: bytes[data_start..].to_vec(),
        })
    }

    pub fn first_extended_status(&self) -> u16 {
        self.extended_status.first().copied().unwrap_or(0)
    }
}

/// 解析应答并按通用状态分类
pub fn extract_reply(bytes: &[u8]) -> Result<CipReply, CommError> {
    let reply = CipReply::parse(bytes)?;
    match reply.general_status {
        0x00 | 0x06 => Ok(reply),
        status => {
            let mut message = format!(
                "CIP status 0x{status:02X}: {}",
                general_status_message(status)
            );
            if !reply.extended_status.is_empty() {
                let ext: Vec<String> = reply
                    .extended_status
                    .iter()
                    .map(|s| format!("0x{s:04X}"))
                    .collect();
                message.push_str(&format!(" (extended {})", ext.join(", ")));
            }
            Err(CommError::protocol(i32::from(status), message, status != 0x01))
        }
    }
}
