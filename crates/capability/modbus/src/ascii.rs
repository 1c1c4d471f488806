//! Modbus ASCII：`:` + 十六进制（`station function data... lrc`）+ `CR LF`

use crate::checksum::lrc;
use crate::exception::validate_reply;
use async_trait::async_trait;
use domain::CommError;
use plc_transport::{Delimiter, Driver, FrameDescriptor, LineFrame};

/// 编码为一行 ASCII 帧
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() * 2 + 5);
    frame.push(b':');
    frame.extend_from_slice(hex::encode_upper(body).as_bytes());
    frame.extend_from_slice(hex::encode_upper([lrc(body)]).as_bytes());
    frame.extend_from_slice(Delimiter::CR_LF.as_bytes());
    frame
}

/// 解码一行 ASCII 帧并校验 LRC，返回 `station function data...`
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, CommError> {
    let text = frame
        .strip_prefix(b":")
        .and_then(|rest| rest.strip_suffix(Delimiter::CR_LF.as_bytes()))
        .ok_or_else(|| {
            CommError::invalid_frame(format!(
                "ASCII frame must be ':'..CRLF, got {}",
                hex::encode_upper(frame)
            ))
        })?;
    let mut bytes = hex::decode(text)
        .map_err(|e| CommError::invalid_frame(format!("ASCII frame is not hex: {e}")))?;
    let Some(checksum) = bytes.pop() else {
        return Err(CommError::invalid_frame("empty ASCII frame"));
    };
    let expected = lrc(&bytes);
    if checksum != expected {
        return Err(CommError::invalid_frame(format!(
            "LRC mismatch: expected {expected:02X}, got {checksum:02X}"
        )));
    }
    Ok(bytes)
}

/// 负载为 `station function data...`
#[derive(Debug, Default)]
pub struct ModbusAsciiDriver;

#[async_trait]
impl Driver for ModbusAsciiDriver {
    fn frame_descriptor(&self, _sent: &[u8]) -> Box<dyn FrameDescriptor> {
        Box::new(LineFrame::new(Delimiter::CR_LF))
    }

    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        encode_frame(payload)
    }

    fn unpack_response(&self, sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        let request = decode_frame(sent)?;
        let reply = decode_frame(received)?;
        let (&station, &function) = match request.as_slice() {
            [station, function, ..] => (station, function),
            _ => return Err(CommError::invalid_frame("ASCII request without function code")),
        };
        validate_reply(station, function, &reply)?;
        Ok(reply[2..].to_vec())
    }
}
