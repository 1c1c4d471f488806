//! 异常应答与站号 / 功能码校验

use domain::CommError;
use tracing::debug;

/// 功能码最高位置 1 表示异常应答
pub const EXCEPTION_FLAG: u8 = 0x80;

pub fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge: request accepted, processing takes long",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target device failed to respond",
        _ => "unknown exception",
    }
}

/// 校验应答 `[station, function, ...]` 与请求匹配；异常应答转为软错误
pub(crate) fn validate_reply(station: u8, function: u8, reply: &[u8]) -> Result<(), CommError> {
    let [reply_station, reply_function, rest @ ..] = reply else {
        return Err(CommError::invalid_frame(format!(
            "modbus reply too short: {}",
            hex::encode_upper(reply)
        )));
    };
    if *reply_station != station {
        return Err(CommError::HeadValidationFailed {
            reason: format!("station {reply_station} does not answer request to {station}"),
        });
    }
    if *reply_function == function | EXCEPTION_FLAG {
        let code = rest.first().copied().unwrap_or(0);
        debug!(target: "plc.modbus", station, function, code, "exception reply");
        return Err(CommError::protocol(
            i32::from(code),
            format!(
                "modbus exception 0x{code:02X} for function 0x{function:02X}: {}",
                exception_message(code)
            ),
            true,
        ));
    }
    if *reply_function != function {
        return Err(CommError::HeadValidationFailed {
            reason: format!(
                "function 0x{reply_function:02X} does not answer request 0x{function:02X}"
            ),
        });
    }
    Ok(())
}
