//! # Modbus 驱动
//!
//! 三种 Modbus 帧格式在事务引擎上的钩子实现，调用方负载统一为
//! `station function data...`，应答统一返回功能码之后的字节：
//!
//! | 驱动 | 封装 | 帧识别 | 完整性 |
//! |------|------|--------|--------|
//! | [`ModbusRtuDriver`] | 追加 CRC16 | 3 字节帧头 + 按功能码推算长度 | CRC16 |
//! | [`ModbusTcpDriver`] | MBAP 头 + 事务号 | 6 字节 MBAP 头 | 事务号回显 |
//! | [`ModbusAsciiDriver`] | `:` + 十六进制 + LRC + CRLF | 行 | LRC |
//!
//! ```rust,ignore
//! let pipeline = TransactionPipeline::from_config(Arc::new(ModbusRtuDriver), &config);
//! let registers = pipeline.send_receive(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).await?;
//! ```

mod ascii;
mod checksum;
mod exception;
mod rtu;
mod tcp;

pub use ascii::{ModbusAsciiDriver, decode_frame, encode_frame};
pub use checksum::{crc16, lrc};
pub use exception::{EXCEPTION_FLAG, exception_message};
pub use rtu::{ModbusRtuDriver, RtuFrame};
pub use tcp::{MbapFrame, ModbusTcpDriver};
