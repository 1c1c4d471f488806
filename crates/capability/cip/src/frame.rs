//! EtherNet/IP 封装与 CIP 报文编码
//!
//! 封装头固定 24 字节，全部小端：
//!
//! ```text
//! command(2) length(2) session(4) status(4) context(8) options(4) | data(length)
//! ```
//!
//! SendRRData / SendUnitData 的数据部分为：
//! `interface(4) timeout(2) item_count(2) [type(2) len(2) data]...`（CPF 数据项）。

use bytes::{BufMut, BytesMut};
use domain::CommError;
use plc_transport::{FrameDescriptor, FrameShape};

pub const HEADER_LEN: usize = 24;

/// 封装命令
pub mod command {
    pub const REGISTER_SESSION: u16 = 0x0065;
    pub const UNREGISTER_SESSION: u16 = 0x0066;
    pub const SEND_RR_DATA: u16 = 0x006F;
    pub const SEND_UNIT_DATA: u16 = 0x0070;
}

/// CPF 数据项类型
pub mod item {
    pub const NULL_ADDRESS: u16 = 0x0000;
    pub const CONNECTED_ADDRESS: u16 = 0x00A1;
    pub const CONNECTED_DATA: u16 = 0x00B1;
    pub const UNCONNECTED_DATA: u16 = 0x00B2;
}

/// CIP 服务码
pub mod service {
    pub const READ_TAG: u8 = 0x4C;
    pub const WRITE_TAG: u8 = 0x4D;
    pub const FORWARD_CLOSE: u8 = 0x4E;
    pub const FORWARD_OPEN: u8 = 0x54;
    pub const REPLY_MASK: u8 = 0x80;
}

/// 连接管理器对象路径（class 0x06, instance 1）
const CONNECTION_MANAGER_PATH: [u8; 4] = [0x20, 0x06, 0x24, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationHeader {
    pub command: u16,
    pub length: u16,
    pub session_handle: u32,
    pub status: u32,
    pub context: [u8; 8],
    pub options: u32,
}

impl EncapsulationHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, CommError> {
        if bytes.len() < HEADER_LEN {
            return Err(CommError::invalid_frame(format!(
                "encapsulation header needs {HEADER_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut context = [0u8; 8];
        context.copy_from_slice(&bytes[12..20]);
        Ok(Self {
            command: read_u16(bytes, 0),
            length: read_u16(bytes, 2),
            session_handle: read_u32(bytes, 4),
            status: read_u32(bytes, 8),
            context,
            options: read_u32(bytes, 20),
        })
    }
}

/// 组装完整封装报文；`data` 不超过 65535 字节
pub fn encapsulate(command: u16, session_handle: u32, context: [u8; 8], data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u16_le(command);
    buf.put_u16_le(data.len() as u16);
    buf.put_u32_le(session_handle);
    buf.put_u32_le(0);
    buf.put_slice(&context);
    buf.put_u32_le(0);
    buf.put_slice(data);
    buf.to_vec()
}

/// RegisterSession：协议版本 1，选项 0
pub fn register_session(context: u64) -> Vec<u8> {
    encapsulate(
        command::REGISTER_SESSION,
        0,
        context.to_le_bytes(),
        &[0x01, 0x00, 0x00, 0x00],
    )
}

pub fn unregister_session(session_handle: u32) -> Vec<u8> {
    encapsulate(command::UNREGISTER_SESSION, session_handle, [0; 8], &[])
}

/// SendRRData：未连接报文（空地址项 + 未连接数据项）
pub fn send_rr_data(session_handle: u32, timeout_secs: u16, cip: &[u8]) -> Vec<u8> {
    let mut data = BytesMut::with_capacity(16 + cip.len());
    data.put_u32_le(0);
    data.put_u16_le(timeout_secs);
    data.put_u16_le(2);
    data.put_u16_le(item::NULL_ADDRESS);
    data.put_u16_le(0);
    data.put_u16_le(item::UNCONNECTED_DATA);
    data.put_u16_le(cip.len() as u16);
    data.put_slice(cip);
    encapsulate(command::SEND_RR_DATA, session_handle, [0; 8], &data)
}

/// SendUnitData：连接报文（连接地址项 + 带序号的连接数据项）；`cip` 不超过 [`MAX_CIP_REQUEST_LEN`]
pub fn send_unit_data(session_handle: u32, connection_id: u32, sequence: u16, cip: &[u8]) -> Vec<u8> {
    let mut data = BytesMut::with_capacity(24 + cip.len());
    data.put_u32_le(0);
    data.put_u16_le(0);
    data.put_u16_le(2);
    data.put_u16_le(item::CONNECTED_ADDRESS);
    data.put_u16_le(4);
    data.put_u32_le(connection_id);
    data.put_u16_le(item::CONNECTED_DATA);
    data.put_u16_le((cip.len() + 2) as u16);
    data.put_u16_le(sequence);
    data.put_slice(cip);
    encapsulate(command::SEND_UNIT_DATA, session_handle, [0; 8], &data)
}

/// CPF 数据项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpfItem<'a> {
    pub type_id: u16,
    pub data: &'a [u8],
}

/// 解析 SendRRData / SendUnitData 的数据部分
pub fn parse_cpf(data: &[u8]) -> Result<Vec<CpfItem<'_>>, CommError> {
    if data.len() < 8 {
        return Err(CommError::invalid_frame("common packet format too short"));
    }
    let count = read_u16(data, 6) as usize;
    let mut items = Vec::with_capacity(count);
    let mut offset = 8;
    for _ in 0..count {
        if data.len() < offset + 4 {
            return Err(CommError::invalid_frame("truncated CPF item header"));
        }
        let type_id = read_u16(data, offset);
        let len = read_u16(data, offset + 2) as usize;
        offset += 4;
        if data.len() < offset + len {
            return Err(CommError::invalid_frame(format!(
                "CPF item 0x{type_id:04X} declares {len} bytes, {} available",
                data.len() - offset
            )));
        }
        items.push(CpfItem {
            type_id,
            data: &data[offset..offset + len],
        });
        offset += len;
    }
    Ok(items)
}

/// 取出指定类型的 CPF 数据项
pub fn find_item<'a>(items: &[CpfItem<'a>], type_id: u16) -> Result<&'a [u8], CommError> {
    items
        .iter()
        .find(|item| item.type_id == type_id)
        .map(|item| item.data)
        .ok_or_else(|| CommError::invalid_frame(format!("missing CPF item 0x{type_id:04X}")))
}

/// 连接报文中 CIP 请求的最大长度（封装长度字段减去 CPF 开销）
pub const MAX_CIP_REQUEST_LEN: usize = u16::MAX as usize - 22;

/// ANSI 扩展符号段路径，成员以 `.` 分隔为多个段
pub fn symbolic_path(tag: &str) -> Result<Vec<u8>, CommError> {
    let mut path = Vec::with_capacity(tag.len() + 4);
    for segment in tag.split('.').filter(|s| !s.is_empty()) {
        let len = u8::try_from(segment.len()).map_err(|_| {
            CommError::invalid_frame(format!(
                "tag segment of {} bytes exceeds 255",
                segment.len()
            ))
        })?;
        path.push(0x91);
        path.push(len);
        path.extend_from_slice(segment.as_bytes());
        if segment.len() % 2 == 1 {
            path.push(0x00);
        }
    }
    if path.len() / 2 > usize::from(u8::MAX) {
        return Err(CommError::invalid_frame(format!(
            "tag path of {} words exceeds 255",
            path.len() / 2
        )));
    }
    Ok(path)
}

/// `path` 长度不超过 255 字
fn request_with_path(service: u8, path: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + path.len() + 16);
    buf.put_u8(service);
    buf.put_u8((path.len() / 2) as u8);
    buf.put_slice(path);
    buf
}

pub fn read_tag_request(tag: &str, elements: u16) -> Result<Vec<u8>, CommError> {
    let mut buf = request_with_path(service::READ_TAG, &symbolic_path(tag)?);
    buf.put_u16_le(elements);
    Ok(buf.to_vec())
}

pub fn write_tag_request(
    tag: &str,
    type_code: u16,
    elements: u16,
    data: &[u8],
) -> Result<Vec<u8>, CommError> {
    let mut buf = request_with_path(service::WRITE_TAG, &symbolic_path(tag)?);
    buf.put_u16_le(type_code);
    buf.put_u16_le(elements);
    buf.put_slice(data);
    check_request_len(&buf)?;
    Ok(buf.to_vec())
}

/// 请求必须能放进一条连接报文
pub fn check_request_len(request: &[u8]) -> Result<(), CommError> {
    if request.len() > MAX_CIP_REQUEST_LEN {
        return Err(CommError::invalid_frame(format!(
            "CIP request of {} bytes exceeds {MAX_CIP_REQUEST_LEN}",
            request.len()
        )));
    }
    Ok(())
}

/// Forward Open 请求参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenRequest {
    pub t_to_o_connection_id: u32,
    pub connection_serial: u16,
    pub vendor_id: u16,
    pub originator_serial: u32,
    pub timeout_multiplier: u8,
    pub rpi_us: u32,
    pub slot: u8,
}

/// 点对点、可变长度、504 字节
const NETWORK_PARAMS: u16 = 0x43F8;
/// 服务端、应用触发、class 3
const TRANSPORT_TRIGGER: u8 = 0xA3;

impl ForwardOpenRequest {
    fn connection_path(&self) -> [u8; 6] {
        [0x01, self.slot, 0x20, 0x02, 0x24, 0x01]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = request_with_path(service::FORWARD_OPEN, &CONNECTION_MANAGER_PATH);
        buf.put_u8(0x0A);
        buf.put_u8(0x0E);
        buf.put_u32_le(0);
        buf.put_u32_le(self.t_to_o_connection_id);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        buf.put_u8(self.timeout_multiplier);
        buf.put_slice(&[0, 0, 0]);
        buf.put_u32_le(self.rpi_us);
        buf.put_u16_le(NETWORK_PARAMS);
        buf.put_u32_le(self.rpi_us);
        buf.put_u16_le(NETWORK_PARAMS);
        buf.put_u8(TRANSPORT_TRIGGER);
        let path = self.connection_path();
        buf.put_u8((path.len() / 2) as u8);
        buf.put_slice(&path);
        buf.to_vec()
    }

    /// 与本次 Forward Open 对应的 Forward Close
    pub fn close_request(&self) -> Vec<u8> {
        let mut buf = request_with_path(service::FORWARD_CLOSE, &CONNECTION_MANAGER_PATH);
        buf.put_u8(0x0A);
        buf.put_u8(0x0E);
        buf.put_u16_le(self.connection_serial);
        buf.put_u16_le(self.vendor_id);
        buf.put_u32_le(self.originator_serial);
        let path = self.connection_path();
        buf.put_u8((path.len() / 2) as u8);
        buf.put_u8(0);
        buf.put_slice(&path);
        buf.to_vec()
    }
}

/// 封装报文帧描述：帧头 24 字节，内容长度取自 length 字段。
///
/// 除 RegisterSession 外，响应的会话句柄必须与请求一致。
#[derive(Debug, Clone, Copy)]
pub struct EncapsulationFrame {
    command: u16,
    session_handle: u32,
}

impl EncapsulationFrame {
    pub fn for_request(sent: &[u8]) -> Self {
        match EncapsulationHeader::parse(sent) {
            Ok(header) => Self {
                command: header.command,
                session_handle: header.session_handle,
            },
            Err(_) => Self {
                command: command::REGISTER_SESSION,
                session_handle: 0,
            },
        }
    }
}

impl FrameDescriptor for EncapsulationFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::fixed(HEADER_LEN)
    }

    fn content_length(&self, head: &[u8]) -> usize {
        read_u16(head, 2) as usize
    }

    fn check_head(&self, head: &[u8]) -> bool {
        self.command == command::REGISTER_SESSION || read_u32(head, 4) == self.session_handle
    }
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
