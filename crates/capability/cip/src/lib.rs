//! # 面向连接的 CIP 会话
//!
//! 基于 EtherNet/IP 封装（TCP 44818）的 CIP 连接报文通信：
//! - 注册会话（RegisterSession）获取会话句柄
//! - Forward Open 协商连接 ID（候选 ID 被占用时换 ID 重试）
//! - 连接报文（SendUnitData）承载标签读写，序号自增
//! - Forward Close + 注销会话
//!
//! 所有报文都经由 [`plc_transport::TransactionPipeline`] 收发。

mod client;
mod frame;
mod session;
mod status;

pub use client::{CipClient, CipValue, STRUCTURE_TYPE};
pub use frame::{
    CpfItem, EncapsulationFrame, EncapsulationHeader, ForwardOpenRequest, HEADER_LEN,
    MAX_CIP_REQUEST_LEN, check_request_len, command, encapsulate, find_item, item, parse_cpf,
    read_tag_request, register_session, send_rr_data, send_unit_data, service, symbolic_path,
    unregister_session, write_tag_request,
};
pub use session::{
    CipSessionOptions, ConnectedCipDriver, DEFAULT_RPI_US, DEFAULT_VENDOR_ID, ForwardOpenPolicy,
    SessionInfo, SessionState,
};
pub use status::{
    CipReply, check_encapsulation_status, encapsulation_status_message, extract_reply,
    forward_open_rejection, general_status_message,
};
