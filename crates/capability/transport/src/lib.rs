//! # 通用二进制事务引擎
//!
//! 所有协议驱动共用的收发核心：
//! - **连接管理**：短连接 / 长连接两种套接字生命周期，连续失败计数
//! - **并发闸门**：单连接互斥 + 排队准入控制
//! - **帧接收**：定长帧头（含垃圾数据重新对齐）与分隔符两种拆帧方式
//! - **事务流水线**：封装 → 发送 → 接收 → 解包，以及批量收发
//!
//! ## 架构设计
//!
//! ```text
//! 驱动 (impl Driver)
//!       │ send_receive / send_receive_batch
//!       ▼
//! TransactionPipeline
//!       │
//!       ├── ConcurrencyGate ── AdmissionControl
//!       ├── ConnectionManager ── Connector (TCP / UDP)
//!       │         │
//!       │         └── Driver::initialize_on_connect / extra_on_disconnect
//!       ▼
//! PipeSocket ── FrameReceiver ── FrameDescriptor
//! ```
//!
//! ## 配置格式
//!
//! ```json
//! { "host": "192.168.1.100", "port": 502, "receive_timeout_ms": 2000, "persistent": true }
//! ```

mod connection;
mod driver;
mod frame;
mod gate;
mod pipeline;
mod push;
mod receiver;
mod socket;
mod udp;

pub use connection::{ConnectionManager, ConnectionOptions, ReceiveTimeout, connector_for};
pub use driver::{Driver, Link};
pub use frame::{Delimiter, FixedFrame, FrameDescriptor, FrameShape, LineFrame, MAX_TRAILING};
pub use gate::{AdmissionControl, ConcurrencyGate, GateGuard};
pub use pipeline::TransactionPipeline;
pub use push::{DescriptorFactory, PushListener, PushedFrame};
pub use receiver::{DEFAULT_MAX_CONTENT_LENGTH, DEFAULT_MAX_REALIGN_ATTEMPTS, FrameReceiver};
pub use socket::{
    AsyncStream, Connector, Deadline, FAILURE_CEILING, FailureCounter, MAX_LINE_LENGTH,
    PipeSocket, TcpConnector, next_socket_id,
};
pub use udp::{MAX_DATAGRAM_SIZE, UdpConnector, UdpStream};
