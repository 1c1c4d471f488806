//! 面向连接的 CIP 会话状态机
//!
//! ```text
//! Disconnected → Registering → Opening → Established → Closing → Disconnected
//! ```
//!
//! 握手在 [`Driver::initialize_on_connect`] 中完成，收尾在 [`Driver::extra_on_disconnect`] 中完成，
//! 两者都在事务流水线的并发闸门内执行，因此不会与已建立会话上的请求交错。

use crate::frame::{
    self, EncapsulationFrame, EncapsulationHeader, ForwardOpenRequest, HEADER_LEN, command, item,
    read_u16, read_u32,
};
use crate::status::{self, CipReply};
use async_trait::async_trait;
use domain::{CommError, ForwardOpenReason};
use plc_transport::{Driver, FrameDescriptor, Link};
use rand_core::{OsRng, RngCore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// 默认厂商 ID
pub const DEFAULT_VENDOR_ID: u16 = 0x1337;
/// 默认请求包间隔（微秒）
pub const DEFAULT_RPI_US: u32 = 0x0020_1234;
/// 未连接报文的超时（秒）
const UNCONNECTED_TIMEOUT_SECS: u16 = 10;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Registering,
    Opening,
    Established,
    Closing,
}

/// Forward Open 候选连接 ID 策略。
///
/// 前 `fixed_candidates` 次依次使用 `0..fixed_candidates`，
/// 之后在 `fixed_candidates..=random_candidate_max` 中随机选取，总计最多 `max_attempts` 次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardOpenPolicy {
    pub max_attempts: usize,
    pub fixed_candidates: u32,
    pub random_candidate_max: u32,
}

impl Default for ForwardOpenPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            fixed_candidates: 7,
            random_candidate_max: 200,
        }
    }
}

impl ForwardOpenPolicy {
    /// 第 `attempt` 次尝试（从 0 开始）使用的候选 ID
    pub fn candidate(&self, attempt: usize) -> u32 {
        let attempt = u32::try_from(attempt).unwrap_or(u32::MAX);
        if attempt < self.fixed_candidates {
            return attempt;
        }
        let span = self
            .random_candidate_max
            .saturating_sub(self.fixed_candidates)
            .saturating_add(1);
        self.fixed_candidates + OsRng.next_u32() % span
    }
}

/// CIP 会话参数
#[derive(Debug, Clone, Copy)]
pub struct CipSessionOptions {
    /// 背板槽号
    pub slot: u8,
    /// 断开前是否发送 Forward Close
    pub forward_close: bool,
    pub vendor_id: u16,
    pub rpi_us: u32,
    pub timeout_multiplier: u8,
    pub policy: ForwardOpenPolicy,
}

impl Default for CipSessionOptions {
    fn default() -> Self {
        Self {
            slot: 0,
            forward_close: true,
            vendor_id: DEFAULT_VENDOR_ID,
            rpi_us: DEFAULT_RPI_US,
            timeout_multiplier: 3,
            policy: ForwardOpenPolicy::default(),
        }
    }
}

/// 已协商的会话参数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionInfo {
    pub session_handle: u32,
    pub o_to_t_connection_id: u32,
    pub t_to_o_connection_id: u32,
    pub connection_serial: u16,
    /// 最近一次连接报文使用的序号
    pub sequence: u16,
}

#[derive(Default)]
struct Session {
    info: SessionInfo,
    forward_open: Option<ForwardOpenRequest>,
}

/// 通过事务流水线承载连接报文的 CIP 驱动
pub struct ConnectedCipDriver {
    options: CipSessionOptions,
    originator_serial: u32,
    context: AtomicU64,
    session: Mutex<Session>,
    state: watch::Sender<SessionState>,
}

impl ConnectedCipDriver {
    pub fn new(options: CipSessionOptions) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            options,
            originator_serial: OsRng.next_u32(),
            context: AtomicU64::new(0),
            session: Mutex::new(Session::default()),
            state,
        }
    }

    pub fn options(&self) -> &CipSessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn session(&self) -> SessionInfo {
        self.lock().info
    }

    /// 丢弃已协商的会话参数并回到 `Disconnected`
    pub(crate) fn reset(&self) {
        *self.lock() = Session::default();
        self.transition(SessionState::Disconnected);
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(target: "plc.cip", from = ?previous, to = ?next, "session state changed");
        }
    }

    async fn establish(&self, link: &mut Link<'_>) -> Result<(), CommError> {
        self.transition(SessionState::Registering);
        let handle = self.register(link).await?;
        self.lock().info.session_handle = handle;

        self.transition(SessionState::Opening);
        self.open(link, handle).await?;

        self.transition(SessionState::Established);
        Ok(())
    }

    async fn register(&self, link: &mut Link<'_>) -> Result<u32, CommError> {
        let context = self.context.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = link
            .exchange(&frame::register_session(context), true, false)
            .await?;
        let header = EncapsulationHeader::parse(&reply)?;
        status::check_encapsulation_status(header.status)?;
        if header.command != command::REGISTER_SESSION {
            return Err(CommError::invalid_frame(format!(
                "expected RegisterSession reply, got command 0x{:04X}",
                header.command
            )));
        }
        if header.session_handle == 0 {
            return Err(CommError::invalid_frame(
                "target assigned an empty session handle",
            ));
        }
        debug!(target: "plc.cip", socket_id = link.socket_id(), session_handle = header.session_handle, "session registered");
        Ok(header.session_handle)
    }

    async fn send_unconnected(
        &self,
        link: &mut Link<'_>,
        session_handle: u32,
        cip: &[u8],
    ) -> Result<CipReply, CommError> {
        let request = frame::send_rr_data(session_handle, UNCONNECTED_TIMEOUT_SECS, cip);
        let reply = link.exchange(&request, true, false).await?;
        let header = EncapsulationHeader::parse(&reply)?;
        status::check_encapsulation_status(header.status)?;
        if header.session_handle != session_handle {
            return Err(CommError::HeadValidationFailed {
                reason: format!(
                    "session handle 0x{:08X} does not match 0x{session_handle:08X}",
                    header.session_handle
                ),
            });
        }
        let items = frame::parse_cpf(&reply[HEADER_LEN..])?;
        CipReply::parse(frame::find_item(&items, item::UNCONNECTED_DATA)?)
    }

    async fn open(&self, link: &mut Link<'_>, session_handle: u32) -> Result<(), CommError> {
        let policy = self.options.policy;
        for attempt in 0..policy.max_attempts {
            let candidate = policy.candidate(attempt);
            let request = ForwardOpenRequest {
                t_to_o_connection_id: candidate,
                connection_serial: candidate as u16,
                vendor_id: self.options.vendor_id,
                originator_serial: self.originator_serial,
                timeout_multiplier: self.options.timeout_multiplier,
                rpi_us: self.options.rpi_us,
                slot: self.options.slot,
            };
            let reply = self
                .send_unconnected(link, session_handle, &request.encode())
                .await?;

            if reply.general_status == 0 {
                if reply.data.len() < 8 {
                    return Err(CommError::invalid_frame(
                        "forward open reply is missing connection ids",
                    ));
                }
                let info = SessionInfo {
                    session_handle,
                    o_to_t_connection_id: read_u32(&reply.data, 0),
                    t_to_o_connection_id: read_u32(&reply.data, 4),
                    connection_serial: request.connection_serial,
                    sequence: 0,
                };
                *self.lock() = Session {
                    info,
                    forward_open: Some(request),
                };
                info!(
                    target: "plc.cip",
                    attempt = attempt + 1,
                    candidate,
                    o_to_t = %format!("0x{:08X}", info.o_to_t_connection_id),
                    "forward open accepted"
                );
                return Ok(());
            }

            let extended_status = reply.first_extended_status();
            let (reason, message) = if reply.general_status == 0x01 {
                status::forward_open_rejection(extended_status)
            } else {
                (
                    ForwardOpenReason::Other,
                    status::general_status_message(reply.general_status),
                )
            };
            let last = attempt + 1 >= policy.max_attempts;
            if reason == ForwardOpenReason::InUse && !last {
                warn!(target: "plc.cip", attempt = attempt + 1, candidate, "forward open candidate in use, retrying");
                continue;
            }
            warn!(target: "plc.cip", attempt = attempt + 1, %reason, general_status = reply.general_status, extended_status, "forward open rejected");
            return Err(CommError::ForwardOpenRejected {
                reason,
                general_status: reply.general_status,
                extended_status,
                message: message.to_string(),
            });
        }
        Err(CommError::InvalidState(
            "forward open policy allows no attempts".to_string(),
        ))
    }
}

impl Default for ConnectedCipDriver {
    fn default() -> Self {
        Self::new(CipSessionOptions::default())
    }
}

/// 取出已发送连接报文中的序号
fn sent_sequence(sent: &[u8]) -> Result<u16, CommError> {
    let items = frame::parse_cpf(sent.get(HEADER_LEN..).unwrap_or_default())?;
    let data = frame::find_item(&items, item::CONNECTED_DATA)?;
    if data.len() < 2 {
        return Err(CommError::invalid_frame("connected data item without sequence"));
    }
    Ok(read_u16(data, 0))
}

#[async_trait]
impl Driver for ConnectedCipDriver {
    fn frame_descriptor(&self, sent: &[u8]) -> Box<dyn FrameDescriptor> {
        Box::new(EncapsulationFrame::for_request(sent))
    }

    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        let mut session = self.lock();
        session.info.sequence = session.info.sequence.wrapping_add(1);
        frame::send_unit_data(
            session.info.session_handle,
            session.info.o_to_t_connection_id,
            session.info.sequence,
            payload,
        )
    }

    fn unpack_response(&self, sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        if self.state() != SessionState::Established {
            return Err(CommError::InvalidState(
                "CIP session is not established".to_string(),
            ));
        }
        let header = EncapsulationHeader::parse(received)?;
        status::check_encapsulation_status(header.status)?;
        if header.command != command::SEND_UNIT_DATA {
            return Err(CommError::invalid_frame(format!(
                "expected SendUnitData reply, got command 0x{:04X}",
                header.command
            )));
        }

        let items = frame::parse_cpf(&received[HEADER_LEN..])?;
        let expected_id = self.lock().info.t_to_o_connection_id;
        let address = frame::find_item(&items, item::CONNECTED_ADDRESS)?;
        if address.len() < 4 || read_u32(address, 0) != expected_id {
            return Err(CommError::HeadValidationFailed {
                reason: format!(
                    "connected address {} does not match 0x{expected_id:08X}",
                    hex::encode_upper(address)
                ),
            });
        }

        let data = frame::find_item(&items, item::CONNECTED_DATA)?;
        if data.len() < 2 {
            return Err(CommError::invalid_frame(
                "connected data item without sequence",
            ));
        }
        let expected_sequence = sent_sequence(sent)?;
        if read_u16(data, 0) != expected_sequence {
            return Err(CommError::HeadValidationFailed {
                reason: format!(
                    "sequence {} does not match request {expected_sequence}",
                    read_u16(data, 0)
                ),
            });
        }

        let cip = &data[2..];
        status::extract_reply(cip)?;
        Ok(cip.to_vec())
    }

    async fn initialize_on_connect(&self, link: &mut Link<'_>) -> Result<(), CommError> {
        let result = self.establish(link).await;
        if let Err(e) = &result {
            warn!(target: "plc.cip", socket_id = link.socket_id(), code = e.code(), error = %e, "session handshake failed");
            self.reset();
        }
        result
    }

    async fn extra_on_disconnect(&self, link: &mut Link<'_>) -> Result<(), CommError> {
        self.transition(SessionState::Closing);
        let (handle, forward_open) = {
            let session = self.lock();
            (session.info.session_handle, session.forward_open)
        };

        let mut first_error = None;
        if let (true, Some(request)) = (self.options.forward_close, forward_open) {
            match self
                .send_unconnected(link, handle, &request.close_request())
                .await
            {
                Ok(reply) if reply.general_status == 0 => {
                    debug!(target: "plc.cip", session_handle = handle, "forward close accepted");
                }
                Ok(reply) => {
                    first_error = Some(CommError::protocol(
                        i32::from(reply.general_status),
                        format!(
                            "forward close rejected: {}",
                            status::general_status_message(reply.general_status)
                        ),
                        true,
                    ));
                }
                Err(e) => first_error = Some(e),
            }
        }

        if let Err(e) = link
            .exchange(&frame::unregister_session(handle), false, false)
            .await
        {
            first_error.get_or_insert(e);
        }

        if let Some(e) = &first_error {
            warn!(target: "plc.cip", session_handle = handle, error = %e, "session teardown incomplete");
        }
        self.reset();
        first_error.map_or(Ok(()), Err)
    }

    fn on_fault(&self) {
        debug!(target: "plc.cip", session_handle = self.session().session_handle, "dropping session of faulted connection");
        self.reset();
    }
}
