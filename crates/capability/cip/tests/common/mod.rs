#![allow(dead_code)]

use async_trait::async_trait;
use plc_cip::{
    CipClient, CipSessionOptions, EncapsulationHeader, HEADER_LEN, command, encapsulate,
    find_item, item, parse_cpf, send_rr_data, send_unit_data, service,
};
use plc_transport::{AsyncStream, ConnectionOptions, Connector, ReceiveTimeout};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const SESSION_HANDLE: u32 = 0x1122_3344;
pub const O_TO_T_ID: u32 = 0x8000_0001;

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(plc_telemetry::init_tracing);
}

/// 模拟 PLC 对第 n 次 Forward Open 的反应
pub enum OpenReply {
    Accept,
    InUse,
    Reject(u8, u16),
}

pub type OpenPolicy = Box<dyn Fn(usize) -> OpenReply + Send + Sync>;
pub type CipResponder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

pub fn always_accept() -> OpenPolicy {
    Box::new(|_| OpenReply::Accept)
}

/// 按服务码回复成功；读请求返回 DINT 42
pub fn default_responder() -> CipResponder {
    Box::new(|request: &[u8]| match request[0] {
        service::READ_TAG => vec![0xCC, 0x00, 0x00, 0x00, 0xC4, 0x00, 0x2A, 0x00, 0x00, 0x00],
        other => vec![other | service::REPLY_MASK, 0x00, 0x00, 0x00],
    })
}

/// 脚本化的 EtherNet/IP 目标设备
pub struct CipDevice {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub forward_closes: AtomicUsize,
    pub unregisters: AtomicUsize,
    /// 每次 Forward Open 请求携带的 T→O 候选 ID
    pub candidates: Mutex<Vec<u32>>,
    /// 连接报文中的 CIP 请求
    pub requests: Mutex<Vec<Vec<u8>>>,
    /// 置位后下一条连接报文应答使用错误的会话句柄
    pub wrong_session: AtomicBool,
    /// Forward Close 应答的通用状态
    pub forward_close_status: AtomicU8,
    open_policy: OpenPolicy,
    responder: CipResponder,
}

impl CipDevice {
    pub fn new(open_policy: OpenPolicy, responder: CipResponder) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            forward_closes: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            wrong_session: AtomicBool::new(false),
            forward_close_status: AtomicU8::new(0),
            open_policy,
            responder,
        })
    }

    pub fn candidates(&self) -> Vec<u32> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    pub async fn wait_closes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.closes.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device did not observe close");
    }

    fn unconnected(&self, cip: &[u8], accepted: &mut u32) -> Vec<u8> {
        match cip[0] {
            service::FORWARD_OPEN => {
                let t_to_o = u32::from_le_bytes([cip[12], cip[13], cip[14], cip[15]]);
                let attempt = {
                    let mut candidates = self.candidates.lock().unwrap();
                    candidates.push(t_to_o);
                    candidates.len() - 1
                };
                match (self.open_policy)(attempt) {
                    OpenReply::Accept => {
                        *accepted = t_to_o;
                        let mut reply = vec![0xD4, 0x00, 0x00, 0x00];
                        reply.extend_from_slice(&O_TO_T_ID.to_le_bytes());
                        reply.extend_from_slice(&t_to_o.to_le_bytes());
                        reply.extend_from_slice(&cip[16..24]);
                        reply.extend_from_slice(&[0; 10]);
                        reply
                    }
                    OpenReply::InUse => vec![0xD4, 0x00, 0x01, 0x01, 0x00, 0x01],
                    OpenReply::Reject(general, extended) => {
                        let mut reply = vec![0xD4, 0x00, general, 0x01];
                        reply.extend_from_slice(&extended.to_le_bytes());
                        reply
                    }
                }
            }
            service::FORWARD_CLOSE => {
                self.forward_closes.fetch_add(1, Ordering::SeqCst);
                vec![0xCE, 0x00, self.forward_close_status.load(Ordering::SeqCst), 0x00]
            }
            other => vec![other | service::REPLY_MASK, 0x00, 0x08, 0x00],
        }
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        let mut accepted = 0u32;
        loop {
            let mut head = [0u8; HEADER_LEN];
            if stream.read_exact(&mut head).await.is_err() {
                break;
            }
            let header = EncapsulationHeader::parse(&head).unwrap();
            let mut data = vec![0u8; header.length as usize];
            if stream.read_exact(&mut data).await.is_err() {
                break;
            }

            let reply = match header.command {
                command::REGISTER_SESSION => Some(encapsulate(
                    command::REGISTER_SESSION,
                    SESSION_HANDLE,
                    header.context,
                    &[0x01, 0x00, 0x00, 0x00],
                )),
                command::SEND_RR_DATA => {
                    let items = parse_cpf(&data).unwrap();
                    let cip = find_item(&items, item::UNCONNECTED_DATA).unwrap();
                    let reply = self.unconnected(cip, &mut accepted);
                    Some(send_rr_data(SESSION_HANDLE, 0, &reply))
                }
                command::SEND_UNIT_DATA => {
                    let items = parse_cpf(&data).unwrap();
                    let payload = find_item(&items, item::CONNECTED_DATA).unwrap();
                    let sequence = u16::from_le_bytes([payload[0], payload[1]]);
                    let cip = payload[2..].to_vec();
                    self.requests.lock().unwrap().push(cip.clone());
                    let reply = (self.responder)(&cip);
                    let handle = if self.wrong_session.swap(false, Ordering::SeqCst) {
                        SESSION_HANDLE + 1
                    } else {
                        SESSION_HANDLE
                    };
                    Some(send_unit_data(handle, accepted, sequence, &reply))
                }
                command::UNREGISTER_SESSION => {
                    self.unregisters.fetch_add(1, Ordering::SeqCst);
                    None
                }
                _ => None,
            };

            if let Some(reply) = reply
                && stream.write_all(&reply).await.is_err()
            {
                break;
            }
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CipConnector {
    pub device: Arc<CipDevice>,
}

#[async_trait]
impl Connector for CipConnector {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let (client, server) = tokio::io::duplex(8192);
        self.device.connects.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.device.clone().serve(server));
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "mock-plc:44818".to_string()
    }
}

pub fn client(device: &Arc<CipDevice>) -> CipClient {
    init_tracing();
    let connection = ConnectionOptions {
        receive_timeout: ReceiveTimeout::from_millis(2000),
        ..ConnectionOptions::default()
    };
    CipClient::with_connector(
        Arc::new(CipConnector {
            device: device.clone(),
        }),
        connection,
        CipSessionOptions::default(),
    )
}
