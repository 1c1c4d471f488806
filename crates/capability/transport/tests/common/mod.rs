#![allow(dead_code)]

use async_trait::async_trait;
use domain::CommError;
use plc_transport::{
    AsyncStream, ConnectionOptions, Connector, Driver, FrameDescriptor, FrameShape, Link,
    ReceiveTimeout, TransactionPipeline,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(plc_telemetry::init_tracing);
}

/// 测试帧：`AA 55 len status` + `len` 字节负载
pub fn marker_frame(payload: &[u8], status: u8) -> Vec<u8> {
    let mut frame = vec![0xAA, 0x55, payload.len() as u8, status];
    frame.extend_from_slice(payload);
    frame
}

pub struct MarkerFrame;

impl FrameDescriptor for MarkerFrame {
    fn shape(&self) -> FrameShape {
        FrameShape::fixed(4)
    }

    fn content_length(&self, head: &[u8]) -> usize {
        head[2] as usize
    }

    fn useless_prefix_len(&self, head: &[u8]) -> usize {
        match head.windows(2).position(|w| w == [0xAA, 0x55]) {
            Some(pos) => pos,
            None if head.last() == Some(&0xAA) => head.len() - 1,
            None => head.len(),
        }
    }
}

/// 使用测试帧的驱动；状态字节非 0 视为设备拒绝（软错误）
#[derive(Default)]
pub struct MarkerDriver {
    /// 非空时在连接建立后发送该握手负载
    pub handshake: Option<Vec<u8>>,
    /// 非空时在断开前发送该负载（不等待响应）
    pub farewell: Option<Vec<u8>>,
    pub handshakes: AtomicUsize,
    /// 因硬错误丢弃连接的次数
    pub faults: AtomicUsize,
}

#[async_trait]
impl Driver for MarkerDriver {
    fn frame_descriptor(&self, _sent: &[u8]) -> Box<dyn FrameDescriptor> {
        Box::new(MarkerFrame)
    }

    fn pack_header(&self, payload: &[u8]) -> Vec<u8> {
        marker_frame(payload, 0)
    }

    fn unpack_response(&self, _sent: &[u8], received: &[u8]) -> Result<Vec<u8>, CommError> {
        match received[3] {
            0 => Ok(received[4..].to_vec()),
            status => Err(CommError::protocol(
                i32::from(status),
                "device rejected request",
                true,
            )),
        }
    }

    async fn initialize_on_connect(&self, link: &mut Link<'_>) -> Result<(), CommError> {
        if let Some(handshake) = &self.handshake {
            link.exchange(handshake, true, true).await?;
            self.handshakes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn extra_on_disconnect(&self, link: &mut Link<'_>) -> Result<(), CommError> {
        if let Some(farewell) = &self.farewell {
            link.exchange(farewell, false, true).await?;
        }
        Ok(())
    }

    fn on_fault(&self) {
        self.faults.fetch_add(1, Ordering::SeqCst);
    }
}

/// 模拟设备对一条请求的反应
pub enum Reply {
    Frame(Vec<u8>),
    Delayed(Duration, Vec<u8>),
    Silence,
}

pub type Responder = Box<dyn Fn(&[u8]) -> Reply + Send + Sync>;

/// 回显负载
pub fn echo() -> Responder {
    Box::new(|request: &[u8]| Reply::Frame(marker_frame(&request[4..], 0)))
}

/// 基于内存管道的模拟设备
pub struct MockDevice {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub refuse_next: AtomicUsize,
    pub requests: Mutex<Vec<Vec<u8>>>,
    responder: Responder,
}

impl MockDevice {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            refuse_next: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            responder,
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    /// 等待设备侧观察到 `count` 次连接关闭
    pub async fn wait_closes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.closes() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device did not observe close");
    }

    /// 等待设备收到 `count` 条请求
    pub async fn wait_requests(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.requests.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device did not receive requests");
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        loop {
            let mut head = [0u8; 4];
            if stream.read_exact(&mut head).await.is_err() {
                break;
            }
            let mut request = head.to_vec();
            request.resize(4 + head[2] as usize, 0);
            if stream.read_exact(&mut request[4..]).await.is_err() {
                break;
            }
            self.requests.lock().unwrap().push(request.clone());

            let reply = (self.responder)(&request);
            match reply {
                Reply::Frame(bytes) => {
                    let _ = stream.write_all(&bytes).await;
                }
                Reply::Delayed(delay, bytes) => {
                    tokio::time::sleep(delay).await;
                    let _ = stream.write_all(&bytes).await;
                }
                Reply::Silence => {}
            }
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    pub device: Arc<MockDevice>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let refused = self
            .device
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock device refused",
            ));
        }
        let (client, server) = tokio::io::duplex(4096);
        self.device.connects.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.device.clone().serve(server));
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "mock:0".to_string()
    }
}

pub fn options(persistent: bool, receive_timeout_ms: i64) -> ConnectionOptions {
    ConnectionOptions {
        persistent,
        receive_timeout: ReceiveTimeout::from_millis(receive_timeout_ms),
        ..ConnectionOptions::default()
    }
}

pub fn pipeline(
    device: &Arc<MockDevice>,
    driver: MarkerDriver,
    options: ConnectionOptions,
) -> TransactionPipeline<MarkerDriver> {
    init_tracing();
    let connector = Arc::new(MockConnector {
        device: device.clone(),
    });
    TransactionPipeline::new(Arc::new(driver), connector, options)
}
