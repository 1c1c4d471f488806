#![allow(dead_code)]

use async_trait::async_trait;
use plc_modbus::crc16;
use plc_transport::{
    AsyncStream, ConnectionOptions, Connector, Driver, ReceiveTimeout, TransactionPipeline,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

static INIT_TRACING: Once = Once::new();

pub fn init_tracing() {
    INIT_TRACING.call_once(plc_telemetry::init_tracing);
}

/// 追加 CRC 的 RTU 帧
pub fn rtu(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

pub type Responder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// 每收到一块请求字节即按脚本应答的从站；空应答表示不回复
pub struct ScriptedDevice {
    pub connects: AtomicUsize,
    pub requests: Mutex<Vec<Vec<u8>>>,
    responder: Responder,
}

impl ScriptedDevice {
    pub fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            responder,
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    async fn serve(self: Arc<Self>, mut stream: DuplexStream) {
        let mut buf = vec![0u8; 1024];
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let request = buf[..n].to_vec();
            self.requests.lock().unwrap().push(request.clone());
            let reply = (self.responder)(&request);
            if !reply.is_empty() && stream.write_all(&reply).await.is_err() {
                break;
            }
        }
    }
}

pub struct ScriptedConnector {
    pub device: Arc<ScriptedDevice>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> io::Result<Box<dyn AsyncStream>> {
        let (client, server) = tokio::io::duplex(4096);
        self.device.connects.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(self.device.clone().serve(server));
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "mock-slave:502".to_string()
    }
}

pub fn pipeline<D: Driver>(
    device: &Arc<ScriptedDevice>,
    driver: D,
    persistent: bool,
    receive_timeout_ms: i64,
) -> TransactionPipeline<D> {
    init_tracing();
    let options = ConnectionOptions {
        persistent,
        receive_timeout: ReceiveTimeout::from_millis(receive_timeout_ms),
        ..ConnectionOptions::default()
    };
    TransactionPipeline::new(
        Arc::new(driver),
        Arc::new(ScriptedConnector {
            device: device.clone(),
        }),
        options,
    )
}
