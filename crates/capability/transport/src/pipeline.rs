//! 事务流水线
//!
//! 一次事务的完整流程（全部在并发闸门内完成）：
//!
//! ```text
//! 进入闸门 → 取得连接 → 封装 → 发送 → [等待] → 接收一帧 → 帧头校验 → 解包
//!          → 更新连接健康状态 → [短连接：断开钩子 + 关闭] → 离开闸门
//! ```

use crate::connection::{ConnectionManager, ConnectionOptions, connector_for};
use crate::driver::{Driver, Link};
use crate::gate::{AdmissionControl, ConcurrencyGate};
use crate::socket::Connector;
use domain::CommError;
use plc_config::ConnectionConfig;
use plc_telemetry::{new_trace_id, record_transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, debug_span};

pub struct TransactionPipeline<D> {
    driver: Arc<D>,
    gate: ConcurrencyGate<ConnectionManager>,
    gate_timeout: Option<Duration>,
}

impl<D: Driver> TransactionPipeline<D> {
    /// 每条流水线独立的准入上限（`options.lock_limit`）
    pub fn new(driver: Arc<D>, connector: Arc<dyn Connector>, options: ConnectionOptions) -> Self {
        let admission = AdmissionControl::new(options.lock_limit);
        Self::with_admission(driver, connector, options, admission)
    }

    /// 与其他流水线共用同一个准入上限
    pub fn with_admission(
        driver: Arc<D>,
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
        admission: Arc<AdmissionControl>,
    ) -> Self {
        Self {
            driver,
            gate_timeout: options.receive_timeout.as_duration(),
            gate: ConcurrencyGate::new(ConnectionManager::new(connector, options), admission),
        }
    }

    pub fn from_config(driver: Arc<D>, config: &ConnectionConfig) -> Self {
        Self::new(driver, connector_for(config), ConnectionOptions::from(config))
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// 通用事务入口
    pub async fn transact(
        &self,
        payload: &[u8],
        expect_response: bool,
        use_framing: bool,
    ) -> Result<Vec<u8>, CommError> {
        self.run(&[payload], expect_response, use_framing).await
    }

    /// 封装发送并等待一帧响应，返回解包后的负载
    pub async fn send_receive(&self, payload: &[u8]) -> Result<Vec<u8>, CommError> {
        self.transact(payload, true, true).await
    }

    /// 封装发送，不等待响应
    pub async fn send_only(&self, payload: &[u8]) -> Result<(), CommError> {
        self.transact(payload, false, true).await.map(|_| ())
    }

    /// 依次收发多条报文并拼接响应；遇到第一条失败即返回。
    ///
    /// 整批在一次闸门持有期内完成，中间不会插入其他事务。
    pub async fn send_receive_batch<P>(&self, payloads: &[P]) -> Result<Vec<u8>, CommError>
    where
        P: AsRef<[u8]> + Sync,
    {
        let payloads: Vec<&[u8]> = payloads.iter().map(AsRef::as_ref).collect();
        self.run(&payloads, true, true).await
    }

    async fn run(
        &self,
        payloads: &[&[u8]],
        expect_response: bool,
        use_framing: bool,
    ) -> Result<Vec<u8>, CommError> {
        let trace_id = new_trace_id();
        let span = debug_span!(target: "plc.transport", "transaction", trace_id = %trace_id, messages = payloads.len());
        let started = Instant::now();

        let result = self
            .run_locked(payloads, expect_response, use_framing)
            .instrument(span)
            .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        record_transaction(result.is_ok(), latency_ms);
        if let Err(e) = &result {
            debug!(target: "plc.transport", trace_id = %trace_id, code = e.code(), error = %e, "transaction failed");
        }
        result
    }

    async fn run_locked(
        &self,
        payloads: &[&[u8]],
        expect_response: bool,
        use_framing: bool,
    ) -> Result<Vec<u8>, CommError> {
        let mut manager = self.gate.enter(self.gate_timeout).await?;
        let driver = self.driver.as_ref();
        let mut socket = manager.get_socket(driver).await?;

        let result = {
            let options = *manager.options();
            let receiver = *manager.receiver();
            let mut link = Link::new(&mut socket, driver, &options, &receiver);
            exchange_all(&mut link, payloads, expect_response, use_framing).await
        };

        manager.release(driver, socket, &result).await;
        result
    }

    /// 切换到长连接并立即建立连接
    pub async fn connect(&self) -> Result<(), CommError> {
        let mut manager = self.gate.enter(self.gate_timeout).await?;
        manager.connect(self.driver.as_ref()).await
    }

    /// 执行断开钩子、关闭连接并退出长连接模式
    pub async fn disconnect(&self) -> Result<(), CommError> {
        let mut manager = self.gate.enter(self.gate_timeout).await?;
        manager.close(self.driver.as_ref()).await
    }

    pub async fn set_persistent(&self, persistent: bool) -> Result<(), CommError> {
        let mut manager = self.gate.enter(self.gate_timeout).await?;
        manager.set_persistent(self.driver.as_ref(), persistent).await
    }

    pub async fn is_persistent(&self) -> bool {
        self.gate.inspect(ConnectionManager::is_persistent).await
    }

    pub async fn is_faulted(&self) -> bool {
        self.gate.inspect(ConnectionManager::is_faulted).await
    }

    pub async fn failure_count(&self) -> u32 {
        self.gate.inspect(ConnectionManager::failure_count).await
    }

    pub async fn current_socket_id(&self) -> Option<u64> {
        self.gate.inspect(ConnectionManager::current_socket_id).await
    }

    /// 当前持有者与排队者总数
    pub fn waiters(&self) -> usize {
        self.gate.waiters()
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        self.gate.admission()
    }
}

async fn exchange_all(
    link: &mut Link<'_>,
    payloads: &[&[u8]],
    expect_response: bool,
    use_framing: bool,
) -> Result<Vec<u8>, CommError> {
    let mut response = Vec::new();
    for payload in payloads {
        let bytes = link.exchange(payload, expect_response, use_framing).await?;
        response.extend_from_slice(&bytes);
    }
    Ok(response)
}
