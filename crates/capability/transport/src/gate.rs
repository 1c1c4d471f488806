//! 并发闸门
//!
//! 每个连接一个闸门：同一时刻只有一个持有者执行事务，其余调用者在公平互斥锁上排队。
//! 排队人数由 [`AdmissionControl`] 限制，超过上限的调用立即失败而不是继续排队。
//! 准入计数通过 `Arc` 显式共享，可在多个连接间共用一个上限。

use domain::{CommError, TimeoutStage};
use plc_telemetry::{record_gate_rejection, record_gate_timeout};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

/// 排队准入控制
#[derive(Debug)]
pub struct AdmissionControl {
    limit: usize,
    queued: AtomicUsize,
}

impl AdmissionControl {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            queued: AtomicUsize::new(0),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 当前阻塞排队的调用者数量
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    fn try_admit(&self) -> Option<QueueTicket<'_>> {
        let mut current = self.queued.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return None;
            }
            match self.queued.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(QueueTicket(&self.queued)),
                Err(actual) => current = actual,
            }
        }
    }
}

/// 计数票据，离开作用域时归还（包括取消与错误路径）
struct QueueTicket<'a>(&'a AtomicUsize);

impl<'a> QueueTicket<'a> {
    fn take(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// 单连接并发闸门，保护其内部状态 `T`
#[derive(Debug)]
pub struct ConcurrencyGate<T> {
    inner: Mutex<T>,
    waiters: AtomicUsize,
    admission: Arc<AdmissionControl>,
}

impl<T> ConcurrencyGate<T> {
    pub fn new(value: T, admission: Arc<AdmissionControl>) -> Self {
        Self {
            inner: Mutex::new(value),
            waiters: AtomicUsize::new(0),
            admission,
        }
    }

    /// 进入闸门。
    ///
    /// 无人持有时立即进入；否则先经准入检查（超过上限返回 `TooManyWaiters`），
    /// 再最多等待 `timeout`（`None` 为不限时），超时返回 `Timeout { stage: Gate }`。
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<GateGuard<'_, T>, CommError> {
        let waiter = QueueTicket::take(&self.waiters);

        if let Ok(guard) = self.inner.try_lock() {
            return Ok(GateGuard {
                guard,
                _waiter: waiter,
            });
        }

        let Some(_queued) = self.admission.try_admit() else {
            record_gate_rejection();
            warn!(
                target: "plc.transport",
                limit = self.admission.limit,
                waiters = self.waiters(),
                "too many waiters, rejecting"
            );
            return Err(CommError::TooManyWaiters {
                limit: self.admission.limit,
            });
        };

        let guard = match timeout {
            None => self.inner.lock().await,
            Some(timeout) => match tokio::time::timeout(timeout, self.inner.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    record_gate_timeout();
                    return Err(CommError::Timeout {
                        stage: TimeoutStage::Gate,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
        };
        Ok(GateGuard {
            guard,
            _waiter: waiter,
        })
    }

    /// 读取内部状态（不计入排队与准入）
    pub async fn inspect<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.inner.lock().await;
        f(&guard)
    }

    /// 持有者与排队者总数
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn admission(&self) -> &Arc<AdmissionControl> {
        &self.admission
    }
}

/// 闸门持有凭证，drop 即离开
pub struct GateGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _waiter: QueueTicket<'a>,
}

impl<T> GateGuard<'_, T> {
    /// 离开闸门，唤醒下一个排队者
    pub fn leave(self) {}
}

impl<T> Deref for GateGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for GateGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
