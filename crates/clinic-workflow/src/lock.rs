//! 有界等待的加锁工具
//!
//! 所有临界区都以有限时间等待锁，超时返回 `ResourceBusy`，避免终端界面长时间无响应。

use clinic_core::{ClinicError, Result};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};

/// 在 `timeout` 内获取锁
pub(crate) async fn lock_within<'a, T>(
    mutex: &'a Mutex<T>,
    timeout: Duration,
    resource: impl Display,
) -> Result<MutexGuard<'a, T>> {
    match tokio::time::timeout(timeout, mutex.lock()).await {
        Ok(guard) => Ok(guard),
        Err(_) => Err(busy(resource, timeout)),
    }
}

/// 在 `timeout` 内获取共享互斥量的所有权锁
pub(crate) async fn lock_owned_within<T>(
    mutex: Arc<Mutex<T>>,
    timeout: Duration,
    resource: impl Display,
) -> Result<OwnedMutexGuard<T>> {
    match tokio::time::timeout(timeout, mutex.lock_owned()).await {
        Ok(guard) => Ok(guard),
        Err(_) => Err(busy(resource, timeout)),
    }
}

fn busy(resource: impl Display, timeout: Duration) -> ClinicError {
    tracing::warn!("Lock on {} not acquired within {:?}", resource, timeout);
    ClinicError::ResourceBusy(format!("{} is held by another operation", resource))
}
