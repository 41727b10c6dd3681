use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

/// 优雅关闭管理器
///
/// 只负责保证关闭流程执行一次；调度任务的停止由引擎的取消令牌完成。
#[derive(Debug, Default)]
pub struct ShutdownManager {
    is_shutdown: AtomicBool,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 触发关闭，返回本次调用是否是第一次触发
    pub fn shutdown(&self) -> bool {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("关闭管理器已经触发过关闭");
            return false;
        }
        info!("关闭信号已发送");
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_shutdown_manager_basic() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_shutdown());
        assert!(manager.shutdown());
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_double_shutdown() {
        let manager = ShutdownManager::new();
        assert!(manager.shutdown());
        assert!(!manager.shutdown());
        assert!(manager.is_shutdown());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shutdown_triggers_once() {
        let manager = Arc::new(ShutdownManager::new());
        let callers: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.shutdown() })
            })
            .collect();

        let mut triggered = 0;
        for caller in callers {
            if caller.await.unwrap() {
                triggered += 1;
            }
        }
        assert_eq!(triggered, 1);
    }
}
