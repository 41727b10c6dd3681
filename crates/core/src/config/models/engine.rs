use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 等待/唤醒调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 等待线程单次休眠上限（秒）
    pub max_sleep_seconds: u64,
    /// 被队列限制拒绝的作业重新检查间隔（毫秒）
    pub renotify_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_sleep_seconds: 60,
            renotify_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sleep_seconds == 0 {
            return Err(anyhow::anyhow!("最大休眠时间必须大于0"));
        }
        if self.renotify_interval_ms == 0 {
            return Err(anyhow::anyhow!("重新检查间隔必须大于0"));
        }
        Ok(())
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_seconds)
    }

    pub fn renotify_interval(&self) -> Duration {
        Duration::from_millis(self.renotify_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub max_concurrent_runs: usize,
    pub shutdown_timeout_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 64,
            shutdown_timeout_seconds: 30,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_runs == 0 {
            return Err(anyhow::anyhow!("最大并发执行数必须大于0"));
        }
        if self.shutdown_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("关闭超时时间必须大于0"));
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

/// 新建作业的默认属性（队列未指定时使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub owner: String,
    pub persistent: bool,
    pub keep_completed: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            owner: "default".to_string(),
            persistent: false,
            keep_completed: false,
        }
    }
}

impl DefaultsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.owner.trim().is_empty() {
            return Err(anyhow::anyhow!("默认队列所有者不能为空"));
        }
        Ok(())
    }
}
