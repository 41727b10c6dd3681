use thiserror::Error;

/// 调度引擎错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("作业未找到: {id}")]
    ProcessNotFound { id: i64 },
    #[error("队列未找到: {name}")]
    QueueNotFound { name: String },
    #[error("作业定义未注册: {key}")]
    WorkNotRegistered { key: String },
    #[error("作业已有活动的运行器: {id}")]
    RunnerActive { id: i64 },
    #[error("队列限制判断失败: {queue} - {message}")]
    Restriction { queue: String, message: String },
    #[error("持久化错误: {0}")]
    Persistence(String),
    #[error("事务错误: {0}")]
    Transaction(String),
    #[error("事务被主动回滚")]
    RollbackRequested,
    #[error("权限不足: {0}")]
    Permission(String),
    #[error("无效的调度定义: {0}")]
    InvalidSchedule(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("任务执行错误: {0}")]
    TaskExecution(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("引擎已关闭")]
    ShuttingDown,
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn process_not_found(id: i64) -> Self {
        Self::ProcessNotFound { id }
    }
    pub fn queue_not_found<S: Into<String>>(name: S) -> Self {
        Self::QueueNotFound { name: name.into() }
    }
    pub fn work_not_registered<S: Into<String>>(key: S) -> Self {
        Self::WorkNotRegistered { key: key.into() }
    }
    pub fn restriction<Q: Into<String>, M: Into<String>>(queue: Q, message: M) -> Self {
        Self::Restriction {
            queue: queue.into(),
            message: message.into(),
        }
    }
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn transaction<S: Into<String>>(msg: S) -> Self {
        Self::Transaction(msg.into())
    }
    pub fn permission<S: Into<String>>(msg: S) -> Self {
        Self::Permission(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::TaskExecution(msg.into())
    }

    /// 基础设施类错误，需要回滚当前事务
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SchedulerError::Persistence(_) | SchedulerError::Transaction(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::ShuttingDown
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Persistence(_)
                | SchedulerError::Transaction(_)
                | SchedulerError::Timeout(_)
        )
    }

    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::ProcessNotFound { .. } => "请求的作业不存在",
            SchedulerError::QueueNotFound { .. } => "请求的队列不存在",
            SchedulerError::Permission(_) => "您没有执行此操作的权限",
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::InvalidSchedule(_) => "调度配置有误",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(SchedulerError::persistence("disk full").is_infrastructure());
        assert!(SchedulerError::transaction("aborted").is_retryable());
        assert!(!SchedulerError::RollbackRequested.is_infrastructure());
        assert!(SchedulerError::config_error("bad").is_fatal());
        assert!(!SchedulerError::process_not_found(7).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::restriction("reports", "boom");
        assert_eq!(err.to_string(), "队列限制判断失败: reports - boom");
        assert_eq!(
            SchedulerError::permission("x").user_message(),
            "您没有执行此操作的权限"
        );
    }

    #[test]
    fn test_from_serde_json() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: SchedulerError = parse.unwrap_err().into();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
