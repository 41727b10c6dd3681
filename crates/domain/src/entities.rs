use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::indexes::IndexKind;
use crate::occurrence::Occurrence;
use crate::resilience::Resilience;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    NotRun,
    /// 已通过准入检查，等待执行
    Locked,
    Running,
    Restarted,
    RunError,
    RunOk,
    Deleted,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::NotRun => "NOT_RUN",
            ProcessStatus::Locked => "LOCKED",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Restarted => "RESTARTED",
            ProcessStatus::RunError => "RUN_ERROR",
            ProcessStatus::RunOk => "RUN_OK",
            ProcessStatus::Deleted => "DELETED",
        };
        f.write_str(s)
    }
}

/// 作业在服务器内的身份键，按 (创建时间, 名称, id) 排序
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub created_at: DateTime<Utc>,
    pub name: String,
    pub id: i64,
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.id, self.name)
    }
}

/// 作业输出声明
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRequest {
    pub report_type: String,
    pub source_name: String,
}

/// 作业记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntity {
    /// 非持久化作业使用负数 id
    pub id: i64,
    pub queue_owner: String,
    pub queue_name: String,
    pub name: String,
    pub description: Option<String>,
    pub user: Option<String>,
    pub status: ProcessStatus,
    /// 连续失败次数，成功后清零
    pub attempt: u32,
    /// 成功完成次数
    pub run_count: u32,
    pub result_code: i32,
    pub created_at: DateTime<Utc>,
    /// 最近一次非重试运行的唤醒时间
    pub scheduled_at: Option<DateTime<Utc>>,
    /// 最近一次尝试的开始时间
    pub started_at: Option<DateTime<Utc>>,
    /// 正在执行（或失败时停留）的分段
    pub current_section: usize,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub occurrence: Occurrence,
    pub resilience: Resilience,
    pub persistent: bool,
    pub keep_completed: bool,
    pub restart_requested: bool,
    pub work_key: Option<String>,
    pub output: Option<OutputRequest>,
    /// 重启后发现的中断作业，不持久化
    #[serde(skip)]
    pub orphaned: bool,
}

impl ProcessEntity {
    pub fn new(
        id: i64,
        queue_owner: impl Into<String>,
        queue_name: impl Into<String>,
        name: impl Into<String>,
        occurrence: Occurrence,
        resilience: Resilience,
    ) -> Self {
        Self {
            id,
            queue_owner: queue_owner.into(),
            queue_name: queue_name.into(),
            name: name.into(),
            description: None,
            user: None,
            status: ProcessStatus::NotRun,
            attempt: 0,
            run_count: 0,
            result_code: 0,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            current_section: 0,
            parameters: BTreeMap::new(),
            occurrence,
            resilience,
            persistent: false,
            keep_completed: false,
            restart_requested: false,
            work_key: None,
            output: None,
            orphaned: false,
        }
    }

    pub fn key(&self) -> ProcessKey {
        ProcessKey {
            created_at: self.created_at,
            name: self.name.clone(),
            id: self.id,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.result_code > 0 || self.status == ProcessStatus::RunError || self.orphaned
    }

    pub fn is_complete(&self) -> bool {
        self.status == ProcessStatus::RunOk
    }

    /// 受控停止（结果码大于1），重启前不再调度
    pub fn is_stopped(&self) -> bool {
        self.result_code > 1
    }

    /// 记录一次失败尝试
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.status = ProcessStatus::RunError;
        self.attempt = self.attempt.saturating_add(1);
        self.result_code = 1;
        self.started_at = Some(now);
    }

    /// 记录一次成功运行
    pub fn record_success(&mut self) {
        self.status = ProcessStatus::RunOk;
        self.run_count = self.run_count.saturating_add(1);
        self.attempt = 0;
        self.result_code = 0;
        self.current_section = 0;
        self.orphaned = false;
    }

    /// 下一次运行时间
    ///
    /// 失败路径以最近一次尝试为锚点，成功路径以最近一次计划唤醒时间为锚点。
    pub fn next_run_time(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.status == ProcessStatus::Deleted {
            return None;
        }
        if self.restart_requested {
            return Some(now);
        }
        if self.is_stopped() {
            return None;
        }

        let failed = self.is_failed();
        let anchor = if failed {
            self.started_at
                .or(self.scheduled_at)
                .unwrap_or(self.created_at)
        } else {
            self.scheduled_at.unwrap_or(self.created_at)
        };
        self.resilience.next_run_time(
            &self.occurrence,
            failed,
            self.attempt,
            anchor,
            self.run_count,
            now,
        )
    }

    /// 作业在索引中所属的分桶，已删除的作业不入索引
    pub fn index_kind(&self) -> Option<IndexKind> {
        match self.status {
            ProcessStatus::Deleted => None,
            ProcessStatus::Locked => Some(IndexKind::Waiting),
            ProcessStatus::Running if !self.orphaned => Some(IndexKind::Running),
            _ if self.is_failed() => Some(IndexKind::Failed),
            _ => Some(IndexKind::NotRun),
        }
    }
}
