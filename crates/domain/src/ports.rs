//! 外部协作者接口：访问控制、可见性、作业输出

use crate::entities::ProcessEntity;
use crate::SchedulerResult;

/// 删除/重启授权
pub trait Access: Send + Sync {
    fn name(&self) -> &str;
    fn can_delete(&self, job: &ProcessEntity, user: Option<&str>, partition: &str) -> bool;
    fn can_restart(&self, job: &ProcessEntity, user: Option<&str>, partition: &str) -> bool;
}

pub trait Visibility: Send + Sync {
    fn name(&self) -> &str;
    fn is_visible(&self, job: &ProcessEntity, user: Option<&str>, partition: &str) -> bool;
}

/// 作业运行期间写入的输出目标
pub trait Outputable: Send {
    fn write(&mut self, text: &str) -> SchedulerResult<()>;

    fn close(&mut self) -> SchedulerResult<()> {
        Ok(())
    }
}

pub trait OutputProvider: Send + Sync {
    fn name(&self) -> &str;

    fn get_outputable(
        &self,
        owner: &str,
        user: Option<&str>,
        job_name: &str,
        report_type: &str,
        source_name: &str,
    ) -> SchedulerResult<Box<dyn Outputable>>;
}

/// 队列未配置访问控制时使用
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAccess;

impl Access for AllowAllAccess {
    fn name(&self) -> &str {
        "allow_all"
    }

    fn can_delete(&self, _job: &ProcessEntity, _user: Option<&str>, _partition: &str) -> bool {
        true
    }

    fn can_restart(&self, _job: &ProcessEntity, _user: Option<&str>, _partition: &str) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PublicVisibility;

impl Visibility for PublicVisibility {
    fn name(&self) -> &str {
        "public"
    }

    fn is_visible(&self, _job: &ProcessEntity, _user: Option<&str>, _partition: &str) -> bool {
        true
    }
}
