//! 作业调度领域模型：调度规则、周期定义、容错策略、队列、作业记录与索引。

pub mod entities;
pub mod indexes;
pub mod occurrence;
pub mod ports;
pub mod queue;
pub mod repositories;
pub mod resilience;
pub mod restrictions;
pub mod schedule;
pub mod work;

pub use entities::*;
pub use indexes::*;
pub use jobqueue_core::{SchedulerError, SchedulerResult};
pub use occurrence::*;
pub use ports::*;
pub use queue::*;
pub use repositories::*;
pub use resilience::*;
pub use restrictions::*;
pub use schedule::*;
pub use work::*;
