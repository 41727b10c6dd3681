//! 周期定义：按已成功运行次数索引的调度规则序列

use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::{CalendarUnit, Schedule};
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceKind {
    /// 规则用完即结束
    Finite,
    /// 最后一条规则无限重复
    Infinite,
}

/// 周期定义
///
/// 相等性与哈希基于 [`Occurrence::canonical`]。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    name: String,
    schedules: Vec<Schedule>,
    kind: OccurrenceKind,
}

impl Occurrence {
    /// 立即运行一次
    pub fn immediate() -> Self {
        Self::once("immediate", Schedule::immediate())
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self::once("at", Schedule::at(at))
    }

    pub fn after(unit: CalendarUnit, amount: u32) -> Self {
        Self::once("after", Schedule::after(unit, amount))
    }

    pub fn once(name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            schedules: vec![schedule],
            kind: OccurrenceKind::Finite,
        }
    }

    pub fn every(schedule: Schedule) -> Self {
        Self {
            name: "every".to_string(),
            schedules: vec![schedule],
            kind: OccurrenceKind::Infinite,
        }
    }

    pub fn times(count: usize, schedule: Schedule) -> Self {
        Self {
            name: format!("times{count}"),
            schedules: vec![schedule; count],
            kind: OccurrenceKind::Finite,
        }
    }

    pub fn builder(name: impl Into<String>) -> OccurrenceBuilder {
        OccurrenceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> OccurrenceKind {
        self.kind
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.schedules
    }

    pub fn is_finite(&self) -> bool {
        self.kind == OccurrenceKind::Finite
    }

    /// 第 `index` 次运行使用的规则，有限序列越界时返回 None
    pub fn schedule(&self, index: u32) -> Option<&Schedule> {
        let index = usize::try_from(index).ok()?;
        match self.kind {
            OccurrenceKind::Finite => self.schedules.get(index),
            OccurrenceKind::Infinite => self
                .schedules
                .get(index)
                .or_else(|| self.schedules.last()),
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.schedules.is_empty() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "周期定义 {} 不包含任何调度规则",
                self.name
            )));
        }
        self.schedules.iter().try_for_each(Schedule::validate)
    }

    pub fn canonical(&self) -> String {
        let kind = match self.kind {
            OccurrenceKind::Finite => "finite",
            OccurrenceKind::Infinite => "infinite",
        };
        let schedules: Vec<String> = self.schedules.iter().map(ToString::to_string).collect();
        format!("{}:{}[{}]", self.name, kind, schedules.join(";"))
    }
}

impl PartialEq for Occurrence {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Occurrence {}

impl Hash for Occurrence {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl fmt::Display for Occurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

pub struct OccurrenceBuilder {
    name: String,
    schedules: Vec<Schedule>,
}

impl OccurrenceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schedules: Vec::new(),
        }
    }

    pub fn then(mut self, schedule: Schedule) -> Self {
        self.schedules.push(schedule);
        self
    }

    pub fn repeat(mut self, schedule: Schedule, count: usize) -> Self {
        self.schedules
            .extend(std::iter::repeat(schedule).take(count));
        self
    }

    /// 有限序列
    pub fn build(self) -> SchedulerResult<Occurrence> {
        self.finish(OccurrenceKind::Finite)
    }

    /// 以 `schedule` 结尾并无限重复
    pub fn forever(mut self, schedule: Schedule) -> SchedulerResult<Occurrence> {
        self.schedules.push(schedule);
        self.finish(OccurrenceKind::Infinite)
    }

    fn finish(self, kind: OccurrenceKind) -> SchedulerResult<Occurrence> {
        let occurrence = Occurrence {
            name: self.name,
            schedules: self.schedules,
            kind,
        };
        occurrence.validate()?;
        Ok(occurrence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_finite_indexing() {
        let occurrence = Occurrence::times(2, Schedule::daily(1, 0));
        assert!(occurrence.schedule(0).is_some());
        assert!(occurrence.schedule(1).is_some());
        assert!(occurrence.schedule(2).is_none());
    }

    #[test]
    fn test_infinite_repeats_last_schedule() {
        let occurrence = Occurrence::builder("warmup")
            .then(Schedule::immediate())
            .forever(Schedule::every_minutes(10))
            .unwrap();
        assert_eq!(occurrence.schedule(0), Some(&Schedule::immediate()));
        assert_eq!(occurrence.schedule(1), Some(&Schedule::every_minutes(10)));
        assert_eq!(occurrence.schedule(500), Some(&Schedule::every_minutes(10)));
    }

    #[test]
    fn test_equality_by_canonical_form() {
        let a = Occurrence::every(Schedule::daily(9, 0));
        let b = Occurrence::every(Schedule::daily(9, 0));
        let c = Occurrence::every(Schedule::daily(9, 1));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<Occurrence> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_builder_rejects_empty_and_invalid() {
        assert!(Occurrence::builder("empty").build().is_err());
        assert!(Occurrence::builder("bad")
            .then(Schedule::daily(99, 0))
            .build()
            .is_err());
        let ok = Occurrence::builder("twice")
            .repeat(Schedule::hourly(0), 2)
            .build()
            .unwrap();
        assert_eq!(ok.schedules().len(), 2);
        assert!(ok.is_finite());
    }
}
