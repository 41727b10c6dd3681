//! 容错策略：错过运行的补偿方式与失败重试计划

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::occurrence::Occurrence;
use crate::{SchedulerError, SchedulerResult};

/// 错过的运行如何处理
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedRunPolicy {
    /// 无论错过多少次，只补跑一次
    #[default]
    RunOnlyOnce,
    /// 丢弃所有错过的运行，直接跳到未来
    ForgetMissed,
    /// 逐个补跑每一次错过的运行
    CatchUp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resilience {
    policy: MissedRunPolicy,
    failure: Option<Occurrence>,
}

impl Resilience {
    pub fn new(policy: MissedRunPolicy) -> Self {
        Self {
            policy,
            failure: None,
        }
    }

    pub fn with_failure(mut self, failure: Occurrence) -> SchedulerResult<Self> {
        self.set_failure_occurrence(failure)?;
        Ok(self)
    }

    pub fn policy(&self) -> MissedRunPolicy {
        self.policy
    }

    pub fn failure_occurrence(&self) -> Option<&Occurrence> {
        self.failure.as_ref()
    }

    /// 失败重试计划只能设置一次
    pub fn set_failure_occurrence(&mut self, failure: Occurrence) -> SchedulerResult<()> {
        if self.failure.is_some() {
            return Err(SchedulerError::config_error(
                "失败重试计划已设置，不能重复设置",
            ));
        }
        failure.validate()?;
        self.failure = Some(failure);
        Ok(())
    }

    /// 计算下一次运行时间
    ///
    /// * `failed` 时按失败重试计划，从第 `attempt - 1` 条规则推算；
    /// * 否则按 `occurrence` 的第 `run_count` 条规则推算，再按错过策略修正。
    pub fn next_run_time(
        &self,
        occurrence: &Occurrence,
        failed: bool,
        attempt: u32,
        anchor: DateTime<Utc>,
        run_count: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if failed {
            let failure = self.failure.as_ref()?;
            return failure
                .schedule(attempt.checked_sub(1)?)?
                .next_run_time(anchor);
        }
        self.adjusted_next_run_time(occurrence, anchor, run_count, now)
    }

    fn adjusted_next_run_time(
        &self,
        occurrence: &Occurrence,
        anchor: DateTime<Utc>,
        run_count: u32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut candidate = occurrence.schedule(run_count)?.next_run_time(anchor)?;
        if self.policy == MissedRunPolicy::CatchUp || candidate > now {
            return Some(candidate);
        }

        let mut step: u32 = 1;
        loop {
            let next = run_count
                .checked_add(step)
                .and_then(|index| occurrence.schedule(index))
                .map(|schedule| schedule.next_run_time(candidate));

            match next {
                // 序列耗尽
                None => {
                    return match self.policy {
                        MissedRunPolicy::ForgetMissed if step > 1 => None,
                        _ => Some(candidate),
                    };
                }
                // 规则无法再推进
                Some(None) => return Some(candidate),
                Some(Some(next)) if next <= candidate => return Some(candidate),
                Some(Some(next)) => {
                    if next > now {
                        return match self.policy {
                            MissedRunPolicy::ForgetMissed => Some(next),
                            _ => Some(candidate),
                        };
                    }
                    candidate = next;
                }
            }
            step = step.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{CalendarUnit, Schedule};
    use chrono::TimeZone;

    fn utc(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, h, 0, 0).unwrap()
    }

    fn daily_at_nine() -> Occurrence {
        Occurrence::every(Schedule::daily(9, 0))
    }

    #[test]
    fn test_future_candidate_is_returned_by_every_policy() {
        for policy in [
            MissedRunPolicy::RunOnlyOnce,
            MissedRunPolicy::ForgetMissed,
            MissedRunPolicy::CatchUp,
        ] {
            let next = Resilience::new(policy).next_run_time(
                &daily_at_nine(),
                false,
                0,
                utc(1, 8),
                0,
                utc(1, 8),
            );
            assert_eq!(next, Some(utc(1, 9)));
        }
    }

    #[test]
    fn test_run_only_once_returns_latest_missed() {
        // 锚点 5/1 08:00，当前 5/4 12:00：错过 5/1, 5/2, 5/3, 5/4 09:00
        let next = Resilience::new(MissedRunPolicy::RunOnlyOnce).next_run_time(
            &daily_at_nine(),
            false,
            0,
            utc(1, 8),
            0,
            utc(4, 12),
        );
        assert_eq!(next, Some(utc(4, 9)));
    }

    #[test]
    fn test_forget_missed_jumps_to_future() {
        let next = Resilience::new(MissedRunPolicy::ForgetMissed).next_run_time(
            &daily_at_nine(),
            false,
            0,
            utc(1, 8),
            0,
            utc(4, 12),
        );
        assert_eq!(next, Some(utc(5, 9)));
    }

    #[test]
    fn test_catch_up_returns_first_missed() {
        let next = Resilience::new(MissedRunPolicy::CatchUp).next_run_time(
            &daily_at_nine(),
            false,
            0,
            utc(1, 8),
            0,
            utc(4, 12),
        );
        assert_eq!(next, Some(utc(1, 9)));
    }

    #[test]
    fn test_forget_missed_finite_exhaustion() {
        let twice = Occurrence::times(2, Schedule::daily(9, 0));
        let resilience = Resilience::new(MissedRunPolicy::ForgetMissed);
        // 两次都已错过
        assert_eq!(
            resilience.next_run_time(&twice, false, 0, utc(1, 8), 0, utc(10, 0)),
            None
        );

        // 单条规则的首个候选不会被丢弃
        let once = Occurrence::once("once", Schedule::daily(9, 0));
        assert_eq!(
            resilience.next_run_time(&once, false, 0, utc(1, 8), 0, utc(10, 0)),
            Some(utc(1, 9))
        );
    }

    #[test]
    fn test_non_advancing_schedule_stops_walk() {
        let at = utc(2, 0);
        let occurrence = Occurrence::every(Schedule::at(at));
        for policy in [MissedRunPolicy::RunOnlyOnce, MissedRunPolicy::ForgetMissed] {
            assert_eq!(
                Resilience::new(policy).next_run_time(&occurrence, false, 0, utc(1, 0), 0, utc(9, 0)),
                Some(at)
            );
        }
    }

    #[test]
    fn test_exhausted_occurrence_yields_none() {
        let occurrence = Occurrence::immediate();
        let next = Resilience::default().next_run_time(&occurrence, false, 0, utc(1, 0), 1, utc(1, 0));
        assert_eq!(next, None);
    }

    #[test]
    fn test_failure_path() {
        let retry = Occurrence::times(2, Schedule::after(CalendarUnit::Minute, 5));
        let resilience = Resilience::default().with_failure(retry).unwrap();
        let anchor = utc(3, 10);
        let occurrence = daily_at_nine();

        let first = resilience.next_run_time(&occurrence, true, 1, anchor, 0, anchor);
        assert_eq!(first, Some(anchor + chrono::Duration::minutes(5)));
        let second = resilience.next_run_time(&occurrence, true, 2, anchor, 0, anchor);
        assert!(second.is_some());
        assert_eq!(resilience.next_run_time(&occurrence, true, 3, anchor, 0, anchor), None);
        assert_eq!(resilience.next_run_time(&occurrence, true, 0, anchor, 0, anchor), None);

        let no_retry = Resilience::default();
        assert_eq!(no_retry.next_run_time(&occurrence, true, 1, anchor, 0, anchor), None);
    }

    #[test]
    fn test_failure_occurrence_set_once() {
        let mut resilience = Resilience::default();
        resilience
            .set_failure_occurrence(Occurrence::immediate())
            .unwrap();
        let err = resilience
            .set_failure_occurrence(Occurrence::immediate())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }
}
