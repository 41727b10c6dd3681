//! 调度规则与容错策略的属性测试

use chrono::{DateTime, Duration, TimeZone, Utc, Weekday};
use jobqueue_domain::{MissedRunPolicy, Occurrence, Resilience, Schedule};
use proptest::prelude::*;

fn arb_datetime() -> impl Strategy<Value = DateTime<Utc>> {
    // 2000-01-01 .. 2090-01-01
    (946_684_800i64..3_786_912_000i64).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
}

fn arb_weekday() -> impl Strategy<Value = Weekday> {
    (0u8..7).prop_map(|n| Weekday::try_from(n).unwrap())
}

fn arb_periodic_schedule() -> impl Strategy<Value = Schedule> {
    prop_oneof![
        (1u32..15, 0u32..60).prop_map(|(every, second)| Schedule::Minutely { every, second }),
        (1u32..6, 0u32..60).prop_map(|(every, minute)| Schedule::Hourly { every, minute }),
        (1u32..4, 0u32..24, 0u32..60).prop_map(|(every, hour, minute)| Schedule::Daily {
            every,
            hour,
            minute
        }),
        (1u32..3, arb_weekday(), 0u32..24, 0u32..60).prop_map(|(every, weekday, hour, minute)| {
            Schedule::Weekly {
                every,
                weekday,
                hour,
                minute,
            }
        }),
        (1u32..4, 1u32..32, 0u32..24, 0u32..60).prop_map(|(every, day, hour, minute)| {
            Schedule::Monthly {
                every,
                day,
                hour,
                minute,
            }
        }),
        (1u32..3, 1u32..13, 1u32..32, 0u32..24).prop_map(|(every, month, day, hour)| {
            Schedule::Yearly {
                every,
                month,
                day,
                hour,
                minute: 0,
            }
        }),
    ]
}

/// 分钟级规则下补偿遍历的步数可控
fn arb_missed_window() -> impl Strategy<Value = i64> {
    0i64..(3 * 24 * 3600)
}

proptest! {
    #[test]
    fn next_run_time_is_deterministic(schedule in arb_periodic_schedule(), t in arb_datetime()) {
        prop_assert_eq!(schedule.next_run_time(t), schedule.next_run_time(t));
    }

    #[test]
    fn periodic_next_run_time_is_strictly_increasing(
        schedule in arb_periodic_schedule(),
        t in arb_datetime(),
    ) {
        let first = schedule.next_run_time(t).unwrap();
        prop_assert!(first > t);
        let second = schedule.next_run_time(first).unwrap();
        prop_assert!(second > first);
    }

    #[test]
    fn run_only_once_yields_at_most_one_catch_up(
        schedule in arb_periodic_schedule(),
        anchor in arb_datetime(),
        missed in arb_missed_window(),
    ) {
        let occurrence = Occurrence::every(schedule.clone());
        let now = anchor + Duration::seconds(missed);
        let next = Resilience::new(MissedRunPolicy::RunOnlyOnce)
            .next_run_time(&occurrence, false, 0, anchor, 0, now)
            .unwrap();

        if next <= now {
            // 补跑之后的下一次必须已在未来
            prop_assert!(schedule.next_run_time(next).unwrap() > now);
        }
    }

    #[test]
    fn catch_up_replays_missed_runs_in_order(
        schedule in arb_periodic_schedule(),
        anchor in arb_datetime(),
        missed in arb_missed_window(),
    ) {
        let occurrence = Occurrence::every(schedule.clone());
        let resilience = Resilience::new(MissedRunPolicy::CatchUp);
        let now = anchor + Duration::seconds(missed);

        let mut previous = anchor;
        for run_count in 0..5u32 {
            let next = resilience
                .next_run_time(&occurrence, false, 0, previous, run_count, now)
                .unwrap();
            prop_assert_eq!(Some(next), schedule.next_run_time(previous));
            prop_assert!(next > previous);
            previous = next;
        }
    }

    #[test]
    fn forget_missed_never_yields_past_time(
        schedule in arb_periodic_schedule(),
        anchor in arb_datetime(),
        missed in arb_missed_window(),
    ) {
        let occurrence = Occurrence::every(schedule);
        let now = anchor + Duration::seconds(missed);
        let next = Resilience::new(MissedRunPolicy::ForgetMissed)
            .next_run_time(&occurrence, false, 0, anchor, 0, now)
            .unwrap();
        prop_assert!(next > now);
    }

    #[test]
    fn failure_schedule_is_exhausted_after_its_length(
        retries in 1usize..5,
        anchor in arb_datetime(),
    ) {
        let retry = Occurrence::times(retries, Schedule::after(jobqueue_domain::CalendarUnit::Second, 10));
        let resilience = Resilience::default().with_failure(retry).unwrap();
        let occurrence = Occurrence::immediate();

        for attempt in 1..=retries as u32 {
            prop_assert!(resilience.next_run_time(&occurrence, true, attempt, anchor, 0, anchor).is_some());
        }
        prop_assert!(resilience
            .next_run_time(&occurrence, true, retries as u32 + 1, anchor, 0, anchor)
            .is_none());
    }
}
