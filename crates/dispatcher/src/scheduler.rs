//! 停放作业的唤醒调度
//!
//! 所有停放的作业按唤醒时间登记在一张表中，由一个按需启动的等待任务在到期时
//! 把作业键批量交给协调器。表为空时等待任务退出，下次停放时重新启动。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobqueue_domain::ProcessKey;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Default)]
struct TimeTable {
    wake_by_key: HashMap<ProcessKey, DateTime<Utc>>,
    keys_by_time: BTreeMap<DateTime<Utc>, BTreeSet<ProcessKey>>,
    waiter_running: bool,
}

impl TimeTable {
    fn insert(&mut self, key: ProcessKey, at: DateTime<Utc>) {
        self.remove(&key);
        self.keys_by_time.entry(at).or_default().insert(key.clone());
        self.wake_by_key.insert(key, at);
    }

    fn remove(&mut self, key: &ProcessKey) -> bool {
        let Some(at) = self.wake_by_key.remove(key) else {
            return false;
        };
        self.remove_time_entry(key, at);
        true
    }

    fn remove_time_entry(&mut self, key: &ProcessKey, at: DateTime<Utc>) {
        if let Some(keys) = self.keys_by_time.get_mut(&at) {
            keys.remove(key);
            if keys.is_empty() {
                self.keys_by_time.remove(&at);
            }
        }
    }

    /// 取出所有到期的键；它们仍然保持停放，直到被唤醒检查移除
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<ProcessKey> {
        let mut due = Vec::new();
        while let Some(entry) = self.keys_by_time.first_entry() {
            if *entry.key() > now {
                break;
            }
            due.extend(entry.remove());
        }
        due
    }
}

pub struct ProcessScheduler {
    table: Mutex<TimeTable>,
    notify: Notify,
    max_sleep: Duration,
    sink: mpsc::UnboundedSender<Vec<ProcessKey>>,
    shutdown: CancellationToken,
}

impl ProcessScheduler {
    pub fn new(
        max_sleep: Duration,
        sink: mpsc::UnboundedSender<Vec<ProcessKey>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(TimeTable::default()),
            notify: Notify::new(),
            max_sleep,
            sink,
            shutdown,
        })
    }

    /// 停放作业直到 `at`，已停放的作业改为新的唤醒时间
    pub fn park(self: &Arc<Self>, key: ProcessKey, at: DateTime<Utc>) {
        let spawn_waiter = {
            let mut table = self.table.lock();
            table.insert(key, at);
            if table.waiter_running {
                false
            } else {
                table.waiter_running = true;
                true
            }
        };

        if spawn_waiter {
            if self.shutdown.is_cancelled() {
                self.table.lock().waiter_running = false;
                return;
            }
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run_waiter().await });
        } else {
            self.notify.notify_one();
        }
    }

    pub fn unschedule(&self, key: &ProcessKey) -> bool {
        self.table.lock().remove(key)
    }

    /// 只调整仍在停放中的作业
    pub fn snooze(self: &Arc<Self>, key: &ProcessKey, at: DateTime<Utc>) -> bool {
        if !self.is_parked(key) {
            return false;
        }
        self.park(key.clone(), at);
        true
    }

    pub fn wake_now(self: &Arc<Self>, key: &ProcessKey) -> bool {
        self.snooze(key, Utc::now())
    }

    pub fn is_parked(&self, key: &ProcessKey) -> bool {
        self.table.lock().wake_by_key.contains_key(key)
    }

    pub fn wake_time(&self, key: &ProcessKey) -> Option<DateTime<Utc>> {
        self.table.lock().wake_by_key.get(key).copied()
    }

    pub fn parked_keys(&self) -> Vec<ProcessKey> {
        let mut keys: Vec<ProcessKey> = self.table.lock().wake_by_key.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn parked_count(&self) -> usize {
        self.table.lock().wake_by_key.len()
    }

    async fn run_waiter(self: Arc<Self>) {
        trace!("唤醒等待任务启动");
        loop {
            let (due, next_wake) = {
                let mut table = self.table.lock();
                let due = table.take_due(Utc::now());
                let next_wake = table.keys_by_time.keys().next().copied();
                if next_wake.is_none() {
                    table.waiter_running = false;
                }
                (due, next_wake)
            };

            if !due.is_empty() {
                trace!("{} 个作业到期", due.len());
                if self.sink.send(due).is_err() {
                    debug!("协调器已关闭，唤醒等待任务退出");
                    self.table.lock().waiter_running = false;
                    return;
                }
            }

            let Some(next_wake) = next_wake else {
                trace!("没有停放的作业，唤醒等待任务退出");
                return;
            };

            let wait = (next_wake - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_sleep);
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.table.lock().waiter_running = false;
                    debug!("唤醒等待任务收到关闭信号");
                    return;
                }
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn key(id: i64) -> ProcessKey {
        ProcessKey {
            created_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            name: format!("job-{id}"),
            id,
        }
    }

    fn scheduler() -> (Arc<ProcessScheduler>, mpsc::UnboundedReceiver<Vec<ProcessKey>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ProcessScheduler::new(Duration::from_secs(60), tx, CancellationToken::new()),
            rx,
        )
    }

    #[test]
    fn test_time_table_moves_entries() {
        let mut table = TimeTable::default();
        let now = Utc::now();
        table.insert(key(1), now);
        table.insert(key(1), now + ChronoDuration::seconds(10));
        assert_eq!(table.wake_by_key.len(), 1);
        assert_eq!(table.keys_by_time.len(), 1);

        assert!(table.take_due(now).is_empty());
        let due = table.take_due(now + ChronoDuration::seconds(10));
        assert_eq!(due, vec![key(1)]);
        assert!(table.keys_by_time.is_empty());
        assert!(table.wake_by_key.contains_key(&key(1)));
        assert!(table.remove(&key(1)));
        assert!(!table.remove(&key(1)));
    }

    #[tokio::test]
    async fn test_due_keys_delivered_in_order() {
        let (scheduler, mut rx) = scheduler();
        let past = Utc::now() - ChronoDuration::seconds(1);
        scheduler.park(key(2), past);
        scheduler.park(key(1), past);

        let mut delivered = Vec::new();
        while delivered.len() < 2 {
            delivered.extend(rx.recv().await.unwrap());
        }
        delivered.sort();
        assert_eq!(delivered, vec![key(1), key(2)]);
        assert!(scheduler.is_parked(&key(1)));
        assert_eq!(scheduler.parked_count(), 2);
    }

    #[tokio::test]
    async fn test_snooze_and_wake_now() {
        let (scheduler, mut rx) = scheduler();
        let later = Utc::now() + ChronoDuration::hours(1);
        assert!(!scheduler.snooze(&key(1), later));

        scheduler.park(key(1), later);
        assert_eq!(scheduler.wake_time(&key(1)), Some(later));
        assert!(scheduler.wake_now(&key(1)));

        let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, vec![key(1)]);

        assert!(scheduler.unschedule(&key(1)));
        assert!(scheduler.parked_keys().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_exits_on_shutdown() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let scheduler = ProcessScheduler::new(Duration::from_secs(60), tx, shutdown.clone());
        scheduler.park(key(1), Utc::now() + ChronoDuration::hours(1));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.table.lock().waiter_running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
