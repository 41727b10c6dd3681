//! 唤醒协调器
//!
//! 每个服务器一个协调任务，串行处理到期或被通知的作业键，同一时刻只有一轮
//! 唤醒检查在进行。处理期间新到达的键在下一轮合并处理。

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Instant;

use futures::FutureExt;
use jobqueue_domain::ProcessKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::server::ProcessServer;

pub struct UnparkCoordinator {
    sender: mpsc::UnboundedSender<Vec<ProcessKey>>,
}

impl UnparkCoordinator {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Vec<ProcessKey>>) -> Self {
        Self { sender }
    }

    pub(crate) fn notify(&self, keys: Vec<ProcessKey>) {
        if self.sender.send(keys).is_err() {
            trace!("协调器已停止，忽略唤醒通知");
        }
    }

    pub(crate) fn spawn(
        server: Weak<ProcessServer>,
        receiver: mpsc::UnboundedReceiver<Vec<ProcessKey>>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::run(server, receiver, shutdown))
    }

    async fn run(
        server: Weak<ProcessServer>,
        mut receiver: mpsc::UnboundedReceiver<Vec<ProcessKey>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let first = tokio::select! {
                _ = shutdown.cancelled() => break,
                keys = receiver.recv() => keys,
            };
            let Some(first) = first else {
                break;
            };

            let mut pending: BTreeSet<ProcessKey> = first.into_iter().collect();
            while let Ok(more) = receiver.try_recv() {
                pending.extend(more);
            }

            let Some(server) = server.upgrade() else {
                break;
            };
            let started = Instant::now();
            let count = pending.len();
            if AssertUnwindSafe(server.unpark_cycle(pending))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("作业服务器 {} 唤醒检查时发生panic", server.owner());
            }
            let elapsed = started.elapsed();
            server
                .context()
                .metrics
                .record_unpark_cycle(elapsed.as_secs_f64());
            trace!("唤醒检查完成: {} 个作业, 耗时 {:?}", count, elapsed);
        }
        debug!("唤醒协调器退出");
    }
}
