use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{SchedulerError, SchedulerResult};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::EngineContext;
use crate::server::ProcessServer;

/// 按队列所有者划分的服务器表，首次访问时创建服务器并加载持久化作业
pub struct ProcessServerRegistry {
    context: Arc<EngineContext>,
    servers: Mutex<HashMap<String, Arc<ProcessServer>>>,
}

impl ProcessServerRegistry {
    pub fn new(context: Arc<EngineContext>) -> Self {
        Self {
            context,
            servers: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub async fn server(&self, owner: &str) -> SchedulerResult<Arc<ProcessServer>> {
        if self.context.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        let mut servers = self.servers.lock().await;
        if let Some(server) = servers.get(owner) {
            return Ok(server.clone());
        }

        let server = ProcessServer::new(owner, self.context.clone());
        if let Err(e) = server.init().await {
            warn!("作业服务器 {} 初始化失败: {}", owner, e);
            server.shutdown_token().cancel();
            return Err(e);
        }
        info!("作业服务器 {} 已启动", owner);
        servers.insert(owner.to_string(), server.clone());
        Ok(server)
    }

    pub async fn existing(&self, owner: &str) -> Option<Arc<ProcessServer>> {
        self.servers.lock().await.get(owner).cloned()
    }

    pub async fn servers(&self) -> Vec<Arc<ProcessServer>> {
        let mut servers: Vec<Arc<ProcessServer>> =
            self.servers.lock().await.values().cloned().collect();
        servers.sort_by(|a, b| a.owner().cmp(b.owner()));
        servers
    }

    /// 关闭所有服务器，任一服务器超时返回 false；之后不再创建新服务器
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.context.shutdown.cancel();
        let servers = self.servers().await;
        let mut finished = true;
        for server in servers {
            finished &= server.shutdown(timeout).await;
        }
        finished
    }
}
