//! 任务调度：工具并发池
//!
//! 同一批次内自动放行的工具调用并发执行，用 Semaphore 限制同时运行的数量。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 工具并发调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 工具并发限制（默认 3）
    tool_semaphore: Arc<Semaphore>,
    max_concurrent_tools: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        let max = max_concurrent_tools.max(1);
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max)),
            max_concurrent_tools: max,
        }
    }

    /// 获取工具执行许可；信号量从不关闭
    pub async fn acquire_tool(&self) -> Option<OwnedSemaphorePermit> {
        self.tool_semaphore.clone().acquire_owned().await.ok()
    }

    pub fn max_concurrent_tools(&self) -> usize {
        self.max_concurrent_tools
    }

    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}
