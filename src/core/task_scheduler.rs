//! 任务调度：有界工作池
//!
//! 使用 Semaphore 限制同时执行的评测任务数（默认 3）；状态管理器要求串行时宽度固定为 1。

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// 任务调度器
#[derive(Clone, Debug)]
pub struct TaskScheduler {
    semaphore: Arc<Semaphore>,
    width: usize,
}

impl TaskScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        let width = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// 串行调度（共享单一自动化会话时使用）
    pub fn sequential() -> Self {
        Self::new(1)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// 获取执行许可；信号量被关闭时返回 None
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// 以有界并发执行一组任务，结果按输入顺序返回。
    /// 取消后尚未开始的任务不再启动（已开始的任务自行感知取消令牌）。
    pub async fn run_all<T, F, Fut>(
        &self,
        items: Vec<T>,
        cancel: &CancellationToken,
        job: F,
    ) -> Vec<Fut::Output>
    where
        F: Fn(T) -> Fut,
        Fut: Future,
    {
        let mut pending = FuturesUnordered::new();
        for (index, item) in items.into_iter().enumerate() {
            let scheduler = self.clone();
            let cancel = cancel.clone();
            let fut = job(item);
            pending.push(async move {
                let _permit = scheduler.acquire().await;
                if cancel.is_cancelled() {
                    return (index, None);
                }
                (index, Some(fut.await))
            });
        }

        let mut results = Vec::new();
        while let Some((index, output)) = pending.next().await {
            if let Some(output) = output {
                results.push((index, output));
            }
        }
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, output)| output).collect()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_all_respects_width_and_order() {
        let scheduler = TaskScheduler::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();

        let out = scheduler
            .run_all((0..6).collect(), &token, |i: u32| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i * 10
                }
            })
            .await;

        assert_eq!(out, vec![0, 10, 20, 30, 40, 50]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_skips_jobs() {
        let scheduler = TaskScheduler::sequential();
        let token = CancellationToken::new();
        token.cancel();
        let out = scheduler
            .run_all(vec![1, 2, 3], &token, |i: u32| async move { i })
            .await;
        assert!(out.is_empty());
        assert_eq!(scheduler.width(), 1);
    }

    #[test]
    fn test_zero_width_clamped() {
        assert_eq!(TaskScheduler::new(0).width(), 1);
        assert_eq!(TaskScheduler::default().width(), 3);
    }
}
