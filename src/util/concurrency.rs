use futures::StreamExt;
use std::future::Future;

/// 以固定并发上限执行一组任务，结果按输入顺序返回。
pub async fn gather_limited<F, Fut, T>(factories: Vec<F>, max_concurrency: usize) -> Vec<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    futures::stream::iter(factories.into_iter().map(|f| f()))
        .buffered(max_concurrency.max(1))
        .collect()
        .await
}
