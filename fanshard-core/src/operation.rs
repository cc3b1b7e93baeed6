use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::BoxError;
use crate::shard::ShardRef;

/// Unit of work run against a single shard.
///
/// Implementations must be safe to call concurrently on distinct shards and
/// must not depend on which other shards take part in the same call.
#[async_trait]
pub trait ShardOperation<T>: Send + Sync {
    async fn execute(&self, shard: &ShardRef) -> Result<Option<T>, BoxError>;

    fn operation_name(&self) -> &str;
}

/// [`ShardOperation`] backed by a closure returning a boxed future.
pub struct FnShardOperation<T, F> {
    name: String,
    func: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnShardOperation<T, F>
where
    F: Fn(ShardRef) -> BoxFuture<'static, Result<Option<T>, BoxError>>
        + Send
        + Sync,
{
    pub fn new<N: Into<String>>(name: N, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> ShardOperation<T> for FnShardOperation<T, F>
where
    T: Send + 'static,
    F: Fn(ShardRef) -> BoxFuture<'static, Result<Option<T>, BoxError>>
        + Send
        + Sync,
{
    async fn execute(&self, shard: &ShardRef) -> Result<Option<T>, BoxError> {
        (self.func)(shard.clone()).await
    }

    fn operation_name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a shareable operation.
///
/// ```ignore
/// let op = operation("count", |shard| async move {
///     let session = shard.establish_session().await?;
///     Ok(Some(count_rows(&session)?))
/// });
/// ```
pub fn operation<T, F, Fut>(
    name: &str,
    func: F,
) -> Arc<dyn ShardOperation<T>>
where
    T: Send + 'static,
    F: Fn(ShardRef) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<T>, BoxError>> + Send + 'static,
{
    let boxed = move |shard: ShardRef| -> BoxFuture<
        'static,
        Result<Option<T>, BoxError>,
    > { Box::pin(func(shard)) };
    Arc::new(FnShardOperation::new(name, boxed))
}
