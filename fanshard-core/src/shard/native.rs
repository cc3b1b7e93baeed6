use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Transaction of one backend partition.
///
/// A session owns exactly one of these; the same instance is handed out on
/// every call to [`NativeSession::transaction`], so state queries such as
/// [`was_committed`](NativeTransaction::was_committed) stay meaningful after
/// a coordinator drove it.
#[async_trait]
pub trait NativeTransaction: Send + Sync {
    async fn begin(&self) -> Result<(), BoxError>;

    async fn commit(&self) -> Result<(), BoxError>;

    async fn rollback(&self) -> Result<(), BoxError>;

    fn is_active(&self) -> bool;

    fn was_committed(&self) -> bool;

    /// Timeout in seconds applied to work done inside the transaction.
    fn set_timeout(&self, seconds: u32);
}

/// Live session (connection) to one backend partition.
#[async_trait]
pub trait NativeSession: Send + Sync {
    fn transaction(&self) -> Arc<dyn NativeTransaction>;

    async fn close(&self) -> Result<(), BoxError>;

    /// Access to the concrete session, for operations that know the backend.
    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn NativeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSession").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait NativeSessionFactory: Send + Sync {
    async fn open_session(&self) -> Result<Arc<dyn NativeSession>, BoxError>;
}
