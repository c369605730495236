//! The unit of work threaded through record, lifecycle, and outbox writes so
//! a business mutation, its lifecycle rows, and its audit outbox row commit
//! or roll back together.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

type UndoFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One in-flight memory transaction. Memory stores apply writes immediately
/// and register an undo action here; rollback replays the undos in reverse.
#[derive(Default)]
pub struct MemoryTxn {
    undo: Vec<Box<dyn FnOnce() -> UndoFuture + Send>>,
}

impl MemoryTxn {
    pub(crate) fn push_undo<F, Fut>(&mut self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.undo.push(Box::new(move || Box::pin(f())));
    }
}

/// A backend transaction handle. Store write methods take `&mut TxnHandle`
/// and unwrap the variant for their backend; mixing backends is an error.
pub enum TxnHandle {
    Memory(MemoryTxn),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

impl TxnHandle {
    pub(crate) fn memory(&mut self) -> Result<&mut MemoryTxn> {
        match self {
            TxnHandle::Memory(txn) => Ok(txn),
            #[cfg(feature = "postgres")]
            TxnHandle::Postgres(_) => {
                Err(anyhow!("memory store called with a postgres transaction"))
            }
        }
    }

    #[cfg(feature = "postgres")]
    pub(crate) fn postgres(&mut self) -> Result<&mut sqlx::Transaction<'static, sqlx::Postgres>> {
        match self {
            TxnHandle::Postgres(txn) => Ok(txn),
            TxnHandle::Memory(_) => {
                Err(anyhow!("postgres store called with a memory transaction"))
            }
        }
    }
}

/// Opens, commits, and rolls back transactions for one backend.
#[async_trait]
pub trait TxnManager: Send + Sync {
    async fn begin(&self) -> Result<TxnHandle>;
    async fn commit(&self, txn: TxnHandle) -> Result<()>;
    async fn rollback(&self, txn: TxnHandle) -> Result<()>;
}

/// Roll back after a failed write, warning instead of masking the original
/// error.
pub async fn rollback_or_warn(manager: &dyn TxnManager, txn: TxnHandle) {
    if let Err(e) = manager.rollback(txn).await {
        tracing::warn!(error = %e, "transaction rollback failed");
    }
}

/// Transaction manager for the in-memory backend. Commit drops the undo log;
/// rollback replays it newest-first.
pub struct MemoryTxnManager;

#[async_trait]
impl TxnManager for MemoryTxnManager {
    async fn begin(&self) -> Result<TxnHandle> {
        Ok(TxnHandle::Memory(MemoryTxn::default()))
    }

    async fn commit(&self, txn: TxnHandle) -> Result<()> {
        match txn {
            TxnHandle::Memory(_) => Ok(()),
            #[cfg(feature = "postgres")]
            TxnHandle::Postgres(_) => {
                Err(anyhow!("postgres transaction passed to the memory manager"))
            }
        }
    }

    async fn rollback(&self, txn: TxnHandle) -> Result<()> {
        match txn {
            TxnHandle::Memory(mut inner) => {
                for undo in inner.undo.drain(..).rev() {
                    undo().await;
                }
                Ok(())
            }
            #[cfg(feature = "postgres")]
            TxnHandle::Postgres(_) => {
                Err(anyhow!("postgres transaction passed to the memory manager"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    #[tokio::test]
    async fn rollback_replays_undos_in_reverse() {
        let log: Arc<RwLock<Vec<&'static str>>> = Arc::new(RwLock::new(Vec::new()));
        let manager = MemoryTxnManager;
        let mut txn = manager.begin().await.unwrap();

        for name in ["first", "second"] {
            let log = log.clone();
            txn.memory().unwrap().push_undo(move || async move {
                log.write().await.push(name);
            });
        }

        manager.rollback(txn).await.unwrap();
        assert_eq!(*log.read().await, vec!["second", "first"]);
    }

    #[tokio::test]
    async fn commit_discards_undos() {
        let log: Arc<RwLock<Vec<&'static str>>> = Arc::new(RwLock::new(Vec::new()));
        let manager = MemoryTxnManager;
        let mut txn = manager.begin().await.unwrap();

        let entry = log.clone();
        txn.memory().unwrap().push_undo(move || async move {
            entry.write().await.push("undone");
        });

        manager.commit(txn).await.unwrap();
        assert!(log.read().await.is_empty());
    }
}
