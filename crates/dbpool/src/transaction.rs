use crate::error::DbError;
use crate::query::{Query, QueryHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committing,
    Committed,
    RolledBack,
    Failed,
}

pub(crate) enum TxCmd {
    Query(Query),
    Commit(oneshot::Sender<Result<(), DbError>>),
    Rollback(oneshot::Sender<Result<(), DbError>>),
}

struct TxInner {
    status: TxStatus,
    error: Option<DbError>,
}

pub(crate) struct TxShared {
    state: Mutex<TxInner>,
}

impl TxShared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TxInner {
                status: TxStatus::Active,
                error: None,
            }),
        }
    }

    pub(crate) fn status(&self) -> TxStatus {
        self.state.lock().status
    }

    pub(crate) fn set_status(&self, status: TxStatus) {
        self.state.lock().status = status;
    }

    /// Record a fatal error. The first error wins; later failures on the
    /// same transaction do not replace it.
    pub(crate) fn set_failed(&self, err: DbError) {
        let mut st = self.state.lock();
        st.status = TxStatus::Failed;
        st.error.get_or_insert(err);
    }

    pub(crate) fn error(&self) -> Option<DbError> {
        self.state.lock().error.clone()
    }
}

pub(crate) struct TxLease {
    pub(crate) sender: mpsc::UnboundedSender<TxCmd>,
    pub(crate) shared: Arc<TxShared>,
}

/// A logically ordered sequence of queries on one dedicated handle.
///
/// Queries are buffered by [`Transaction::enqueue`] and flushed to the
/// handle by [`Transaction::execute`]; [`Transaction::commit`] and
/// [`Transaction::rollback`] flush and then resolve the transaction.
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    sender: mpsc::UnboundedSender<TxCmd>,
    shared: Arc<TxShared>,
    pending: Vec<Query>,
    terminal: bool,
}

impl Transaction {
    pub(crate) fn new(lease: TxLease) -> Self {
        Self {
            sender: lease.sender,
            shared: lease.shared,
            pending: Vec::new(),
            terminal: false,
        }
    }

    pub fn enqueue(&mut self, mut q: Query) -> QueryHandle {
        let handle = q.make_handle();
        self.pending.push(q);
        handle
    }

    /// Flush enqueued queries to the handle, in order.
    pub fn execute(&mut self) {
        for q in self.pending.drain(..) {
            // If the handle is gone the query's completion channel drops
            // and waiters observe PoolClosed.
            let _ = self.sender.send(TxCmd::Query(q));
        }
    }

    pub fn begin_savepoint(&mut self, name: &str) -> QueryHandle {
        self.enqueue(Query::new(format!("savepoint {name}")))
    }

    pub fn rollback_to(&mut self, name: &str) -> QueryHandle {
        self.enqueue(Query::new(format!("rollback to {name}")))
    }

    pub async fn commit(mut self) -> Result<(), DbError> {
        self.execute();
        self.terminal = true;
        let (reply, rx) = oneshot::channel();
        if self.sender.send(TxCmd::Commit(reply)).is_err() {
            return Err(DbError::PoolClosed);
        }
        rx.await.map_err(|_| DbError::PoolClosed)?
    }

    pub async fn rollback(mut self) -> Result<(), DbError> {
        self.execute();
        self.terminal = true;
        let (reply, rx) = oneshot::channel();
        if self.sender.send(TxCmd::Rollback(reply)).is_err() {
            return Err(DbError::PoolClosed);
        }
        rx.await.map_err(|_| DbError::PoolClosed)?
    }

    pub fn status(&self) -> TxStatus {
        self.shared.status()
    }

    /// True once the transaction has reached a terminal state.
    pub fn done(&self) -> bool {
        matches!(
            self.status(),
            TxStatus::Committed | TxStatus::RolledBack | TxStatus::Failed
        )
    }

    /// True when a query failed and was not recovered, or commit failed.
    pub fn failed(&self) -> bool {
        self.status() == TxStatus::Failed
    }

    /// The first fatal error, if any.
    pub fn error(&self) -> Option<DbError> {
        self.shared.error()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.terminal {
            let (reply, _rx) = oneshot::channel();
            let _ = self.sender.send(TxCmd::Rollback(reply));
        }
    }
}
