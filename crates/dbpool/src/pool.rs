use crate::backend::{Connector, PgConnector};
use crate::config::DbConfig;
use crate::error::DbError;
use crate::handle::handle_task;
use crate::query::{Query, QueryHandle};
use crate::transaction::{Transaction, TxCmd, TxLease, TxShared};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

lazy_static::lazy_static! {
    static ref QUERY_QUEUE_LENGTH: prometheus::IntGauge = prometheus::register_int_gauge!(
        "query_queue_length",
        "number of queries waiting for a database handle"
    ).unwrap();
    static ref ACTIVE_DB_CONNECTIONS: prometheus::IntGauge = prometheus::register_int_gauge!(
        "active_db_connections",
        "number of database handles currently doing work"
    ).unwrap();
}

/// How long a handle singled out for shrinking may sit idle before it
/// retires.
const SHRINK_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleState {
    Idle,
    Busy,
    InTransaction,
    FailedTransaction,
}

impl HandleState {
    fn is_busy(self) -> bool {
        !matches!(self, HandleState::Idle)
    }
}

pub(crate) enum HandleCmd {
    Run(Query),
    StartTx {
        cmds: mpsc::UnboundedReceiver<TxCmd>,
        shared: Arc<TxShared>,
    },
    /// Arm an idle deadline; the handle retires if still idle when it
    /// fires. Used by the shrink policy.
    RetireIfIdleAfter(Duration),
    Retire,
}

pub(crate) enum Work {
    Query(Query),
    Transaction(oneshot::Sender<Result<TxLease, DbError>>),
}

impl Work {
    fn fail(self, err: DbError) {
        match self {
            Work::Query(mut q) => q.complete(Err(err)),
            Work::Transaction(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct HandleEntry {
    id: u64,
    state: HandleState,
    sender: mpsc::UnboundedSender<HandleCmd>,
}

struct PoolState {
    queue: VecDeque<Work>,
    handles: Vec<HandleEntry>,
    connecting: usize,
    last_created: Option<Instant>,
    next_id: u64,
    closed: bool,
}

pub(crate) struct PoolInner {
    pub(crate) config: DbConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
}

/// The shared pool of database handles and the FIFO queue of submitted
/// work. Cheap to clone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Validate the configuration and start the initial set of handles.
    /// Must be called within a tokio runtime.
    pub fn new(config: DbConfig, connector: Arc<dyn Connector>) -> Result<Self, DbError> {
        config.validate_backend()?;
        let inner = Arc::new(PoolInner {
            config,
            connector,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                handles: Vec::new(),
                connecting: 0,
                last_created: None,
                next_id: 1,
                closed: false,
            }),
        });
        let pool = Self { inner };
        for _ in 0..pool.inner.config.start_handles {
            pool.inner.spawn_handle();
        }
        Ok(pool)
    }

    /// Connect to PostgreSQL with the given configuration.
    pub fn connect(config: DbConfig) -> Result<Self, DbError> {
        let connector = Arc::new(PgConnector::new(&config));
        Self::new(config, connector)
    }

    /// Append `q` to the queue of submitted work. The first available
    /// handle will process it, in autocommit mode.
    pub fn submit(&self, mut q: Query) -> QueryHandle {
        let handle = q.make_handle();
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                drop(st);
                q.complete(Err(DbError::PoolClosed));
                return handle;
            }
            st.queue.push_back(Work::Query(q));
        }
        self.inner.run_queue();
        handle
    }

    /// Submit several queries, preserving queue order. Execution order
    /// across handles is not guaranteed; use a [`Transaction`] for that.
    pub fn submit_batch(&self, queries: Vec<Query>) -> Vec<QueryHandle> {
        let mut handles = Vec::with_capacity(queries.len());
        {
            let mut st = self.inner.state.lock();
            for mut q in queries {
                handles.push(q.make_handle());
                if st.closed {
                    q.complete(Err(DbError::PoolClosed));
                } else {
                    st.queue.push_back(Work::Query(q));
                }
            }
        }
        self.inner.run_queue();
        handles
    }

    /// Acquire a dedicated handle and open a transaction on it. The
    /// request waits in the same FIFO as ordinary queries.
    pub async fn transaction(&self) -> Result<Transaction, DbError> {
        let (reply, rx) = oneshot::channel();
        {
            let mut st = self.inner.state.lock();
            if st.closed {
                return Err(DbError::PoolClosed);
            }
            st.queue.push_back(Work::Transaction(reply));
        }
        self.inner.run_queue();
        let lease = rx.await.map_err(|_| DbError::PoolClosed)??;
        Ok(Transaction::new(lease))
    }

    /// Handles currently connected (excludes ones still connecting).
    pub fn num_handles(&self) -> usize {
        self.inner.state.lock().handles.len()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Stop accepting work, fail anything still queued and retire every
    /// handle.
    pub fn shutdown(&self) {
        let (queued, senders) = {
            let mut st = self.inner.state.lock();
            st.closed = true;
            let queued: Vec<Work> = st.queue.drain(..).collect();
            let senders: Vec<_> = st.handles.iter().map(|h| h.sender.clone()).collect();
            (queued, senders)
        };
        for work in queued {
            work.fail(DbError::PoolClosed);
        }
        for sender in senders {
            let _ = sender.send(HandleCmd::Retire);
        }
    }
}

impl PoolInner {
    pub(crate) fn spawn_handle(self: &Arc<Self>) {
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.connecting += 1;
            st.last_created = Some(Instant::now());
        }
        let inner = self.clone();
        tokio::spawn(async move {
            match inner.connector.connect().await {
                Ok(backend) => {
                    let (sender, rx) = mpsc::unbounded_channel();
                    let id;
                    {
                        let mut st = inner.state.lock();
                        st.connecting -= 1;
                        if st.closed {
                            return;
                        }
                        id = st.next_id;
                        st.next_id += 1;
                        st.handles.push(HandleEntry {
                            id,
                            state: HandleState::Idle,
                            sender,
                        });
                    }
                    tracing::debug!("database handle {id} connected");
                    inner.run_queue();
                    handle_task(&inner, id, backend, rx).await;
                    if inner.remove_entry(id) {
                        inner.check_starvation();
                    }
                }
                Err(err) => {
                    tracing::error!("database handle connection failed: {err}");
                    {
                        let mut st = inner.state.lock();
                        st.connecting -= 1;
                    }
                    inner.check_starvation();
                }
            }
        });
    }

    /// Give each idle handle one queue-head item, then apply the
    /// grow/shrink policy. Mirrors the behavior the store has always had:
    /// grow only when the head is stuck, at most one new handle per
    /// interval; shrink one idle handle when a dispatch drains the queue
    /// on TCP transports.
    pub(crate) fn run_queue(self: &Arc<Self>) {
        let mut spawn_new = false;
        let mut shrink_target = None;
        {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }

            let mut dispatched = 0usize;
            loop {
                if st.queue.is_empty() {
                    break;
                }
                let Some(pos) = st
                    .handles
                    .iter()
                    .position(|h| h.state == HandleState::Idle)
                else {
                    break;
                };
                let work = st.queue.pop_front().unwrap();
                match work {
                    Work::Query(q) => {
                        st.handles[pos].state = HandleState::Busy;
                        if let Err(send_err) = st.handles[pos].sender.send(HandleCmd::Run(q)) {
                            // Task is gone; drop the entry and put the
                            // query back at the head of the queue.
                            let id = st.handles[pos].id;
                            st.handles.retain(|h| h.id != id);
                            if let HandleCmd::Run(q) = send_err.0 {
                                st.queue.push_front(Work::Query(q));
                            }
                            continue;
                        }
                    }
                    Work::Transaction(reply) => {
                        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                        let shared = Arc::new(TxShared::new());
                        let lease = TxLease {
                            sender: cmd_tx,
                            shared: shared.clone(),
                        };
                        if reply.send(Ok(lease)).is_err() {
                            // Requester gave up while queued.
                            continue;
                        }
                        st.handles[pos].state = HandleState::InTransaction;
                        if st.handles[pos]
                            .sender
                            .send(HandleCmd::StartTx {
                                cmds: cmd_rx,
                                shared,
                            })
                            .is_err()
                        {
                            let id = st.handles[pos].id;
                            st.handles.retain(|h| h.id != id);
                            continue;
                        }
                    }
                }
                dispatched += 1;
            }

            let busy = st.handles.iter().filter(|h| h.state.is_busy()).count();
            QUERY_QUEUE_LENGTH.set(st.queue.len() as i64);
            ACTIVE_DB_CONNECTIONS.set(busy as i64);

            if dispatched > 0 && st.queue.is_empty() && !self.config.is_unix() {
                // We dispatched the entire queue; nudge one idle handle
                // toward retirement so the pool shrinks under light load.
                shrink_target = st
                    .handles
                    .iter()
                    .find(|h| h.state == HandleState::Idle)
                    .map(|h| h.sender.clone());
            }

            if dispatched == 0
                && !st.queue.is_empty()
                && st.connecting == 0
                && st.handles.len() < self.config.max_handles
            {
                let interval = Duration::from_secs(self.config.handle_interval);
                let interval_ok = st.handles.is_empty()
                    || st
                        .last_created
                        .map(|t| t.elapsed() >= interval)
                        .unwrap_or(true);
                if interval_ok {
                    spawn_new = true;
                }
            }
        }

        if let Some(sender) = shrink_target {
            let _ = sender.send(HandleCmd::RetireIfIdleAfter(SHRINK_IDLE_TIMEOUT));
        }
        if spawn_new {
            self.spawn_handle();
        }
    }

    pub(crate) fn set_handle_state(&self, id: u64, state: HandleState) {
        let mut st = self.state.lock();
        if let Some(h) = st.handles.iter_mut().find(|h| h.id == id) {
            h.state = state;
        }
    }

    /// Retire `id` if it is still idle. Returns true when the entry was
    /// removed, in which case the caller's task exits.
    pub(crate) fn try_retire(self: &Arc<Self>, id: u64) -> bool {
        let removed = {
            let mut st = self.state.lock();
            match st.handles.iter().position(|h| h.id == id) {
                Some(pos) if st.handles[pos].state == HandleState::Idle => {
                    st.handles.remove(pos);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.check_starvation();
        }
        removed
    }

    fn remove_entry(&self, id: u64) -> bool {
        let mut st = self.state.lock();
        let before = st.handles.len();
        st.handles.retain(|h| h.id != id);
        st.handles.len() != before
    }

    /// When the last handle is gone and nothing is connecting, every
    /// queued item fails immediately rather than waiting forever.
    pub(crate) fn check_starvation(&self) {
        let stranded = {
            let mut st = self.state.lock();
            if st.handles.is_empty() && st.connecting == 0 && !st.queue.is_empty() {
                st.queue.drain(..).collect()
            } else {
                Vec::new()
            }
        };
        if stranded.is_empty() {
            return;
        }
        if self.config.is_unix() {
            tracing::error!("All database handles closed; cannot create any new ones.");
        }
        for work in stranded {
            work.fail(DbError::NoHandles);
        }
    }
}

#[cfg(test)]
mod test {
    use crate::testing::{test_config, ScriptedBackend, ScriptedConnector};
    use crate::{DbError, Pool, Query, TxStatus, Value};
    use std::sync::Arc;
    use std::time::Duration;

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn submit_runs_query() {
        let backend = ScriptedBackend::new().on(
            "select 42",
            vec![Ok(vec![crate::testing::row(&[("answer", Value::Int(42))])])],
        );
        let pool = Pool::new(
            test_config(1, 1),
            ScriptedConnector::new(vec![backend]),
        )
        .unwrap();
        let rows = pool
            .submit(Query::new("select 42 as answer"))
            .wait()
            .await
            .unwrap();
        assert_eq!(rows[0].get_int("answer").unwrap(), 42);
    }

    #[tokio::test]
    async fn starvation_fails_queued_queries() {
        let pool = Pool::new(test_config(1, 2), ScriptedConnector::new(vec![])).unwrap();
        let err = pool
            .submit(Query::new("select 1"))
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err, DbError::NoHandles);
    }

    #[tokio::test]
    async fn pool_grows_when_queue_head_is_stuck() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let blocked = ScriptedBackend::new().gated(gate.clone());
        let free = ScriptedBackend::new();
        let pool = Pool::new(
            test_config(1, 2),
            ScriptedConnector::new(vec![blocked, free]),
        )
        .unwrap();
        wait_until(|| pool.num_handles() == 1).await;

        let first = pool.submit(Query::new("select 'slow'"));
        let second = pool.submit(Query::new("select 'fast'"));
        // The second query can only complete on a freshly grown handle.
        second.wait().await.unwrap();
        assert_eq!(pool.num_handles(), 2);

        gate.add_permits(1);
        first.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pool_shrinks_one_idle_handle_after_dispatch() {
        let pool = Pool::new(
            test_config(2, 2),
            ScriptedConnector::new(vec![ScriptedBackend::new(), ScriptedBackend::new()]),
        )
        .unwrap();
        wait_until(|| pool.num_handles() == 2).await;

        pool.submit(Query::new("select 1")).wait().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(pool.num_handles(), 1);
    }

    #[tokio::test]
    async fn transaction_failure_is_sticky_and_keeps_first_error() {
        let backend =
            ScriptedBackend::new().on("boom", vec![Err(DbError::query("deliberate failure"))]);
        let log = backend.log();
        let pool = Pool::new(test_config(1, 1), ScriptedConnector::new(vec![backend])).unwrap();

        let mut tx = pool.transaction().await.unwrap();
        let ok = tx.enqueue(Query::new("select 1"));
        let bad = tx.enqueue(Query::new("select boom"));
        let after = tx.enqueue(Query::new("select 2"));
        tx.execute();

        ok.wait().await.unwrap();
        assert!(bad.wait().await.unwrap_err().contains("deliberate failure"));
        assert!(matches!(
            after.wait().await.unwrap_err(),
            DbError::TxFailed(_)
        ));

        assert!(tx.failed());
        assert!(tx.error().unwrap().contains("deliberate failure"));
        assert!(tx.commit().await.is_err());
        assert!(log.lock().iter().any(|sql| sql == "rollback"));
    }

    #[tokio::test]
    async fn allow_failure_leaves_transaction_usable() {
        let backend = ScriptedBackend::new().on(
            "insert into bodyparts",
            vec![Err(DbError::Query {
                message: "duplicate key value violates unique constraint \"bodyparts_hash_key\""
                    .to_string(),
                constraint: Some("bodyparts_hash_key".to_string()),
            })],
        );
        let pool = Pool::new(test_config(1, 1), ScriptedConnector::new(vec![backend])).unwrap();

        let mut tx = pool.transaction().await.unwrap();
        tx.begin_savepoint("a0");
        let insert = tx.enqueue(
            Query::new("insert into bodyparts (hash) values ($1)")
                .bind("feed")
                .allow_failure(),
        );
        tx.execute();
        assert!(insert.wait().await.unwrap_err().contains("bodyparts_hash_key"));
        assert!(!tx.failed());

        tx.rollback_to("a0");
        let select = tx.enqueue(Query::new("select id from bodyparts where hash=$1").bind("feed"));
        tx.execute();
        select.wait().await.unwrap();

        assert_eq!(tx.status(), TxStatus::Active);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_and_frees_the_handle() {
        let backend = ScriptedBackend::new();
        let log = backend.log();
        let pool = Pool::new(test_config(1, 1), ScriptedConnector::new(vec![backend])).unwrap();

        let tx = pool.transaction().await.unwrap();
        drop(tx);

        // The handle goes back to work afterwards.
        pool.submit(Query::new("select 1")).wait().await.unwrap();
        assert!(log.lock().iter().any(|sql| sql == "rollback"));
    }
}
