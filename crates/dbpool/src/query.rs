use crate::error::DbError;
use crate::value::{Row, Value};
use tokio::sync::oneshot;

pub type QueryResult = Result<Vec<Row>, DbError>;

/// One SQL statement with positional binds, or a `COPY … FROM STDIN WITH
/// BINARY` stream built up with [`Query::submit_line`].
///
/// A query completes exactly once; the caller observes completion through
/// the [`QueryHandle`] returned when the query is submitted to a pool or
/// enqueued on a transaction.
#[derive(Debug)]
pub struct Query {
    sql: String,
    binds: Vec<Value>,
    copy_rows: Option<Vec<Vec<Value>>>,
    allow_failure: bool,
    completion: Option<oneshot::Sender<QueryResult>>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
            copy_rows: None,
            allow_failure: false,
            completion: None,
        }
    }

    /// A `COPY target (cols) FROM STDIN WITH BINARY` statement. Rows are
    /// appended with [`Query::submit_line`].
    pub fn copy(sql: impl Into<String>) -> Self {
        let mut q = Self::new(sql);
        q.copy_rows = Some(Vec::new());
        q
    }

    pub fn bind(mut self, v: impl Into<Value>) -> Self {
        self.binds.push(v.into());
        self
    }

    pub fn push_bind(&mut self, v: impl Into<Value>) {
        self.binds.push(v.into());
    }

    /// Append one tuple to a COPY stream.
    pub fn submit_line(&mut self, row: Vec<Value>) {
        self.copy_rows
            .as_mut()
            .expect("submit_line on a non-COPY query")
            .push(row);
    }

    /// The transaction does not become fatal if this query fails; the
    /// caller inspects the result and recovers, usually by rolling back
    /// to a savepoint.
    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[Value] {
        &self.binds
    }

    pub fn is_copy(&self) -> bool {
        self.copy_rows.is_some()
    }

    pub fn copy_rows(&self) -> &[Vec<Value>] {
        self.copy_rows.as_deref().unwrap_or(&[])
    }

    pub fn is_allow_failure(&self) -> bool {
        self.allow_failure
    }

    /// Arm the completion channel. Called on submission.
    pub(crate) fn make_handle(&mut self) -> QueryHandle {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        QueryHandle { rx }
    }

    pub(crate) fn complete(&mut self, result: QueryResult) {
        if let Some(tx) = self.completion.take() {
            // The waiter may have gone away; that is not our problem.
            let _ = tx.send(result);
        }
    }
}

/// Awaitable completion of a submitted [`Query`].
#[derive(Debug)]
pub struct QueryHandle {
    rx: oneshot::Receiver<QueryResult>,
}

impl QueryHandle {
    pub async fn wait(self) -> QueryResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DbError::PoolClosed),
        }
    }
}
