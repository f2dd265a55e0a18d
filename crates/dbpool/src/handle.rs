//! The per-connection task: executes dispatched work serially, runs
//! dedicated transactions, and honors the shrink policy's idle deadline.

use crate::backend::Backend;
use crate::error::DbError;
use crate::pool::{HandleCmd, HandleState, PoolInner};
use crate::transaction::{TxCmd, TxShared, TxStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub(crate) async fn handle_task(
    pool: &Arc<PoolInner>,
    id: u64,
    mut backend: Box<dyn Backend>,
    mut rx: mpsc::UnboundedReceiver<HandleCmd>,
) {
    let mut idle_deadline: Option<Instant> = None;
    loop {
        let cmd = match idle_deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(cmd) => cmd,
                Err(_) => {
                    if pool.try_retire(id) {
                        tracing::debug!("database handle {id} retired after idle timeout");
                        return;
                    }
                    idle_deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };
        let Some(cmd) = cmd else { return };
        match cmd {
            HandleCmd::Run(mut q) => {
                idle_deadline = None;
                let result = if q.is_copy() {
                    backend
                        .exec_copy(q.sql(), q.copy_rows())
                        .await
                        .map(|_| Vec::new())
                } else {
                    backend.exec(q.sql(), q.binds()).await
                };
                let broken = matches!(&result, Err(DbError::Connect(_)));
                q.complete(result);
                if broken {
                    tracing::warn!("database handle {id} lost its connection");
                    return;
                }
                pool.set_handle_state(id, HandleState::Idle);
                pool.run_queue();
            }
            HandleCmd::StartTx { cmds, shared } => {
                idle_deadline = None;
                run_transaction(pool, id, backend.as_mut(), cmds, &shared).await;
                pool.set_handle_state(id, HandleState::Idle);
                pool.run_queue();
            }
            HandleCmd::RetireIfIdleAfter(after) => {
                idle_deadline = Some(Instant::now() + after);
            }
            HandleCmd::Retire => return,
        }
    }
}

/// Drive one transaction to its terminal state. Queries execute in the
/// order they arrive; the first failure of a non-allow-failure query makes
/// the transaction fatal, and everything after it completes immediately
/// with a transaction-failed error until the terminal command arrives.
async fn run_transaction(
    pool: &Arc<PoolInner>,
    id: u64,
    backend: &mut dyn Backend,
    mut cmds: mpsc::UnboundedReceiver<TxCmd>,
    shared: &Arc<TxShared>,
) {
    let mut fatal: Option<DbError> = None;

    if let Err(err) = backend.exec("begin", &[]).await {
        shared.set_failed(err.clone());
        pool.set_handle_state(id, HandleState::FailedTransaction);
        fatal = Some(err);
    }

    let mut saw_terminal = false;
    while let Some(cmd) = cmds.recv().await {
        match cmd {
            TxCmd::Query(mut q) => {
                if let Some(err) = &fatal {
                    q.complete(Err(DbError::TxFailed(err.to_string())));
                    continue;
                }
                let result = if q.is_copy() {
                    backend
                        .exec_copy(q.sql(), q.copy_rows())
                        .await
                        .map(|_| Vec::new())
                } else {
                    backend.exec(q.sql(), q.binds()).await
                };
                match result {
                    Ok(rows) => q.complete(Ok(rows)),
                    Err(err) => {
                        if !q.is_allow_failure() {
                            shared.set_failed(err.clone());
                            pool.set_handle_state(id, HandleState::FailedTransaction);
                            fatal = Some(err.clone());
                        }
                        q.complete(Err(err));
                    }
                }
            }
            TxCmd::Commit(reply) => {
                saw_terminal = true;
                let result = match &fatal {
                    Some(err) => {
                        let _ = backend.exec("rollback", &[]).await;
                        Err(DbError::TxFailed(err.to_string()))
                    }
                    None => {
                        shared.set_status(TxStatus::Committing);
                        match backend.exec("commit", &[]).await {
                            Ok(_) => {
                                shared.set_status(TxStatus::Committed);
                                Ok(())
                            }
                            Err(err) => {
                                shared.set_failed(err.clone());
                                Err(err)
                            }
                        }
                    }
                };
                let _ = reply.send(result);
                break;
            }
            TxCmd::Rollback(reply) => {
                saw_terminal = true;
                let _ = backend.exec("rollback", &[]).await;
                if shared.status() != TxStatus::Failed {
                    shared.set_status(TxStatus::RolledBack);
                }
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }

    if !saw_terminal {
        // The transaction handle was dropped; restore autocommit.
        let _ = backend.exec("rollback", &[]).await;
        if shared.status() == TxStatus::Active {
            shared.set_status(TxStatus::RolledBack);
        }
    }
}
