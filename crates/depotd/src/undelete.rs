//! Move messages from `deleted_messages` back into `mailbox_messages`.
//!
//! Restored rows get fresh UIDs from a transaction-scoped temporary
//! sequence that starts at the mailbox's current `uidnext`, so UID
//! generation here serializes through the same `uidnext` advance that
//! normal injection uses. The whole operation runs in one transaction
//! with the mailbox row locked.

use dbpool::{DbError, Pool, Query, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UndeleteError {
    #[error("No such mailbox: {0}")]
    NoSuchMailbox(String),

    #[error("No such deleted message (search returned 0 results)")]
    NothingFound,

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Which deleted messages to restore.
#[derive(Debug, Clone)]
pub enum Selector {
    All,
    Uids(BTreeSet<u32>),
}

#[derive(Debug)]
pub struct UndeleteReport {
    pub mailbox: String,
    pub restored: usize,
    /// "who deleted / when / reason" per message, in verbose mode.
    pub details: Vec<String>,
}

/// The queries that re-materialize `uids` into mailbox `mailbox_id`,
/// given its locked `uidnext` and `nextmodseq`. Split out so the plan
/// is inspectable without a database.
pub fn plan_restore(mailbox_id: u32, uidnext: u32, nextmodseq: i64, uids: &[u32]) -> Vec<Query> {
    let uid_array: Vec<i32> = uids.iter().map(|u| *u as i32).collect();
    let mut plan = Vec::new();

    plan.push(Query::new(format!(
        "create temporary sequence s start {uidnext}"
    )));

    let mut insert = Query::new(
        "insert into mailbox_messages (mailbox,uid,message,modseq) \
         select $1,nextval('s'),message,$2 from deleted_messages \
         where mailbox=$1 and uid=any($3)",
    );
    insert.push_bind(mailbox_id);
    insert.push_bind(Value::BigInt(nextmodseq));
    insert.push_bind(Value::IntArray(uid_array.clone()));
    plan.push(insert);

    let mut delete = Query::new(
        "delete from deleted_messages where mailbox=$1 and uid=any($2)",
    );
    delete.push_bind(mailbox_id);
    delete.push_bind(Value::IntArray(uid_array));
    plan.push(delete);

    let mut bump = Query::new(
        "update mailboxes set uidnext=nextval('s'), nextmodseq=$1 where id=$2",
    );
    bump.push_bind(Value::BigInt(nextmodseq + 1));
    bump.push_bind(mailbox_id);
    plan.push(bump);

    plan.push(Query::new("drop sequence s"));
    plan
}

pub async fn undelete(
    pool: &Pool,
    mailbox_name: &str,
    selector: Selector,
    verbose: bool,
) -> Result<UndeleteReport, UndeleteError> {
    let rows = pool
        .submit(Query::new("select id from mailboxes where name=$1").bind(mailbox_name))
        .wait()
        .await?;
    let mailbox_id = match rows.first() {
        Some(row) => row.get_int("id")? as u32,
        None => return Err(UndeleteError::NoSuchMailbox(mailbox_name.to_string())),
    };

    let mut tx = pool.transaction().await?;

    let logins_handle = if verbose {
        Some(tx.enqueue(Query::new("select id, login from users")))
    } else {
        None
    };

    let mut find_sql = String::from("select uid");
    if verbose {
        find_sql.push_str(", deleted_by, deleted_at::text, reason");
    }
    find_sql.push_str(" from deleted_messages where mailbox=$1");
    let find = match &selector {
        Selector::All => Query::new(find_sql).bind(mailbox_id),
        Selector::Uids(uids) => Query::new(format!("{find_sql} and uid=any($2)"))
            .bind(mailbox_id)
            .bind(Value::IntArray(uids.iter().map(|u| *u as i32).collect())),
    };
    let find_handle = tx.enqueue(find);

    let counters_handle = tx.enqueue(
        Query::new("select uidnext, nextmodseq from mailboxes where id=$1 for update")
            .bind(mailbox_id),
    );
    tx.execute();

    let mut logins: Vec<(u32, String)> = Vec::new();
    if let Some(handle) = logins_handle {
        for row in handle.wait().await? {
            logins.push((row.get_int("id")? as u32, row.get_text("login")?));
        }
    }

    let mut uids: Vec<u32> = Vec::new();
    let mut details: Vec<String> = Vec::new();
    for row in find_handle.wait().await? {
        let uid = row.get_int("uid")? as u32;
        uids.push(uid);
        if verbose {
            let deleted_by = row.opt_int("deleted_by")?;
            let login = deleted_by
                .and_then(|by| logins.iter().find(|(id, _)| *id == by as u32))
                .map(|(_, login)| login.as_str())
                .unwrap_or("unknown");
            details.push(format!(
                " - Message {uid} was deleted by {:?} at {}\n   Reason: {:?}",
                login,
                row.get_text("deleted_at")?,
                row.opt_text("reason")?.unwrap_or_default().trim(),
            ));
        }
    }

    if uids.is_empty() {
        let _ = tx.rollback().await;
        return Err(UndeleteError::NothingFound);
    }

    let rows = counters_handle.wait().await?;
    let row = rows
        .first()
        .ok_or_else(|| DbError::query("could not read mailbox UID counters"))?;
    let uidnext = row.get_int("uidnext")? as u32;
    let nextmodseq = row.get_bigint("nextmodseq")?;

    for q in plan_restore(mailbox_id, uidnext, nextmodseq, &uids) {
        tx.enqueue(q);
    }
    tx.execute();
    tx.commit().await?;

    Ok(UndeleteReport {
        mailbox: mailbox_name.to_string(),
        restored: uids.len(),
        details,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    /// The historical implementation bound parameter 5 where the DELETE
    /// references $2, so the uid set never reached the statement. The
    /// plan must bind exactly (mailbox, uid-set), in that order.
    #[test]
    fn delete_binds_uid_set_as_parameter_two() {
        let plan = plan_restore(7, 42, 13, &[3, 7, 9]);
        let delete = &plan[2];
        assert!(delete.sql().contains("delete from deleted_messages"));
        assert!(delete.sql().contains("uid=any($2)"));
        k9::assert_equal!(delete.binds().len(), 2);
        k9::assert_equal!(&delete.binds()[0], &Value::Int(7));
        k9::assert_equal!(&delete.binds()[1], &Value::IntArray(vec![3, 7, 9]));
    }

    #[test]
    fn restore_plan_shape() {
        let plan = plan_restore(7, 42, 13, &[3]);
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].sql(), "create temporary sequence s start 42");
        assert!(plan[1].sql().contains("insert into mailbox_messages"));
        // Restored rows carry the pre-undelete nextmodseq...
        assert_eq!(plan[1].binds()[1], Value::BigInt(13));
        // ...and the mailbox advances to the one after it.
        assert!(plan[3].sql().contains("uidnext=nextval('s')"));
        assert_eq!(plan[3].binds()[0], Value::BigInt(14));
        assert_eq!(plan[4].sql(), "drop sequence s");
    }
}
