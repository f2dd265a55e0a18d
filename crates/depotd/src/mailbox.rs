use dashmap::DashMap;
use dbpool::{DbError, Pool, Query};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live view of a mailbox held by one IMAP connection. The injector's
/// announcer feeds each session's unannounced set (and, for at most one
/// session per injection, the recent set); the protocol layer drains
/// them when it next talks to the client.
pub struct Session {
    id: u64,
    unannounced: Mutex<BTreeSet<u32>>,
    recent: Mutex<BTreeSet<u32>>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            unannounced: Mutex::new(BTreeSet::new()),
            recent: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn add_unannounced(&self, uid: u32) {
        self.unannounced.lock().insert(uid);
    }

    pub fn add_recent(&self, uid: u32) {
        self.recent.lock().insert(uid);
    }

    pub fn take_unannounced(&self) -> BTreeSet<u32> {
        std::mem::take(&mut self.unannounced.lock())
    }

    pub fn unannounced(&self) -> BTreeSet<u32> {
        self.unannounced.lock().clone()
    }

    pub fn recent(&self) -> BTreeSet<u32> {
        self.recent.lock().clone()
    }
}

struct Counters {
    uidnext: u32,
    nextmodseq: i64,
}

/// The in-process image of one mailbox row. The database row is the
/// truth; this object caches `uidnext`/`nextmodseq` for announcement and
/// holds the sessions currently attached. The cached counters only ever
/// advance, and only on successful commit.
pub struct Mailbox {
    id: u32,
    name: String,
    counters: Mutex<Counters>,
    sessions: Mutex<Vec<Arc<Session>>>,
}

impl Mailbox {
    pub fn new(id: u32, name: impl Into<String>, uidnext: u32, nextmodseq: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            counters: Mutex::new(Counters { uidnext, nextmodseq }),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uidnext(&self) -> u32 {
        self.counters.lock().uidnext
    }

    pub fn nextmodseq(&self) -> i64 {
        self.counters.lock().nextmodseq
    }

    /// Advance the cached counters, never decreasing either.
    pub fn advance(&self, uidnext: u32, nextmodseq: i64) {
        let mut c = self.counters.lock();
        if uidnext > c.uidnext {
            c.uidnext = uidnext;
        }
        if nextmodseq > c.nextmodseq {
            c.nextmodseq = nextmodseq;
        }
    }

    pub fn attach_session(&self, session: Arc<Session>) {
        self.sessions.lock().push(session);
    }

    pub fn detach_session(&self, id: u64) {
        self.sessions.lock().retain(|s| s.id() != id);
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().clone()
    }

    pub fn first_session(&self) -> Option<Arc<Session>> {
        self.sessions.lock().first().cloned()
    }
}

/// The process-wide mailbox registry, loaded from the `mailboxes` table
/// at startup and consulted by injections and announcements.
#[derive(Default)]
pub struct MailboxManager {
    by_id: DashMap<u32, Arc<Mailbox>>,
    by_name: DashMap<String, u32>,
}

impl MailboxManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(&self, pool: &Pool) -> Result<usize, DbError> {
        let rows = pool
            .submit(Query::new(
                "select id, name, uidnext, nextmodseq from mailboxes",
            ))
            .wait()
            .await?;
        let count = rows.len();
        for row in rows {
            let mailbox = Mailbox::new(
                row.get_int("id")? as u32,
                row.get_text("name")?,
                row.get_int("uidnext")? as u32,
                row.get_bigint("nextmodseq")?,
            );
            self.insert(mailbox);
        }
        Ok(count)
    }

    pub fn insert(&self, mailbox: Arc<Mailbox>) {
        self.by_name.insert(mailbox.name().to_string(), mailbox.id());
        self.by_id.insert(mailbox.id(), mailbox);
    }

    pub fn find(&self, id: u32) -> Option<Arc<Mailbox>> {
        self.by_id.get(&id).map(|m| m.clone())
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Mailbox>> {
        let id = *self.by_name.get(name)?;
        self.find(id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_never_decrease() {
        let m = Mailbox::new(1, "inbox", 5, 9);
        m.advance(4, 11);
        assert_eq!(m.uidnext(), 5);
        assert_eq!(m.nextmodseq(), 11);
        m.advance(8, 3);
        assert_eq!(m.uidnext(), 8);
        assert_eq!(m.nextmodseq(), 11);
    }

    #[test]
    fn session_attachment() {
        let m = Mailbox::new(1, "inbox", 1, 1);
        assert!(m.first_session().is_none());
        let s1 = Session::new();
        let s2 = Session::new();
        m.attach_session(s1.clone());
        m.attach_session(s2.clone());
        assert_eq!(m.first_session().unwrap().id(), s1.id());
        m.detach_session(s1.id());
        assert_eq!(m.first_session().unwrap().id(), s2.id());
    }

    #[test]
    fn registry_lookup() {
        let manager = MailboxManager::new();
        manager.insert(Mailbox::new(3, "archive/2026", 1, 1));
        assert_eq!(manager.find(3).unwrap().name(), "archive/2026");
        assert_eq!(manager.find_by_name("archive/2026").unwrap().id(), 3);
        assert!(manager.find_by_name("nope").is_none());
    }
}
