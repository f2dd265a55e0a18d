//! Vocabulary resolvers: map freeform names and addresses to stable
//! integer ids, creating missing rows race-tolerantly.
//!
//! The shape is the same everywhere: select the ids of whatever is still
//! unresolved, then COPY the remainder under a savepoint. If the COPY
//! trips the table's unique constraint, a concurrent injector created
//! some of the same rows meanwhile; roll back to the savepoint and loop
//! into another select. Any other failure is fatal. The loop makes
//! progress without ever locking the vocabulary tables.

use dashmap::DashMap;
use dbpool::{DbError, Query, Transaction, Value};
use message::Address;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// At most this many unresolved entries per select round.
const SELECT_CHUNK: usize = 1024;

/// One name table (flag names, annotation names, field names) together
/// with its process-wide monotone cache. Cache entries are written once,
/// when the id is learned, and never change.
pub struct NameVocabulary {
    table: &'static str,
    conflict: &'static str,
    savepoint_prefix: char,
    case_insensitive: bool,
    cache: DashMap<String, u32>,
}

impl NameVocabulary {
    pub fn new(
        table: &'static str,
        conflict: &'static str,
        savepoint_prefix: char,
        case_insensitive: bool,
    ) -> Self {
        Self {
            table,
            conflict,
            savepoint_prefix,
            case_insensitive,
            cache: DashMap::new(),
        }
    }

    fn canonical(&self, name: &str) -> String {
        if self.case_insensitive {
            name.to_lowercase()
        } else {
            name.to_string()
        }
    }

    /// The cached id for `name`, if the process has learned it.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.cache.get(&self.canonical(name)).map(|e| *e)
    }

    /// Seed an entry; used at startup for well-known rows and by tests.
    pub fn learn(&self, name: &str, id: u32) {
        self.cache.entry(self.canonical(name)).or_insert(id);
    }

    /// Ensure every name in `names` has an id, creating missing rows on
    /// `tx` with the select–copy–rollback loop.
    pub async fn resolve(&self, tx: &mut Transaction, names: &[String]) -> Result<(), DbError> {
        let mut savepoint = 0u32;
        loop {
            let mut unided: Vec<String> = Vec::new();
            for name in names {
                let canonical = self.canonical(name);
                if self.cache.contains_key(&canonical) || unided.contains(&canonical) {
                    continue;
                }
                unided.push(canonical);
                if unided.len() == SELECT_CHUNK {
                    break;
                }
            }
            if unided.is_empty() {
                return Ok(());
            }

            let mut sql = format!("select id, name from {} where ", self.table);
            let mut binds: Vec<Value> = Vec::with_capacity(unided.len());
            for (i, name) in unided.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" or ");
                }
                if self.case_insensitive {
                    sql.push_str(&format!("lower(name)=${}", i + 1));
                } else {
                    sql.push_str(&format!("name=${}", i + 1));
                }
                binds.push(Value::Text(name.clone()));
            }
            let mut q = Query::new(sql);
            for bind in binds {
                q.push_bind(bind);
            }
            let rows = {
                let handle = tx.enqueue(q);
                tx.execute();
                handle.wait().await?
            };
            for row in rows {
                let id = row.get_int("id")? as u32;
                let name = row.get_text("name")?;
                self.learn(&name, id);
            }

            let missing: Vec<&String> = unided
                .iter()
                .filter(|n| !self.cache.contains_key(*n))
                .collect();
            if missing.is_empty() {
                // Learned everything in this chunk; loop in case more
                // names remain beyond the chunk limit.
                continue;
            }

            let name = format!("{}{}", self.savepoint_prefix, savepoint);
            tx.begin_savepoint(&name);
            let mut copy = Query::copy(format!(
                "copy {} (name) from stdin with binary",
                self.table
            ))
            .allow_failure();
            for n in &missing {
                copy.submit_line(vec![Value::Text((*n).clone())]);
            }
            let handle = tx.enqueue(copy);
            tx.execute();
            match handle.wait().await {
                // The next select round picks up the ids.
                Ok(_) => {}
                Err(err) if err.contains(self.conflict) => {
                    // A concurrent injector inserted some of these names
                    // meanwhile.
                    tx.rollback_to(&name);
                    tx.execute();
                    savepoint += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// The process-wide vocabulary set. Tests build private instances so
/// their caches do not leak into each other.
pub struct Vocabularies {
    pub flags: NameVocabulary,
    pub annotations: NameVocabulary,
    pub fields: NameVocabulary,
}

impl Vocabularies {
    pub fn new() -> Self {
        Self {
            flags: NameVocabulary::new("flag_names", "fn_uname", 'c', true),
            annotations: NameVocabulary::new(
                "annotation_names",
                "annotation_names_name_key",
                'd',
                false,
            ),
            fields: NameVocabulary::new("field_names", "field_names_name_key", 'e', false),
        }
    }

    pub fn global() -> Arc<Vocabularies> {
        static GLOBAL: LazyLock<Arc<Vocabularies>> =
            LazyLock::new(|| Arc::new(Vocabularies::new()));
        GLOBAL.clone()
    }
}

impl Default for Vocabularies {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve every address in `addresses` to its id, creating missing rows
/// with the same savepoint pattern. Ids land on the [`Address`] objects
/// themselves; duplicate canonical keys share one object and therefore
/// one id.
pub async fn resolve_addresses(
    tx: &mut Transaction,
    addresses: &[Arc<Address>],
) -> Result<(), DbError> {
    let mut savepoint = 0u32;
    loop {
        let mut unided: HashMap<String, Arc<Address>> = HashMap::new();
        for address in addresses {
            if address.id().is_none() && !unided.contains_key(&address.key()) {
                unided.insert(address.key(), address.clone());
                if unided.len() == SELECT_CHUNK {
                    break;
                }
            }
        }
        if unided.is_empty() {
            return Ok(());
        }

        let mut sql = String::from("select id, name, localpart, domain from addresses where ");
        let mut binds: Vec<Value> = Vec::with_capacity(unided.len() * 3);
        for (i, address) in unided.values().enumerate() {
            let n = 3 * i + 1;
            if i > 0 {
                sql.push_str(" or ");
            }
            sql.push_str(&format!(
                "(name=${} and localpart=${} and lower(domain)=${})",
                n,
                n + 1,
                n + 2
            ));
            binds.push(Value::Text(address.name().to_string()));
            binds.push(Value::Text(address.localpart().to_string()));
            binds.push(Value::Text(address.domain().to_lowercase()));
        }
        let mut q = Query::new(sql);
        for bind in binds {
            q.push_bind(bind);
        }
        let rows = {
            let handle = tx.enqueue(q);
            tx.execute();
            handle.wait().await?
        };
        for row in rows {
            let found = Address::new(
                row.get_text("name")?,
                row.get_text("localpart")?,
                row.get_text("domain")?,
            );
            if let Some(address) = unided.get(&found.key()) {
                address.set_id(row.get_int("id")? as u32);
            }
        }

        let missing: Vec<&Arc<Address>> =
            unided.values().filter(|a| a.id().is_none()).collect();
        if missing.is_empty() {
            continue;
        }

        let name = format!("b{savepoint}");
        tx.begin_savepoint(&name);
        let mut copy =
            Query::copy("copy addresses (name,localpart,domain) from stdin with binary")
                .allow_failure();
        for address in &missing {
            copy.submit_line(vec![
                Value::Text(address.name().to_string()),
                Value::Text(address.localpart().to_string()),
                Value::Text(address.domain().to_string()),
            ]);
        }
        let handle = tx.enqueue(copy);
        tx.execute();
        match handle.wait().await {
            Ok(_) => {}
            Err(err) if err.contains("addresses_nld_key") => {
                tx.rollback_to(&name);
                tx.execute();
                savepoint += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
