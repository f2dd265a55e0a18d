//! The message injector: one transactional persistence of one parsed
//! message into one or more mailboxes.
//!
//! All database work happens inside a single transaction on a dedicated
//! pool handle. Target mailboxes are locked in ascending id order, so
//! concurrent injections into overlapping mailbox sets serialize on the
//! row locks and cannot deadlock. Nothing outside the database — session
//! recency, cached mailbox counters, peer broadcasts — changes until the
//! transaction has committed.

use crate::mailbox::{Mailbox, Session};
use crate::metrics::{INJECTION_ERRORS, MESSAGES_INJECTED};
use crate::peers::PeerNotifier;
use crate::vocab::{resolve_addresses, Vocabularies};
use dbpool::{DbError, Pool, Query, QueryHandle, Transaction, Value};
use message::{Address, FieldKind, Header, Message};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// A mailbox above this many UIDs is running out; above
/// [`UID_DISASTER_THRESHOLD`] it is nearly exhausted. UIDs do not go
/// past 2^31.
const UID_WARN_THRESHOLD: u32 = 0x7fff_0000;
const UID_DISASTER_THRESHOLD: u32 = 0x7fff_fff0;

#[derive(Error, Debug)]
pub enum InjectError {
    #[error("message is invalid: {0}")]
    InvalidMessage(String),

    #[error("No matching bodypart found")]
    MissingBodypart,

    #[error("{0:?} has no resolved id")]
    UnresolvedName(String),

    #[error("address {0} has no resolved id")]
    UnresolvedAddress(String),

    #[error("remote recipients given without a sender")]
    MissingSender,

    #[error(transparent)]
    Db(#[from] DbError),
}

/// The phases of an injection, in order. Failure in any phase rolls the
/// transaction back and jumps to `AwaitingCompletion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Inactive,
    CreatingFlags,
    CreatingAnnotationNames,
    CreatingFields,
    InsertingBodyparts,
    InsertingAddresses,
    SelectingUids,
    InsertingMessages,
    LinkingAddresses,
    LinkingFlags,
    LinkingAnnotations,
    AwaitingCompletion,
    Done,
}

/// An IMAP annotation to create on the injected message.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub entry_name: String,
    pub value: String,
    pub owner: Option<u32>,
}

struct Target {
    mailbox: Arc<Mailbox>,
    uid: u32,
    modseq: i64,
    recent_in: Option<Arc<Session>>,
}

struct FieldLink {
    name: String,
    kind: FieldKind,
    part: String,
    position: u32,
    value: String,
}

struct AddressLink {
    address: Arc<Address>,
    field_id: u32,
    part: String,
    position: u32,
    number: u32,
}

struct DateLink {
    value: chrono::DateTime<chrono::Utc>,
}

struct PartRow {
    number: String,
    bid: Option<u32>,
    bytes: Option<u32>,
    lines: Option<u32>,
    embedded: bool,
}

/// What an injection leaves behind for its caller: the message id and
/// the per-mailbox UID and modseq assignments.
#[derive(Debug, Clone)]
pub struct InjectionReport {
    pub message_id: u32,
    assignments: Vec<(u32, u32, i64)>,
}

impl InjectionReport {
    pub fn uid(&self, mailbox_id: u32) -> Option<u32> {
        self.assignments
            .iter()
            .find(|(m, _, _)| *m == mailbox_id)
            .map(|(_, uid, _)| *uid)
    }

    pub fn modseq(&self, mailbox_id: u32) -> Option<i64> {
        self.assignments
            .iter()
            .find(|(m, _, _)| *m == mailbox_id)
            .map(|(_, _, ms)| *ms)
    }
}

pub struct Injector {
    message: Message,
    targets: Vec<Target>,
    flags: Vec<String>,
    annotations: Vec<Annotation>,
    remote_recipients: Vec<Arc<Address>>,
    sender: Option<Arc<Address>>,
    wrapped: bool,
    vocab: Arc<Vocabularies>,
    peers: Option<Arc<PeerNotifier>>,
    phase: Phase,
    message_id: u32,
    field_links: Vec<FieldLink>,
    address_links: Vec<AddressLink>,
    date_links: Vec<DateLink>,
    other_fields: Vec<String>,
    part_rows: Vec<PartRow>,
}

impl Injector {
    /// Prepare an injection of `message` into `mailboxes`. The mailbox
    /// list is sorted by id so that every injector acquires its row
    /// locks in the same order.
    pub fn new(message: Message, mailboxes: Vec<Arc<Mailbox>>) -> Self {
        let mut mailboxes = mailboxes;
        mailboxes.sort_by_key(|m| m.id());
        mailboxes.dedup_by_key(|m| m.id());
        let targets = mailboxes
            .into_iter()
            .map(|mailbox| Target {
                mailbox,
                uid: 0,
                modseq: 0,
                recent_in: None,
            })
            .collect();
        Self {
            message,
            targets,
            flags: Vec::new(),
            annotations: Vec::new(),
            remote_recipients: Vec::new(),
            sender: None,
            wrapped: false,
            vocab: Vocabularies::global(),
            peers: None,
            phase: Phase::Inactive,
            message_id: 0,
            field_links: Vec::new(),
            address_links: Vec::new(),
            date_links: Vec::new(),
            other_fields: Vec::new(),
            part_rows: Vec::new(),
        }
    }

    /// Set the IMAP flags for the injected message. Duplicates are
    /// dropped case-insensitively; the first spelling wins.
    pub fn set_flags<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen: HashSet<String> = self.flags.iter().map(|f| f.to_lowercase()).collect();
        for flag in flags {
            let flag = flag.into();
            if seen.insert(flag.to_lowercase()) {
                self.flags.push(flag);
            }
        }
    }

    /// Set annotations; a later annotation for the same (owner, entry)
    /// pair replaces the earlier value.
    pub fn set_annotations<I>(&mut self, annotations: I)
    where
        I: IntoIterator<Item = Annotation>,
    {
        for a in annotations {
            match self
                .annotations
                .iter_mut()
                .find(|e| e.owner == a.owner && e.entry_name == a.entry_name)
            {
                Some(existing) => existing.value = a.value,
                None => self.annotations.push(a),
            }
        }
    }

    /// Spool the message for later SMTP delivery to `recipients`.
    pub fn set_remote_recipients(&mut self, recipients: Vec<Arc<Address>>) {
        self.remote_recipients = recipients;
    }

    pub fn set_sender(&mut self, sender: Arc<Address>) {
        self.sender = Some(sender);
    }

    /// This message wraps one that could not be parsed; record the
    /// original blob (part "2") in `unparsed_messages`.
    pub fn set_wrapped(&mut self) {
        self.wrapped = true;
    }

    pub fn with_vocabularies(&mut self, vocab: Arc<Vocabularies>) {
        self.vocab = vocab;
    }

    pub fn with_peers(&mut self, peers: Arc<PeerNotifier>) {
        self.peers = Some(peers);
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn set_phase(&mut self, phase: Phase) {
        tracing::debug!("injection phase {:?}", phase);
        self.phase = phase;
    }

    /// Run the injection to completion. The caller is notified exactly
    /// once, by this future resolving; side effects outside the database
    /// happen only when the transaction has committed.
    pub async fn run(mut self, pool: &Pool) -> Result<InjectionReport, InjectError> {
        let result = self.run_inner(pool).await;
        self.set_phase(Phase::Done);
        match &result {
            Ok(report) => {
                MESSAGES_INJECTED.inc();
                tracing::info!("Injection succeeded, message {}", report.message_id);
            }
            Err(err) => {
                INJECTION_ERRORS.inc();
                tracing::error!("Injection failed: {err}");
            }
        }
        result
    }

    async fn run_inner(&mut self, pool: &Pool) -> Result<InjectionReport, InjectError> {
        if !self.message.valid() {
            let reason = self
                .message
                .error()
                .unwrap_or("unparsable message")
                .to_string();
            return Err(InjectError::InvalidMessage(reason));
        }
        self.log_message_details();

        let mut tx = pool.transaction().await?;
        match self.run_phases(&mut tx).await {
            Ok(report) => {
                self.set_phase(Phase::AwaitingCompletion);
                tx.commit().await?;
                self.announce();
                Ok(report)
            }
            Err(err) => {
                self.set_phase(Phase::AwaitingCompletion);
                let _ = tx.rollback().await;
                Err(err)
            }
        }
    }

    async fn run_phases(&mut self, tx: &mut Transaction) -> Result<InjectionReport, InjectError> {
        self.set_phase(Phase::CreatingFlags);
        let flags = self.flags.clone();
        self.vocab.flags.resolve(tx, &flags).await?;

        self.set_phase(Phase::CreatingAnnotationNames);
        let annotation_names: Vec<String> = self
            .annotations
            .iter()
            .map(|a| a.entry_name.clone())
            .collect();
        self.vocab.annotations.resolve(tx, &annotation_names).await?;

        self.set_phase(Phase::CreatingFields);
        self.build_field_links();
        let other_fields = self.other_fields.clone();
        self.vocab.fields.resolve(tx, &other_fields).await?;

        self.set_phase(Phase::InsertingBodyparts);
        self.insert_bodyparts(tx).await?;

        self.set_phase(Phase::InsertingAddresses);
        let addresses = self.collect_addresses();
        resolve_addresses(tx, &addresses).await?;

        self.set_phase(Phase::SelectingUids);
        self.select_ids_and_uids(tx).await?;

        self.set_phase(Phase::InsertingMessages);
        let mut handles: Vec<QueryHandle> = Vec::new();
        handles.extend(self.insert_messages(tx));
        handles.extend(self.link_bodyparts(tx));
        handles.extend(self.link_header_fields(tx)?);
        handles.extend(self.link_dates(tx));
        handles.extend(self.insert_deliveries(tx)?);
        handles.extend(self.link_addresses(tx)?);
        tx.execute();

        // The resolvers ran to completion on this same transaction, so
        // every flag and annotation name has an id by now; a miss is an
        // internal error rather than something to wait for.
        self.set_phase(Phase::LinkingAddresses);
        let flag_ids = self.flag_ids()?;

        self.set_phase(Phase::LinkingFlags);
        handles.extend(self.link_flags(tx, &flag_ids));
        let annotation_ids = self.annotation_ids()?;

        self.set_phase(Phase::LinkingAnnotations);
        handles.extend(self.link_annotations(tx, &annotation_ids));
        handles.extend(self.handle_wrapping(tx));
        tx.execute();

        for handle in handles {
            handle.wait().await?;
        }

        Ok(InjectionReport {
            message_id: self.message_id,
            assignments: self
                .targets
                .iter()
                .map(|t| (t.mailbox.id(), t.uid, t.modseq))
                .collect(),
        })
    }

    fn log_message_details(&self) {
        let id = self.message.header().message_id().unwrap_or("");
        if id.is_empty() {
            tracing::debug!("Injecting message without message-id");
        }
        for target in &self.targets {
            tracing::info!(
                "Injecting message {}into mailbox {}",
                if id.is_empty() {
                    String::new()
                } else {
                    format!("{id} ")
                },
                target.mailbox.name()
            );
        }
    }

    /// Walk every header in the message and build the links that will
    /// become `header_fields`, `address_fields` and `date_fields` rows.
    /// The MIME fields of a non-multipart message's first part are
    /// collocated with the RFC 822 header, so that part is skipped.
    fn build_field_links(&mut self) {
        let mut fields = Vec::new();
        let mut addresses = Vec::new();
        let mut dates = Vec::new();
        let mut others = Vec::new();

        collect_links(
            self.message.header(),
            "",
            &mut fields,
            &mut addresses,
            &mut dates,
            &mut others,
        );

        let mut skip = !self.message.is_multipart();
        for (number, part) in self.message.all_parts() {
            if skip {
                skip = false;
            } else {
                collect_links(
                    part.header(),
                    &number,
                    &mut fields,
                    &mut addresses,
                    &mut dates,
                    &mut others,
                );
            }
            if let Some(embedded) = part.embedded() {
                collect_links(
                    embedded.header(),
                    &format!("{number}.rfc822"),
                    &mut fields,
                    &mut addresses,
                    &mut dates,
                    &mut others,
                );
            }
        }

        self.field_links = fields;
        self.address_links = addresses;
        self.date_links = dates;
        let mut seen = HashSet::new();
        self.other_fields = others
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .collect();
    }

    /// Insert-or-lookup every storable bodypart: savepoint, INSERT
    /// marked allow-failure, roll back to the savepoint on a hash-key
    /// conflict, then SELECT the id either way.
    async fn insert_bodyparts(&mut self, tx: &mut Transaction) -> Result<(), InjectError> {
        struct Spec {
            number: String,
            storage: Option<message::Storage>,
            bytes: u32,
            lines: u32,
            embedded: bool,
        }
        let specs: Vec<Spec> = self
            .message
            .all_parts()
            .into_iter()
            .map(|(number, part)| Spec {
                number,
                storage: part.storage(),
                bytes: part.encoded_bytes(),
                lines: part.encoded_lines(),
                embedded: part.embedded().is_some(),
            })
            .collect();

        // The whole-message row.
        self.part_rows.push(PartRow {
            number: String::new(),
            bid: None,
            bytes: None,
            lines: None,
            embedded: false,
        });

        let mut savepoint = 0u32;
        for spec in specs {
            let bid = match spec.storage {
                None => None,
                Some(storage) => {
                    let name = format!("a{savepoint}");
                    tx.begin_savepoint(&name);
                    let mut insert = Query::new(
                        "insert into bodyparts (hash,bytes,text,data) values ($1,$2,$3,$4)",
                    )
                    .allow_failure();
                    insert.push_bind(storage.hash.as_str());
                    insert.push_bind(storage.bytes);
                    insert.push_bind(storage.text.clone());
                    insert.push_bind(storage.data.clone());
                    let insert_handle = tx.enqueue(insert);
                    tx.execute();
                    match insert_handle.wait().await {
                        Ok(_) => {}
                        Err(err) if err.contains("bodyparts_hash_key") => {
                            tx.rollback_to(&name);
                            tx.execute();
                        }
                        Err(err) => return Err(err.into()),
                    }

                    let select_handle = tx.enqueue(
                        Query::new("select id from bodyparts where hash=$1")
                            .bind(storage.hash.as_str()),
                    );
                    tx.execute();
                    let rows = select_handle.wait().await?;
                    let row = rows.first().ok_or(InjectError::MissingBodypart)?;
                    savepoint += 1;
                    Some(row.get_int("id")? as u32)
                }
            };
            self.part_rows.push(PartRow {
                number: spec.number,
                bid,
                bytes: Some(spec.bytes),
                lines: Some(spec.lines),
                embedded: spec.embedded,
            });
        }
        Ok(())
    }

    /// Deduplicate the addresses referenced from header fields and unify
    /// the delivery sender and remote recipients with them, so that each
    /// distinct address resolves to exactly one id.
    fn collect_addresses(&mut self) -> Vec<Arc<Address>> {
        let mut unique: HashMap<String, Arc<Address>> = HashMap::new();
        let mut naked: HashMap<String, Arc<Address>> = HashMap::new();
        let mut list: Vec<Arc<Address>> = Vec::new();

        for link in &mut self.address_links {
            let key = link.address.key();
            if let Some(existing) = unique.get(&key) {
                link.address = existing.clone();
            } else {
                unique.insert(key, link.address.clone());
                naked.insert(link.address.naked_key(), link.address.clone());
                list.push(link.address.clone());
            }
        }

        for recipient in &mut self.remote_recipients {
            match naked.get(&recipient.naked_key()) {
                Some(same) => {
                    if !Arc::ptr_eq(recipient, same) {
                        *recipient = same.clone();
                    }
                }
                None => {
                    naked.insert(recipient.naked_key(), recipient.clone());
                    list.push(recipient.clone());
                }
            }
        }

        if let Some(sender) = &mut self.sender {
            match naked.get(&sender.naked_key()) {
                Some(same) => *sender = same.clone(),
                None => list.push(sender.clone()),
            }
        }

        list
    }

    /// Create the `messages` row, read its id, and lock-and-bump every
    /// target mailbox's uidnext/nextmodseq in ascending id order.
    async fn select_ids_and_uids(&mut self, tx: &mut Transaction) -> Result<(), InjectError> {
        let insert_handle = tx.enqueue(
            Query::new("insert into messages (id,rfc822size) values (default,$1)")
                .bind(self.message.rfc822_size()),
        );
        let id_handle = tx.enqueue(Query::new("select currval('messages_id_seq')::int as id"));
        let mut row_handles = Vec::new();
        for target in &self.targets {
            row_handles.push(tx.enqueue(
                Query::new(
                    "select uidnext, nextmodseq, first_recent \
                     from mailboxes where id=$1 for update",
                )
                .bind(target.mailbox.id()),
            ));
        }
        tx.execute();

        insert_handle.wait().await?;
        let rows = id_handle.wait().await?;
        let row = rows
            .first()
            .ok_or_else(|| DbError::query("no id from messages_id_seq"))?;
        self.message_id = row.get_int("id")? as u32;

        let mut increment_handles = Vec::new();
        for (i, handle) in row_handles.into_iter().enumerate() {
            let rows = handle.wait().await?;
            let row = rows
                .first()
                .ok_or_else(|| DbError::query("target mailbox row not found"))?;
            let uidnext = row.get_int("uidnext")? as u32;
            let modseq = row.get_bigint("nextmodseq")?;
            let first_recent = row.get_int("first_recent")? as u32;

            let target = &mut self.targets[i];
            if uidnext > UID_WARN_THRESHOLD {
                let left = 0x7fff_ffff - uidnext;
                if uidnext > UID_DISASTER_THRESHOLD {
                    tracing::error!(
                        "Mailbox {} only has {left} more usable UIDs",
                        target.mailbox.name()
                    );
                } else {
                    tracing::warn!(
                        "Mailbox {} only has {left} more usable UIDs",
                        target.mailbox.name()
                    );
                }
            }
            target.uid = uidnext;
            target.modseq = modseq;

            let mut with_recent = false;
            if uidnext == first_recent {
                if let Some(session) = target.mailbox.first_session() {
                    target.recent_in = Some(session);
                    with_recent = true;
                }
            }
            let sql = if with_recent {
                "update mailboxes set uidnext=uidnext+1,\
                 nextmodseq=nextmodseq+1,first_recent=first_recent+1 where id=$1"
            } else {
                "update mailboxes set uidnext=uidnext+1,nextmodseq=nextmodseq+1 where id=$1"
            };
            increment_handles.push(tx.enqueue(Query::new(sql).bind(target.mailbox.id())));
        }
        tx.execute();
        for handle in increment_handles {
            handle.wait().await?;
        }
        Ok(())
    }

    fn insert_messages(&mut self, tx: &mut Transaction) -> Vec<QueryHandle> {
        if self.targets.is_empty() {
            return Vec::new();
        }
        let idate = self.message.effective_internal_date().timestamp() as i32;
        let mut q = Query::copy(
            "copy mailbox_messages (mailbox,uid,message,idate,modseq) from stdin with binary",
        );
        for target in &self.targets {
            q.submit_line(vec![
                Value::Int(target.mailbox.id() as i32),
                Value::Int(target.uid as i32),
                Value::Int(self.message_id as i32),
                Value::Int(idate),
                Value::BigInt(target.modseq),
            ]);
        }
        vec![tx.enqueue(q)]
    }

    fn link_bodyparts(&mut self, tx: &mut Transaction) -> Vec<QueryHandle> {
        let mut q = Query::copy(
            "copy part_numbers (message,part,bodypart,bytes,lines) from stdin with binary",
        );
        for row in &self.part_rows {
            q.submit_line(part_number_line(self.message_id, &row.number, row));
            if row.embedded {
                let number = format!("{}.rfc822", row.number);
                q.submit_line(part_number_line(self.message_id, &number, row));
            }
        }
        vec![tx.enqueue(q)]
    }

    fn link_header_fields(
        &mut self,
        tx: &mut Transaction,
    ) -> Result<Vec<QueryHandle>, InjectError> {
        let mut q = Query::copy(
            "copy header_fields (message,part,position,field,value) from stdin with binary",
        );
        for link in &self.field_links {
            let field_id = match link.kind.well_known_id() {
                Some(id) => id,
                None => self
                    .vocab
                    .fields
                    .lookup(&link.name)
                    .ok_or_else(|| InjectError::UnresolvedName(link.name.clone()))?,
            };
            q.submit_line(vec![
                Value::Int(self.message_id as i32),
                Value::Text(link.part.clone()),
                Value::Int(link.position as i32),
                Value::Int(field_id as i32),
                Value::Text(link.value.clone()),
            ]);
        }
        Ok(vec![tx.enqueue(q)])
    }

    fn link_dates(&mut self, tx: &mut Transaction) -> Vec<QueryHandle> {
        let mut handles = Vec::new();
        for link in &self.date_links {
            handles.push(
                tx.enqueue(
                    Query::new("insert into date_fields (message,value) values ($1,$2)")
                        .bind(self.message_id)
                        .bind(link.value),
                ),
            );
        }
        handles
    }

    fn insert_deliveries(
        &mut self,
        tx: &mut Transaction,
    ) -> Result<Vec<QueryHandle>, InjectError> {
        if self.remote_recipients.is_empty() {
            return Ok(Vec::new());
        }
        let sender = self.sender.as_ref().ok_or(InjectError::MissingSender)?;
        let sender_id = sender
            .id()
            .ok_or_else(|| InjectError::UnresolvedAddress(sender.to_string()))?;

        tracing::info!(
            "Spooling message {} for delivery to {} remote recipients",
            self.message_id,
            self.remote_recipients.len()
        );

        let mut handles = Vec::new();
        handles.push(
            tx.enqueue(
                Query::new(
                    "insert into deliveries (sender,message,injected_at,expires_at) \
                     values ($1,$2,current_timestamp,current_timestamp+interval '2 days')",
                )
                .bind(sender_id)
                .bind(self.message_id),
            ),
        );
        for recipient in &self.remote_recipients {
            let recipient_id = recipient
                .id()
                .ok_or_else(|| InjectError::UnresolvedAddress(recipient.to_string()))?;
            handles.push(
                tx.enqueue(
                    Query::new(
                        "insert into delivery_recipients (delivery,recipient) values \
                         (currval(pg_get_serial_sequence('deliveries','id')),$1)",
                    )
                    .bind(recipient_id),
                ),
            );
        }
        Ok(handles)
    }

    fn link_addresses(&mut self, tx: &mut Transaction) -> Result<Vec<QueryHandle>, InjectError> {
        let mut q = Query::copy(
            "copy address_fields (message,part,position,field,number,address) \
             from stdin with binary",
        );
        for link in &self.address_links {
            let address_id = link
                .address
                .id()
                .ok_or_else(|| InjectError::UnresolvedAddress(link.address.to_string()))?;
            q.submit_line(vec![
                Value::Int(self.message_id as i32),
                Value::Text(link.part.clone()),
                Value::Int(link.position as i32),
                Value::Int(link.field_id as i32),
                Value::Int(link.number as i32),
                Value::Int(address_id as i32),
            ]);
        }
        Ok(vec![tx.enqueue(q)])
    }

    fn flag_ids(&self) -> Result<Vec<u32>, InjectError> {
        self.flags
            .iter()
            .map(|flag| {
                self.vocab
                    .flags
                    .lookup(flag)
                    .ok_or_else(|| InjectError::UnresolvedName(flag.clone()))
            })
            .collect()
    }

    fn annotation_ids(&self) -> Result<Vec<u32>, InjectError> {
        self.annotations
            .iter()
            .map(|a| {
                self.vocab
                    .annotations
                    .lookup(&a.entry_name)
                    .ok_or_else(|| InjectError::UnresolvedName(a.entry_name.clone()))
            })
            .collect()
    }

    fn link_flags(&mut self, tx: &mut Transaction, flag_ids: &[u32]) -> Vec<QueryHandle> {
        let mut handles = Vec::new();
        for flag_id in flag_ids {
            for target in &self.targets {
                handles.push(
                    tx.enqueue(
                        Query::new("insert into flags (mailbox,uid,flag) values ($1,$2,$3)")
                            .bind(target.mailbox.id())
                            .bind(target.uid)
                            .bind(*flag_id),
                    ),
                );
            }
        }
        handles
    }

    fn link_annotations(
        &mut self,
        tx: &mut Transaction,
        annotation_ids: &[u32],
    ) -> Vec<QueryHandle> {
        let mut handles = Vec::new();
        for (annotation, id) in self.annotations.iter().zip(annotation_ids) {
            for target in &self.targets {
                handles.push(
                    tx.enqueue(
                        Query::new(
                            "insert into annotations (mailbox,uid,name,value,owner) \
                             values ($1,$2,$3,$4,$5)",
                        )
                        .bind(target.mailbox.id())
                        .bind(target.uid)
                        .bind(*id)
                        .bind(annotation.value.as_str())
                        .bind(annotation.owner),
                    ),
                );
            }
        }
        handles
    }

    fn handle_wrapping(&mut self, tx: &mut Transaction) -> Vec<QueryHandle> {
        if !self.wrapped {
            return Vec::new();
        }
        for row in &self.part_rows {
            if row.number == "2" {
                if let Some(bid) = row.bid {
                    return vec![tx.enqueue(
                        Query::new("insert into unparsed_messages (bodypart) values ($1)")
                            .bind(bid),
                    )];
                }
            }
        }
        Vec::new()
    }

    /// Publish the committed injection: feed attached sessions, advance
    /// the cached mailbox counters (never backwards), and broadcast the
    /// parts that advanced to peer processes.
    fn announce(&self) {
        for target in &self.targets {
            let mailbox = &target.mailbox;
            for session in mailbox.sessions() {
                if let Some(recent) = &target.recent_in {
                    if recent.id() == session.id() {
                        session.add_recent(target.uid);
                    }
                }
                session.add_unannounced(target.uid);
            }

            let uidnext = mailbox.uidnext();
            let modseq = mailbox.nextmodseq();
            if uidnext <= target.uid && modseq <= target.modseq {
                mailbox.advance(target.uid + 1, target.modseq + 1);
                self.peer_send(format!(
                    "mailbox {:?} uidnext={} nextmodseq={}",
                    mailbox.name(),
                    mailbox.uidnext(),
                    mailbox.nextmodseq()
                ));
            } else if uidnext <= target.uid {
                mailbox.advance(target.uid + 1, modseq);
                self.peer_send(format!(
                    "mailbox {:?} uidnext={}",
                    mailbox.name(),
                    mailbox.uidnext()
                ));
            } else if modseq <= target.modseq {
                mailbox.advance(uidnext, target.modseq + 1);
                self.peer_send(format!(
                    "mailbox {:?} nextmodseq={}",
                    mailbox.name(),
                    mailbox.nextmodseq()
                ));
            }
        }
    }

    fn peer_send(&self, line: String) {
        if let Some(peers) = &self.peers {
            peers.send(line);
        }
    }
}

fn part_number_line(message_id: u32, number: &str, row: &PartRow) -> Vec<Value> {
    vec![
        Value::Int(message_id as i32),
        Value::Text(number.to_string()),
        Value::from(row.bid),
        Value::from(row.bytes),
        Value::from(row.lines),
    ]
}

fn collect_links(
    header: &Header,
    part: &str,
    fields: &mut Vec<FieldLink>,
    addresses: &mut Vec<AddressLink>,
    dates: &mut Vec<DateLink>,
    others: &mut Vec<String>,
) {
    for hf in header.fields() {
        if hf.kind() == FieldKind::Other {
            others.push(hf.name().to_string());
        }
        if hf.kind().is_address() {
            let Some(field_id) = hf.kind().well_known_id() else {
                continue;
            };
            for (number, address) in hf.addresses().iter().enumerate() {
                addresses.push(AddressLink {
                    address: address.clone(),
                    field_id,
                    part: part.to_string(),
                    position: hf.position(),
                    number: number as u32,
                });
            }
        } else {
            fields.push(FieldLink {
                name: hf.name().to_string(),
                kind: hf.kind(),
                part: part.to_string(),
                position: hf.position(),
                value: hf.value().to_string(),
            });
        }
        if part.is_empty() && hf.kind() == FieldKind::Date {
            if let Some(date) = hf.date() {
                dates.push(DateLink {
                    value: date.with_timezone(&chrono::Utc),
                });
            }
        }
    }
}
