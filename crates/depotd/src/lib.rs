//! depotd — the maildepot store daemon.
//!
//! The heart of this crate is the message injector: the transactional
//! pipeline that persists one parsed message into one or more mailboxes,
//! assigns per-mailbox UIDs and modseqs under row locks, deduplicates
//! bodyparts by content hash, resolves flag/annotation/field-name and
//! address vocabularies race-tolerantly, queues remote deliveries, and
//! announces committed state to live sessions and peer processes.

pub mod config;
pub mod inject;
pub mod mailbox;
pub mod metrics;
pub mod peers;
pub mod undelete;
pub mod vocab;
