//! Scripted backends for exercising pool policy, transaction semantics
//! and the savepoint retry loops without a PostgreSQL server.

use crate::backend::{Backend, Connector};
use crate::error::DbError;
use crate::value::{Row, Value};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;

pub fn row(cols: &[(&str, Value)]) -> Row {
    Row::new(
        cols.iter()
            .map(|(n, v)| (n.to_string(), v.clone()))
            .collect(),
    )
}

struct Rule {
    needle: String,
    responses: VecDeque<Result<Vec<Row>, DbError>>,
}

/// A backend that answers queries from a script. Each rule matches
/// statements containing `needle` and yields its queued responses in
/// order; once a rule runs dry, later rules (or the default empty result)
/// take over. Every executed statement is recorded.
pub struct ScriptedBackend {
    rules: Vec<Rule>,
    log: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Semaphore>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            log: Arc::new(Mutex::new(Vec::new())),
            gate: None,
        }
    }

    pub fn on(mut self, needle: &str, responses: Vec<Result<Vec<Row>, DbError>>) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            responses: responses.into(),
        });
        self
    }

    /// Block each statement on a semaphore permit. Tests hold the permits
    /// to keep the handle busy.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    fn respond(&mut self, sql: &str) -> Result<Vec<Row>, DbError> {
        self.log.lock().push(sql.to_string());
        for rule in &mut self.rules {
            if sql.contains(&rule.needle) {
                if let Some(response) = rule.responses.pop_front() {
                    return response;
                }
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn exec(&mut self, sql: &str, _binds: &[Value]) -> Result<Vec<Row>, DbError> {
        if let Some(gate) = &self.gate {
            let permit = gate.clone().acquire_owned().await;
            drop(permit);
        }
        self.respond(sql)
    }

    async fn exec_copy(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, DbError> {
        if let Some(gate) = &self.gate {
            let permit = gate.clone().acquire_owned().await;
            drop(permit);
        }
        self.respond(sql).map(|_| rows.len() as u64)
    }
}

/// Hands out pre-built backends; connection attempts fail once the supply
/// is exhausted.
pub struct ScriptedConnector {
    backends: Mutex<VecDeque<ScriptedBackend>>,
}

impl ScriptedConnector {
    pub fn new(backends: Vec<ScriptedBackend>) -> Arc<Self> {
        Arc::new(Self {
            backends: Mutex::new(backends.into()),
        })
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Backend>, DbError> {
        match self.backends.lock().pop_front() {
            Some(backend) => Ok(Box::new(backend)),
            None => Err(DbError::Connect("no scripted backend available".to_string())),
        }
    }
}

/// A config suitable for scripted tests.
pub fn test_config(start_handles: usize, max_handles: usize) -> crate::DbConfig {
    crate::DbConfig {
        backend: "postgres".to_string(),
        address: "127.0.0.1".to_string(),
        port: 5432,
        name: "depot".to_string(),
        user: "depot".to_string(),
        password: String::new(),
        start_handles,
        max_handles,
        handle_interval: 0,
    }
}
