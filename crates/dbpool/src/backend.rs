//! The seam between pool policy and the PostgreSQL wire protocol.
//!
//! [`PgBackend`] drives a raw `sqlx` connection: bindless statements run
//! over the simple protocol (transaction control, savepoints), bound
//! statements are prepared, and COPY streams go through `copy_in_raw`
//! with our own binary tuple encoding.

use crate::config::DbConfig;
use crate::copy::encode_copy_rows;
use crate::error::DbError;
use crate::value::{NullKind, Row, Value};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{Column, ConnectOptions, Executor, Row as _, TypeInfo};

#[async_trait]
pub trait Backend: Send {
    async fn exec(&mut self, sql: &str, binds: &[Value]) -> Result<Vec<Row>, DbError>;

    async fn exec_copy(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, DbError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Backend>, DbError>;
}

pub struct PgConnector {
    opts: PgConnectOptions,
}

impl PgConnector {
    pub fn new(config: &DbConfig) -> Self {
        let mut opts = PgConnectOptions::new()
            .username(&config.user)
            .database(&config.name);
        if !config.password.is_empty() {
            opts = opts.password(&config.password);
        }
        if config.is_unix() {
            opts = opts.socket(&config.address);
        } else {
            opts = opts.host(&config.address).port(config.port);
        }
        Self { opts }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Backend>, DbError> {
        let conn = self
            .opts
            .connect()
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?;
        Ok(Box::new(PgBackend { conn }))
    }
}

pub struct PgBackend {
    conn: PgConnection,
}

#[async_trait]
impl Backend for PgBackend {
    async fn exec(&mut self, sql: &str, binds: &[Value]) -> Result<Vec<Row>, DbError> {
        let rows = if binds.is_empty() {
            self.conn.fetch_all(sql).await
        } else {
            let mut q = sqlx::query(sql);
            for b in binds {
                q = bind_value(q, b);
            }
            q.fetch_all(&mut self.conn).await
        }
        .map_err(DbError::from_sqlx)?;

        rows.iter().map(decode_row).collect()
    }

    async fn exec_copy(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<u64, DbError> {
        let data = encode_copy_rows(rows)?;
        let mut sink = self
            .conn
            .copy_in_raw(sql)
            .await
            .map_err(DbError::from_sqlx)?;
        if let Err(err) = sink.send(data.as_slice()).await {
            let _ = sink.abort("copy stream failed").await;
            return Err(DbError::from_sqlx(err));
        }
        sink.finish().await.map_err(DbError::from_sqlx)
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(q: PgQuery<'q>, v: &'q Value) -> PgQuery<'q> {
    match v {
        Value::Int(i) => q.bind(*i),
        Value::BigInt(i) => q.bind(*i),
        Value::Text(s) => q.bind(s.as_str()),
        Value::Bytes(b) => q.bind(b.as_slice()),
        Value::Bool(b) => q.bind(*b),
        Value::IntArray(a) => q.bind(a.as_slice()),
        Value::Timestamp(t) => q.bind(*t),
        Value::Null(NullKind::Int) => q.bind(Option::<i32>::None),
        Value::Null(NullKind::BigInt) => q.bind(Option::<i64>::None),
        Value::Null(NullKind::Text) => q.bind(Option::<String>::None),
        Value::Null(NullKind::Bytes) => q.bind(Option::<Vec<u8>>::None),
        Value::Null(NullKind::Bool) => q.bind(Option::<bool>::None),
        Value::Null(NullKind::Timestamp) => q.bind(Option::<DateTime<Utc>>::None),
    }
}

fn decode_row(row: &PgRow) -> Result<Row, DbError> {
    let mut cols = Vec::with_capacity(row.columns().len());
    for (i, col) in row.columns().iter().enumerate() {
        let type_name = col.type_info().name().to_string();
        let (value, null_kind) = match type_name.as_str() {
            "INT2" => (
                row.try_get::<Option<i16>, _>(i)
                    .map(|o| o.map(|v| Value::Int(v as i32))),
                NullKind::Int,
            ),
            "INT4" | "OID" => (
                row.try_get::<Option<i32>, _>(i).map(|o| o.map(Value::Int)),
                NullKind::Int,
            ),
            "INT8" => (
                row.try_get::<Option<i64>, _>(i)
                    .map(|o| o.map(Value::BigInt)),
                NullKind::BigInt,
            ),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => (
                row.try_get::<Option<String>, _>(i)
                    .map(|o| o.map(Value::Text)),
                NullKind::Text,
            ),
            "BYTEA" => (
                row.try_get::<Option<Vec<u8>>, _>(i)
                    .map(|o| o.map(Value::Bytes)),
                NullKind::Bytes,
            ),
            "BOOL" => (
                row.try_get::<Option<bool>, _>(i)
                    .map(|o| o.map(Value::Bool)),
                NullKind::Bool,
            ),
            "TIMESTAMPTZ" => (
                row.try_get::<Option<DateTime<Utc>>, _>(i)
                    .map(|o| o.map(Value::Timestamp)),
                NullKind::Timestamp,
            ),
            "TIMESTAMP" => (
                row.try_get::<Option<NaiveDateTime>, _>(i).map(|o| {
                    o.map(|naive| {
                        Value::Timestamp(DateTime::from_naive_utc_and_offset(naive, Utc))
                    })
                }),
                NullKind::Timestamp,
            ),
            other => {
                return Err(DbError::Decode(format!(
                    "unhandled column type {other} for column {}",
                    col.name()
                )))
            }
        };
        let value = value
            .map_err(|e| DbError::Decode(e.to_string()))?
            .unwrap_or(Value::Null(null_kind));
        cols.push((col.name().to_string(), value));
    }
    Ok(Row::new(cols))
}
