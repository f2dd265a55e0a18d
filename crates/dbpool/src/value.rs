use crate::error::DbError;
use chrono::{DateTime, Utc};

/// The wire type of a NULL bind. PostgreSQL types every parameter, so
/// a NULL must still say what it is a NULL of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullKind {
    Int,
    BigInt,
    Text,
    Bytes,
    Bool,
    Timestamp,
}

/// A dynamically typed bind parameter or result column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    IntArray(Vec<i32>),
    Timestamp(DateTime<Utc>),
    Null(NullKind),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i32)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<Option<i32>> for Value {
    fn from(v: Option<i32>) -> Self {
        v.map(Value::Int).unwrap_or(Value::Null(NullKind::Int))
    }
}

impl From<Option<u32>> for Value {
    fn from(v: Option<u32>) -> Self {
        v.map(|v| Value::Int(v as i32))
            .unwrap_or(Value::Null(NullKind::Int))
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map(Value::BigInt).unwrap_or(Value::Null(NullKind::BigInt))
    }
}

impl From<Option<String>> for Value {
    fn from(v: Option<String>) -> Self {
        v.map(Value::Text).unwrap_or(Value::Null(NullKind::Text))
    }
}

impl From<Option<Vec<u8>>> for Value {
    fn from(v: Option<Vec<u8>>) -> Self {
        v.map(Value::Bytes).unwrap_or(Value::Null(NullKind::Bytes))
    }
}

impl From<Option<DateTime<Utc>>> for Value {
    fn from(v: Option<DateTime<Utc>>) -> Self {
        v.map(Value::Timestamp)
            .unwrap_or(Value::Null(NullKind::Timestamp))
    }
}

/// One result row, addressed by column name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cols: Vec<(String, Value)>,
}

impl Row {
    pub fn new(cols: Vec<(String, Value)>) -> Self {
        Self { cols }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.cols
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    fn required(&self, name: &str) -> Result<&Value, DbError> {
        self.get(name)
            .ok_or_else(|| DbError::Decode(format!("no column named {name}")))
    }

    pub fn get_int(&self, name: &str) -> Result<i32, DbError> {
        match self.required(name)? {
            Value::Int(v) => Ok(*v),
            other => Err(DbError::Decode(format!("column {name} is not int: {other:?}"))),
        }
    }

    pub fn get_bigint(&self, name: &str) -> Result<i64, DbError> {
        match self.required(name)? {
            Value::BigInt(v) => Ok(*v),
            Value::Int(v) => Ok(*v as i64),
            other => Err(DbError::Decode(format!(
                "column {name} is not bigint: {other:?}"
            ))),
        }
    }

    pub fn get_text(&self, name: &str) -> Result<String, DbError> {
        match self.required(name)? {
            Value::Text(v) => Ok(v.clone()),
            other => Err(DbError::Decode(format!(
                "column {name} is not text: {other:?}"
            ))),
        }
    }

    pub fn get_bytes(&self, name: &str) -> Result<Vec<u8>, DbError> {
        match self.required(name)? {
            Value::Bytes(v) => Ok(v.clone()),
            other => Err(DbError::Decode(format!(
                "column {name} is not bytea: {other:?}"
            ))),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, DbError> {
        match self.required(name)? {
            Value::Bool(v) => Ok(*v),
            other => Err(DbError::Decode(format!(
                "column {name} is not bool: {other:?}"
            ))),
        }
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>, DbError> {
        match self.required(name)? {
            Value::Null(_) => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            other => Err(DbError::Decode(format!(
                "column {name} is not text: {other:?}"
            ))),
        }
    }

    pub fn opt_int(&self, name: &str) -> Result<Option<i32>, DbError> {
        match self.required(name)? {
            Value::Null(_) => Ok(None),
            Value::Int(v) => Ok(Some(*v)),
            other => Err(DbError::Decode(format!(
                "column {name} is not int: {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn row_access() {
        let row = Row::new(vec![
            ("id".to_string(), Value::Int(42)),
            ("modseq".to_string(), Value::BigInt(7)),
            ("name".to_string(), Value::Text("inbox".to_string())),
            ("owner".to_string(), Value::Null(NullKind::Int)),
        ]);
        assert_eq!(row.get_int("id").unwrap(), 42);
        assert_eq!(row.get_bigint("modseq").unwrap(), 7);
        // int widens to bigint, as the wire sometimes does
        assert_eq!(row.get_bigint("id").unwrap(), 42);
        assert_eq!(row.get_text("name").unwrap(), "inbox");
        assert_eq!(row.opt_int("owner").unwrap(), None);
        assert!(row.get_int("missing").is_err());
    }
}
