use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Mysql,
    Postgres,
    Oracle,
    #[default]
    Generic,
}

impl Dialect {
    /// Unknown tags fall back to the generic dialect.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mysql" => Dialect::Mysql,
            "postgres" | "postgresql" => Dialect::Postgres,
            "oracle" => Dialect::Oracle,
            _ => Dialect::Generic,
        }
    }

    /// Whether result sets are paged with `LIMIT`/`OFFSET` rather than by key.
    pub fn pages_by_offset(self) -> bool {
        matches!(self, Dialect::Mysql | Dialect::Postgres)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Mysql => write!(f, "mysql"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Oracle => write!(f, "oracle"),
            Dialect::Generic => write!(f, "generic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            Value::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            Value::Text(value) => value.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Text(value) => value.into_bytes(),
            Value::Blob(value) => value,
            other => other.to_string().into_bytes(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Integer(value) => write!(f, "{value}"),
            Value::Real(value) => write!(f, "{value}"),
            Value::Text(value) => f.write_str(value),
            Value::Blob(value) => f.write_str(&String::from_utf8_lossy(value)),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct SqlError {
    pub message: String,
}

impl SqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for SqlError {
    fn from(err: rusqlite::Error) -> Self {
        Self::new(err.to_string())
    }
}

pub trait MartConnection {
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        max_rows: Option<usize>,
    ) -> Result<ResultSet, SqlError>;
}

pub trait DataSource {
    fn name(&self) -> &str;
    fn dialect(&self) -> Dialect;
    fn connect(&self) -> Result<Box<dyn MartConnection>, SqlError>;
}

/// A mart stored in a SQLite file, opened read-only.
///
/// The dialect is a tag, not a property of the file: it selects which pagination
/// strategy the runners use against this source.
#[derive(Debug, Clone)]
pub struct SqliteDataSource {
    name: String,
    path: Utf8PathBuf,
    dialect: Dialect,
}

impl SqliteDataSource {
    pub fn new(path: impl Into<Utf8PathBuf>, dialect: Dialect) -> Self {
        let path = path.into();
        let name = path.file_stem().unwrap_or("mart").to_string();
        Self {
            name,
            path,
            dialect,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl DataSource for SqliteDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn connect(&self) -> Result<Box<dyn MartConnection>, SqlError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(self.path.as_std_path(), flags)
            .map_err(|err| SqlError::new(format!("open {}: {err}", self.path)))?;
        tracing::debug!(source = %self.name, path = %self.path, "opened connection");
        Ok(Box::new(SqliteConnection { connection }))
    }
}

struct SqliteConnection {
    connection: Connection,
}

impl MartConnection for SqliteConnection {
    fn query(
        &mut self,
        sql: &str,
        params: &[Value],
        max_rows: Option<usize>,
    ) -> Result<ResultSet, SqlError> {
        let mut statement = self.connection.prepare_cached(sql)?;
        let columns = statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let width = columns.len();

        let mut rows = statement.query(params_from_iter(params.iter().map(to_sqlite)))?;
        let mut out = Vec::new();
        loop {
            if max_rows.is_some_and(|max| out.len() >= max) {
                break;
            }
            let Some(row) = rows.next()? else {
                break;
            };
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(from_sqlite(row.get_ref(index)?));
            }
            out.push(values);
        }

        Ok(ResultSet { columns, rows: out })
    }
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Integer(value) => SqliteValue::Integer(*value),
        Value::Real(value) => SqliteValue::Real(*value),
        Value::Text(value) => SqliteValue::Text(value.clone()),
        Value::Blob(value) => SqliteValue::Blob(value.clone()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(value) => Value::Integer(value),
        ValueRef::Real(value) => Value::Real(value),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}
