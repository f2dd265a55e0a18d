use crate::error::DbError;
use serde::Deserialize;

fn default_backend() -> String {
    "postgres".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_start_handles() -> usize {
    3
}

fn default_max_handles() -> usize {
    4
}

fn default_handle_interval() -> u64 {
    30
}

/// The `[database]` section of the server configuration.
#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// `pg`, `pgsql` or `postgres`, optionally suffixed `+tsearch2`.
    /// Anything else is a startup disaster.
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Host name, or an absolute path to a Unix socket directory.
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub name: String,
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Handles created at startup.
    #[serde(default = "default_start_handles")]
    pub start_handles: usize,

    #[serde(default = "default_max_handles")]
    pub max_handles: usize,

    /// Minimum seconds between creating new handles under load.
    #[serde(default = "default_handle_interval")]
    pub handle_interval: u64,
}

impl DbConfig {
    pub fn is_unix(&self) -> bool {
        self.address.starts_with('/')
    }

    /// Validate the configured backend type. The store supports exactly
    /// one backend; naming anything else refuses startup.
    pub fn validate_backend(&self) -> Result<(), DbError> {
        let lower = self.backend.to_ascii_lowercase();
        let (base, ext) = match lower.split_once('+') {
            Some((base, ext)) => (base, ext),
            None => (lower.as_str(), ""),
        };
        let base_ok = matches!(base, "pg" | "pgsql" | "postgres");
        let ext_ok = ext.is_empty() || ext == "tsearch2";
        if base_ok && ext_ok {
            Ok(())
        } else {
            Err(DbError::Config(format!(
                "Unsupported database type: {}",
                self.backend
            )))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg(backend: &str) -> DbConfig {
        DbConfig {
            backend: backend.to_string(),
            address: "127.0.0.1".to_string(),
            port: 5432,
            name: "depot".to_string(),
            user: "depot".to_string(),
            password: String::new(),
            start_handles: 3,
            max_handles: 4,
            handle_interval: 30,
        }
    }

    #[test]
    fn backend_validation() {
        for ok in ["pg", "pgsql", "postgres", "postgres+tsearch2", "PgSql"] {
            assert!(cfg(ok).validate_backend().is_ok(), "{ok}");
        }
        for bad in ["mysql", "sqlite", "postgres+gin", "oracle+tsearch2"] {
            assert!(cfg(bad).validate_backend().is_err(), "{bad}");
        }
    }

    #[test]
    fn unix_detection() {
        assert!(cfg("pg").validate_backend().is_ok());
        let mut c = cfg("pg");
        c.address = "/var/run/postgresql".to_string();
        assert!(c.is_unix());
        assert!(!cfg("pg").is_unix());
    }
}
