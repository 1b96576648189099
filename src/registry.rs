//! Domain registry: hostname -> local port mappings
//!
//! The proxy, certificate provider and hosts reconciler only read from the
//! registry through the [`DomainRegistry`] trait. [`SqliteRegistry`] is the
//! concrete store used by the binaries; its mutating methods are used by the
//! `chost-domain` tool only.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// A single hostname mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEntry {
    pub hostname: String,
    pub target_port: u16,
    pub ssl_enabled: bool,
    pub proxy_enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Listener ports for the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Settings {
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            https_port: DEFAULT_HTTPS_PORT,
        }
    }
}

/// Read-only view of the hostname mappings.
///
/// Implementations must tolerate concurrent reads from many connections; the
/// core never serializes access itself.
pub trait DomainRegistry: Send + Sync {
    fn lookup(&self, hostname: &str) -> Result<Option<DomainEntry>>;

    /// All entries, sorted by hostname.
    fn list_all(&self) -> Result<Vec<DomainEntry>>;

    fn settings(&self) -> Result<Settings>;
}

/// Validate and normalize a hostname (lowercased).
///
/// Labels are 1-63 ASCII alphanumerics or hyphens, no leading or trailing
/// hyphen, 253 characters total at most.
pub fn validate_hostname(hostname: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidHostname {
        hostname: hostname.to_string(),
        reason: reason.to_string(),
    };

    if hostname.is_empty() {
        return Err(invalid("hostname cannot be empty"));
    }
    if hostname.len() > 253 {
        return Err(invalid("hostname exceeds 253 characters"));
    }
    if hostname.starts_with('.') || hostname.ends_with('.') {
        return Err(invalid("hostname cannot start or end with a dot"));
    }

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("labels must be 1-63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with a hyphen"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("only letters, digits, hyphens and dots are allowed"));
        }
    }

    Ok(hostname.to_ascii_lowercase())
}

/// Validate a target port
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(Error::InvalidPort(port)),
    }
}

/// SQLite-backed registry.
/// The connection sits behind a mutex so reads from many tasks are safe.
pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    /// Open (or create) a registry database
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;

        Ok(registry)
    }

    /// Registry backed by a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let registry = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS domains (
                hostname TEXT PRIMARY KEY,
                target_port INTEGER NOT NULL,
                ssl_enabled INTEGER NOT NULL DEFAULT 0,
                proxy_enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(())
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<DomainEntry> {
        let created_at: String = row.get(4)?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default();

        Ok(DomainEntry {
            hostname: row.get(0)?,
            target_port: row.get(1)?,
            ssl_enabled: row.get(2)?,
            proxy_enabled: row.get(3)?,
            created_at,
        })
    }

    /// Register a new hostname
    pub fn add_domain(
        &self,
        hostname: &str,
        target_port: u16,
        ssl_enabled: bool,
        proxy_enabled: bool,
    ) -> Result<DomainEntry> {
        let hostname = validate_hostname(hostname)?;
        let target_port = validate_port(u32::from(target_port))?;
        let created_at = Utc::now();

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO domains (hostname, target_port, ssl_enabled, proxy_enabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                hostname,
                target_port,
                ssl_enabled,
                proxy_enabled,
                created_at.to_rfc3339()
            ],
        )?;

        if inserted == 0 {
            return Err(Error::DuplicateDomain(hostname));
        }

        Ok(DomainEntry {
            hostname,
            target_port,
            ssl_enabled,
            proxy_enabled,
            created_at,
        })
    }

    /// Remove a hostname, returning the removed entry
    pub fn remove_domain(&self, hostname: &str) -> Result<DomainEntry> {
        let hostname = hostname.to_ascii_lowercase();
        let entry = self
            .lookup(&hostname)?
            .ok_or_else(|| Error::UnknownDomain(hostname.clone()))?;

        self.conn
            .lock()
            .execute("DELETE FROM domains WHERE hostname = ?1", params![hostname])?;

        Ok(entry)
    }

    pub fn set_ssl_enabled(&self, hostname: &str, enabled: bool) -> Result<()> {
        self.update_column(hostname, "ssl_enabled", enabled)
    }

    pub fn set_proxy_enabled(&self, hostname: &str, enabled: bool) -> Result<()> {
        self.update_column(hostname, "proxy_enabled", enabled)
    }

    pub fn set_target_port(&self, hostname: &str, port: u16) -> Result<()> {
        let port = validate_port(u32::from(port))?;
        self.update_column(hostname, "target_port", port)
    }

    fn update_column<T: rusqlite::ToSql>(&self, hostname: &str, column: &str, value: T) -> Result<()> {
        let hostname = hostname.to_ascii_lowercase();
        // column names come from the fixed set above
        let sql = format!("UPDATE domains SET {} = ?1 WHERE hostname = ?2", column);
        let affected = self.conn.lock().execute(&sql, params![value, hostname])?;

        if affected == 0 {
            return Err(Error::UnknownDomain(hostname));
        }
        Ok(())
    }

    /// Persist the listener ports
    pub fn set_ports(&self, http_port: u16, https_port: u16) -> Result<Settings> {
        let http_port = validate_port(u32::from(http_port))?;
        let https_port = validate_port(u32::from(https_port))?;

        let conn = self.conn.lock();
        for (key, value) in [("http_port", http_port), ("https_port", https_port)] {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value.to_string()],
            )?;
        }

        Ok(Settings {
            http_port,
            https_port,
        })
    }

    fn setting_port(conn: &Connection, key: &str, default: u16) -> Result<u16> {
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(default))
    }
}

impl DomainRegistry for SqliteRegistry {
    fn lookup(&self, hostname: &str) -> Result<Option<DomainEntry>> {
        let conn = self.conn.lock();

        let entry = conn
            .query_row(
                "SELECT hostname, target_port, ssl_enabled, proxy_enabled, created_at
                 FROM domains WHERE hostname = ?1",
                params![hostname.to_ascii_lowercase()],
                Self::row_to_entry,
            )
            .optional()?;

        Ok(entry)
    }

    fn list_all(&self) -> Result<Vec<DomainEntry>> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT hostname, target_port, ssl_enabled, proxy_enabled, created_at
             FROM domains ORDER BY hostname",
        )?;
        let entries = stmt
            .query_map([], Self::row_to_entry)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    fn settings(&self) -> Result<Settings> {
        let conn = self.conn.lock();

        Ok(Settings {
            http_port: Self::setting_port(&conn, "http_port", DEFAULT_HTTP_PORT)?,
            https_port: Self::setting_port(&conn, "https_port", DEFAULT_HTTPS_PORT)?,
        })
    }
}
