use async_trait::async_trait;
use tokio_postgres::{CancelToken, Client, NoTls, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::error::{RestoreError, Result};

/// Session settings every restore connection starts with.
const SETUP_QUERY: &str = "SET application_name TO 'gprestore';
SET search_path TO pg_catalog;
SET gp_enable_segment_copy_checking TO false;
SET gp_default_storage_options='';
SET statement_timeout = 0;
SET check_function_bodies = false;
SET client_min_messages = error;
SET standard_conforming_strings = on;";

/// Major version of the connected database, parsed from `SELECT version()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbVersion {
    pub major: u32,
    pub raw: String,
}

impl DbVersion {
    /// Accepts `... Greenplum Database 6.20.3 build ...` as well as a bare `6.20.3`.
    pub fn parse(raw: &str) -> Option<Self> {
        let version = match raw.find("Greenplum Database ") {
            Some(i) => &raw[i + "Greenplum Database ".len()..],
            None => raw.trim(),
        };
        let major = version
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()?;
        Some(Self {
            major,
            raw: raw.to_string(),
        })
    }

    pub fn at_least(&self, major: u32) -> bool {
        self.major >= major
    }
}

/// A fixed set of numbered connections, one per restore worker.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    fn num_conns(&self) -> usize;

    fn version(&self) -> &DbVersion;

    /// Runs `sql` on connection `which` and returns the rows affected by the
    /// last statement.
    async fn exec(&self, sql: &str, which: usize) -> Result<u64>;

    /// Cancels whatever every connection is currently executing.
    async fn cancel_all(&self);
}

struct PooledClient {
    client: tokio::sync::Mutex<Client>,
    cancel: CancelToken,
}

pub struct PgPool {
    conns: Vec<PooledClient>,
    version: DbVersion,
}

impl PgPool {
    /// Opens `num_conns` connections and applies the restore session settings.
    pub async fn connect(config: &DatabaseConfig, num_conns: usize) -> Result<Self> {
        let dbname = config.dbname.clone().ok_or_else(|| {
            RestoreError::Config("database.dbname (or PGDATABASE) is required".into())
        })?;
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .user(&config.user)
            .dbname(&dbname)
            .application_name("gprestore");
        if let Some(password) = &config.password {
            pg.password(password);
        }

        let mut conns = Vec::with_capacity(num_conns);
        for which in 0..num_conns.max(1) {
            let (client, connection) = pg.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(conn = which, "Database connection closed with error: {}", e);
                }
            });
            client.batch_execute(SETUP_QUERY).await?;
            let cancel = client.cancel_token();
            conns.push(PooledClient {
                client: tokio::sync::Mutex::new(client),
                cancel,
            });
        }

        let raw = {
            let client = conns[0].client.lock().await;
            let rows = client.simple_query("SELECT version()").await?;
            rows.into_iter()
                .find_map(|m| match m {
                    SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
                    _ => None,
                })
                .unwrap_or_default()
        };
        let version = DbVersion::parse(&raw)
            .ok_or_else(|| RestoreError::Config(format!("Cannot parse database version {:?}", raw)))?;
        debug!(version = %version.raw, conns = conns.len(), "Connected to database {}", dbname);

        Ok(Self { conns, version })
    }

    fn conn(&self, which: usize) -> Result<&PooledClient> {
        self.conns.get(which).ok_or_else(|| {
            RestoreError::Config(format!(
                "Invalid connection number: {} (pool has {} connections)",
                which,
                self.conns.len()
            ))
        })
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    fn num_conns(&self) -> usize {
        self.conns.len()
    }

    fn version(&self) -> &DbVersion {
        &self.version
    }

    async fn exec(&self, sql: &str, which: usize) -> Result<u64> {
        let conn = self.conn(which)?;
        let client = conn.client.lock().await;
        let messages = client.simple_query(sql).await?;
        Ok(messages
            .iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::CommandComplete(rows) => Some(*rows),
                _ => None,
            })
            .last()
            .unwrap_or(0))
    }

    async fn cancel_all(&self) {
        for (which, conn) in self.conns.iter().enumerate() {
            if let Err(e) = conn.cancel.cancel_query(NoTls).await {
                warn!(conn = which, "Failed to cancel query: {}", e);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        let v = DbVersion::parse(
            "PostgreSQL 9.4.26 (Greenplum Database 6.20.3 build commit:abc) on x86_64",
        )
        .unwrap();
        assert_eq!(v.major, 6);
        assert!(v.at_least(6));
        assert!(!v.at_least(7));
        assert_eq!(DbVersion::parse("7.1.0").unwrap().major, 7);
        assert!(DbVersion::parse("unknown").is_none());
    }

    #[tokio::test]
    async fn test_fake_pool_records_statements() {
        let pool = fake::FakePool::new(2).respond(|sql| {
            sql.starts_with("COPY").then_some(Ok(4))
        });
        assert_eq!(pool.exec("COPY public.foo FROM PROGRAM 'cat'", 1).await.unwrap(), 4);
        assert_eq!(pool.exec("TRUNCATE public.foo", 0).await.unwrap(), 0);
        assert_eq!(pool.statements().len(), 2);
    }
}
