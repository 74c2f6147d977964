//! Purpose: Provide the Redis-backed `StoreClient` over a bounded connection pool.
//! Exports: `ClientConfig`, `RedisClient`.
//! Role: Production transport for dump/restore; owns host, auth, db, timeouts, pool sizing.
//! Invariants: Every pooled connection is named, selected to the configured db, and PINGed once.
//! Invariants: Connections are PINGed on checkout and recycled after `max_lifetime`.
//! Invariants: `connect` fails with `Connection` before any pipeline work if Redis is unreachable.
#![allow(clippy::result_large_err)]

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use redis::ConnectionLike;
use tracing::{debug, trace};
use url::Url;

use crate::core::client::{Reply, StoreClient};
use crate::core::error::{ApiResult, Error, ErrorKind};

pub const DEFAULT_PORT: u16 = 6379;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 50;
pub const DEFAULT_MIN_IDLE: u32 = 10;
pub const MAX_DATABASE: u8 = 16;

/// Name set with `CLIENT SETNAME` on every pooled connection.
pub const CLIENT_NAME: &str = "redump";

/// Connection settings for a Redis server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub auth: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_connections: u32,
    pub min_idle: u32,
    pub max_lifetime: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database: 0,
            auth: None,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            min_idle: DEFAULT_MIN_IDLE,
            max_lifetime: Duration::from_secs(120),
        }
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = database;
        self
    }

    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        let auth = auth.into();
        self.auth = (!auth.is_empty()).then_some(auth);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, min_idle: u32, max_connections: u32) -> Self {
        self.min_idle = min_idle;
        self.max_connections = max_connections;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> ApiResult<()> {
        if self.host.trim().is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("host must not be empty"));
        }
        if self.database > MAX_DATABASE {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("database must be between 0 and {MAX_DATABASE}")));
        }
        if self.max_connections == 0 {
            return Err(
                Error::new(ErrorKind::Usage).with_message("max connections must be at least 1")
            );
        }
        if self.min_idle > self.max_connections {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("min idle connections must not exceed max connections"));
        }
        if self.connect_timeout.is_zero() || self.read_timeout.is_zero() {
            return Err(Error::new(ErrorKind::Usage).with_message("timeouts must be positive"));
        }
        Ok(())
    }

    /// `redis://[:password@]host:port/db`, with the password percent-encoded.
    pub fn connection_url(&self) -> ApiResult<Url> {
        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let mut url = Url::parse(&format!("redis://{host}:{}/{}", self.port, self.database))
            .map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message("invalid redis host")
                    .with_source(err)
            })?;
        if let Some(auth) = &self.auth {
            url.set_password(Some(auth.as_str())).map_err(|()| {
                Error::new(ErrorKind::Usage).with_message("cannot attach password to redis url")
            })?;
        }
        Ok(url)
    }
}

/// Pooled Redis client. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct RedisClient {
    inner: Arc<RedisClientInner>,
}

struct RedisClientInner {
    address: String,
    pool: RwLock<Option<r2d2::Pool<ConnectionManager>>>,
}

struct ConnectionManager {
    client: redis::Client,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl r2d2::ManageConnection for ConnectionManager {
    type Connection = redis::Connection;
    type Error = redis::RedisError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let mut conn = self.client.get_connection_with_timeout(self.connect_timeout)?;
        conn.set_read_timeout(Some(self.read_timeout))?;
        conn.set_write_timeout(Some(self.read_timeout))?;
        redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(CLIENT_NAME)
            .query::<()>(&mut conn)?;
        redis::cmd("PING").query::<()>(&mut conn)?;
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        redis::cmd("PING").query::<()>(conn)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_open()
    }
}

impl RedisClient {
    /// Build the pool and verify the server answers `PING`.
    pub fn connect(config: &ClientConfig) -> ApiResult<Self> {
        config.validate()?;
        let address = config.address();
        let url = config.connection_url()?;
        let client = redis::Client::open(url.as_str()).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid redis connection settings")
                .with_source(err)
        })?;
        let manager = ConnectionManager {
            client,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
        };
        let pool = r2d2::Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(config.min_idle))
            .max_lifetime(Some(config.max_lifetime))
            .connection_timeout(config.connect_timeout)
            .test_on_check_out(true)
            .build(manager)
            .map_err(|err| {
                Error::new(ErrorKind::Connection)
                    .with_message(format!("failed to connect to redis at {address}"))
                    .with_source(err)
            })?;

        let client = Self {
            inner: Arc::new(RedisClientInner {
                address,
                pool: RwLock::new(Some(pool)),
            }),
        };
        client.ping()?;
        debug!(
            address = %client.inner.address,
            db = config.database,
            max_connections = config.max_connections,
            "redis pool ready"
        );
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    fn pool(&self) -> ApiResult<r2d2::Pool<ConnectionManager>> {
        let guard = self
            .inner
            .pool
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone().ok_or_else(|| {
            Error::new(ErrorKind::Connection)
                .with_message(format!("client for {} is closed", self.inner.address))
        })
    }
}

impl StoreClient for RedisClient {
    fn execute(&self, command: &str, args: &[&[u8]]) -> ApiResult<Reply> {
        let pool = self.pool()?;
        let mut conn = pool.get().map_err(|err| {
            Error::new(ErrorKind::Connection)
                .with_message(format!(
                    "no connection available to {}",
                    self.inner.address
                ))
                .with_source(err)
        })?;
        let mut cmd = redis::cmd(command);
        for arg in args {
            cmd.arg(*arg);
        }
        let value: redis::Value = cmd
            .query(&mut *conn)
            .map_err(|err| map_redis_error(command, err))?;
        trace!(command, args = args.len(), "command completed");
        Ok(reply_from_value(value))
    }

    fn close(&self) -> ApiResult<()> {
        let mut guard = self
            .inner
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!(address = %self.inner.address, "redis pool released");
        }
        Ok(())
    }
}

fn map_redis_error(command: &str, err: redis::RedisError) -> Error {
    let kind = if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        ErrorKind::Connection
    } else if err.kind() == redis::ErrorKind::TypeError {
        ErrorKind::Protocol
    } else {
        ErrorKind::Command
    };
    Error::new(kind)
        .with_message(format!("{command} failed"))
        .with_source(err)
}

fn reply_from_value(value: redis::Value) -> Reply {
    match value {
        redis::Value::Nil => Reply::Nil,
        redis::Value::Int(value) => Reply::Int(value),
        redis::Value::BulkString(bytes) => Reply::Bulk(bytes),
        redis::Value::Array(items) => {
            Reply::Array(items.into_iter().map(reply_from_value).collect())
        }
        redis::Value::SimpleString(status) => Reply::Status(status),
        redis::Value::Okay => Reply::Status("OK".to_string()),
        other => Reply::Other(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientConfig, ConnectionManager, Reply, reply_from_value};
    use crate::core::error::ErrorKind;
    use std::time::Duration;

    #[test]
    fn connection_manager_is_an_r2d2_manager() {
        fn assert_manager<M: r2d2::ManageConnection>() {}
        assert_manager::<ConnectionManager>();
    }

    #[test]
    fn connection_url_includes_port_and_db() {
        let config = ClientConfig::new("localhost", 6380).with_database(3);
        let url = config.connection_url().expect("url");
        assert_eq!(url.as_str(), "redis://localhost:6380/3");
        assert_eq!(url.password(), None);
    }

    #[test]
    fn connection_url_percent_encodes_password() {
        let config = ClientConfig::new("localhost", 6379).with_auth("p@ss word");
        let url = config.connection_url().expect("url");
        assert!(url.password().is_some());
        assert!(!url.as_str().contains("p@ss word"));
        assert!(url.as_str().ends_with("@localhost:6379/0"));
    }

    #[test]
    fn empty_auth_means_no_password() {
        let config = ClientConfig::new("localhost", 6379).with_auth("");
        assert!(config.auth.is_none());
    }

    #[test]
    fn connection_url_brackets_ipv6_hosts() {
        let config = ClientConfig::new("::1", 6379);
        let url = config.connection_url().expect("url");
        assert_eq!(url.as_str(), "redis://[::1]:6379/0");
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let cases = [
            ClientConfig::new("", 6379),
            ClientConfig::new("localhost", 6379).with_database(17),
            ClientConfig::new("localhost", 6379).with_pool_size(0, 0),
            ClientConfig::new("localhost", 6379).with_pool_size(11, 10),
            ClientConfig::new("localhost", 6379).with_connect_timeout(Duration::ZERO),
        ];
        for config in cases {
            let err = config.validate().expect_err("invalid");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
        ClientConfig::new("localhost", 6379)
            .with_database(16)
            .validate()
            .expect("valid");
    }

    #[test]
    fn converts_nested_values() {
        let value = redis::Value::Array(vec![
            redis::Value::BulkString(b"0".to_vec()),
            redis::Value::Array(vec![redis::Value::BulkString(b"k".to_vec())]),
        ]);
        assert_eq!(
            reply_from_value(value),
            Reply::Array(vec![
                Reply::Bulk(b"0".to_vec()),
                Reply::Array(vec![Reply::Bulk(b"k".to_vec())]),
            ])
        );
        assert_eq!(reply_from_value(redis::Value::Nil), Reply::Nil);
        assert_eq!(
            reply_from_value(redis::Value::Okay),
            Reply::Status("OK".to_string())
        );
    }
}
