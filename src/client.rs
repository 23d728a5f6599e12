//! The client seam between the engine and the datastore library.
//!
//! The engine only ever talks to [`KvClient`], so the hot loop is agnostic to
//! standalone vs cluster deployments, and tests can drive the whole pipeline
//! against an in-memory backend. The production implementations wrap the
//! `redis` crate's multiplexed and cluster-async connections; both timeouts
//! (`connection_timeout`, `request_timeout`) are enforced here with
//! `tokio::time::timeout` so the worker loop never blocks past its budget.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::cluster::ClusterClientBuilder;
use thiserror::Error;

/// Errors surfaced by client construction or individual calls.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("request timed out after {timeout:?}")]
    RequestTimeout { timeout: Duration },
    #[error("{0}")]
    Command(#[from] redis::RedisError),
    #[error("{0}")]
    Other(String),
}

/// The operations the harness exercises against the datastore.
#[async_trait]
pub trait KvClient: Send {
    async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError>;
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, ClientError>;
    async fn hmget(
        &mut self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, ClientError>;
}

/// Builds fresh client handles for the pool.
#[async_trait]
pub trait ConnectFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn KvClient>, ClientError>;
}

/// Connection parameters for the redis-backed factory.
#[derive(Debug, Clone)]
pub struct RedisFactory {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub cluster: bool,
    pub read_from_replica: bool,
    pub connection_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl RedisFactory {
    fn url(&self) -> String {
        let scheme = if self.tls { "rediss" } else { "redis" };
        format!("{scheme}://{}:{}/", self.host, self.port)
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl ConnectFactory for RedisFactory {
    async fn connect(&self) -> Result<Box<dyn KvClient>, ClientError> {
        let addr = self.addr();
        if self.cluster {
            let mut builder = ClusterClientBuilder::new(vec![self.url()]);
            if self.read_from_replica {
                builder = builder.read_from_replicas();
            }
            let client = builder.build().map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
            let conn = bounded_connect(self.connection_timeout, &addr, client.get_async_connection())
                .await?;
            Ok(Box::new(RedisKvClient {
                conn,
                request_timeout: self.request_timeout,
            }))
        } else {
            if self.read_from_replica {
                tracing::debug!("read-from-replica has no effect on a standalone connection");
            }
            let client =
                redis::Client::open(self.url().as_str()).map_err(|source| ClientError::Connect {
                    addr: addr.clone(),
                    source,
                })?;
            let conn = bounded_connect(
                self.connection_timeout,
                &addr,
                client.get_multiplexed_async_connection(),
            )
            .await?;
            Ok(Box::new(RedisKvClient {
                conn,
                request_timeout: self.request_timeout,
            }))
        }
    }
}

async fn bounded_connect<C>(
    limit: Option<Duration>,
    addr: &str,
    fut: impl Future<Output = redis::RedisResult<C>>,
) -> Result<C, ClientError> {
    match limit {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(|source| ClientError::Connect {
                addr: addr.to_string(),
                source,
            }),
            Err(_) => Err(ClientError::ConnectTimeout {
                addr: addr.to_string(),
                timeout,
            }),
        },
        None => fut.await.map_err(|source| ClientError::Connect {
            addr: addr.to_string(),
            source,
        }),
    }
}

async fn bounded_call<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, ClientError> {
    match limit {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(ClientError::from),
            Err(_) => Err(ClientError::RequestTimeout { timeout }),
        },
        None => fut.await.map_err(ClientError::from),
    }
}

/// One handle over either a multiplexed or a cluster connection.
struct RedisKvClient<C> {
    conn: C,
    request_timeout: Option<Duration>,
}

#[async_trait]
impl<C> KvClient for RedisKvClient<C>
where
    C: redis::aio::ConnectionLike + Send,
{
    async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        let cmd = redis::cmd("SET").arg(key).arg(value).to_owned();
        bounded_call(self.request_timeout, cmd.query_async(&mut self.conn)).await
    }

    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
        let cmd = redis::cmd("GET").arg(key).to_owned();
        bounded_call(self.request_timeout, cmd.query_async(&mut self.conn)).await
    }

    async fn hmget(
        &mut self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<Vec<u8>>>, ClientError> {
        let cmd = redis::cmd("HMGET").arg(key).arg(fields).to_owned();
        bounded_call(self.request_timeout, cmd.query_async(&mut self.conn)).await
    }
}

#[cfg(test)]
pub mod mock {
    //! In-memory client used by pool, worker and orchestrator tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    /// Shared state behind every mock handle produced by one factory.
    #[derive(Default)]
    pub struct MockBackend {
        pub data: Mutex<HashMap<String, Vec<u8>>>,
        pub calls: AtomicU64,
        /// When set, every call fails with this error text.
        pub fail_calls_with: Mutex<Option<String>>,
        /// Number of upcoming connect attempts that should fail.
        pub connect_failures: AtomicU64,
        pub connects: AtomicU64,
    }

    impl MockBackend {
        pub fn fail_calls(&self, text: &str) {
            *self.fail_calls_with.lock().unwrap() = Some(text.to_string());
        }

        fn check(&self) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.fail_calls_with.lock().unwrap().as_ref() {
                Some(text) => Err(ClientError::Other(text.clone())),
                None => Ok(()),
            }
        }
    }

    pub struct MockClient {
        backend: Arc<MockBackend>,
    }

    #[async_trait]
    impl KvClient for MockClient {
        async fn set(&mut self, key: &str, value: &[u8]) -> Result<(), ClientError> {
            self.backend.check()?;
            self.backend
                .data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, ClientError> {
            self.backend.check()?;
            Ok(self.backend.data.lock().unwrap().get(key).cloned())
        }

        async fn hmget(
            &mut self,
            key: &str,
            fields: &[String],
        ) -> Result<Vec<Option<Vec<u8>>>, ClientError> {
            self.backend.check()?;
            let _ = key;
            Ok(fields.iter().map(|_| None).collect())
        }
    }

    #[derive(Default)]
    pub struct MockFactory {
        pub backend: Arc<MockBackend>,
    }

    impl MockFactory {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ConnectFactory for MockFactory {
        async fn connect(&self) -> Result<Box<dyn KvClient>, ClientError> {
            self.backend.connects.fetch_add(1, Ordering::Relaxed);
            let failures = self.backend.connect_failures.load(Ordering::Relaxed);
            if failures > 0 {
                self.backend
                    .connect_failures
                    .store(failures - 1, Ordering::Relaxed);
                return Err(ClientError::Other("mock connect refused".to_string()));
            }
            Ok(Box::new(MockClient {
                backend: Arc::clone(&self.backend),
            }))
        }
    }
}
