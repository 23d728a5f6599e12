//! Custom command plug-ins.
//!
//! A plug-in exposes construction from an optional args string plus
//! `execute(client)` invoked once per operation. The engine never parses the
//! args; they reach the plug-in unchanged. Plug-ins are resolved by the file
//! stem of `--custom-command-file` against a compile-time registry, the
//! static-build rendition of the original's load-by-path.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{ClientError, KvClient};

#[async_trait]
pub trait CustomCommand: Send + Sync + std::fmt::Debug {
    async fn execute(&self, client: &mut dyn KvClient) -> Result<(), ClientError>;
}

/// Resolve a plug-in. With no path the default batch-HMGET command is used.
pub fn load(
    path: Option<&Path>,
    args: Option<&str>,
) -> Result<Arc<dyn CustomCommand>, UnknownCommand> {
    let Some(path) = path else {
        return Ok(Arc::new(HmgetBatch::new(args)));
    };
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    match stem {
        "hmget_batch" => Ok(Arc::new(HmgetBatch::new(args))),
        "set_probe" => Ok(Arc::new(SetProbe::new(args))),
        other => Err(UnknownCommand(other.to_string())),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown custom command {0:?}; built-ins: hmget_batch, set_probe")]
pub struct UnknownCommand(pub String);

/// Reads a batch of hash fields per execution, one HMGET per hash key.
///
/// Args string: optional decimal batch size (default 500).
#[derive(Debug)]
pub struct HmgetBatch {
    keys: Vec<String>,
    fields: Vec<Vec<String>>,
}

impl HmgetBatch {
    const DEFAULT_BATCH: usize = 500;
    const HASH_KEY_SIZE: usize = 10;
    const FIELD_KEY_SIZE: usize = 8;

    pub fn new(args: Option<&str>) -> Self {
        let batch = args
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(Self::DEFAULT_BATCH);
        let keys = (0..batch)
            .map(|i| truncated_key("h", i, Self::HASH_KEY_SIZE))
            .collect();
        let fields = (0..batch)
            .map(|i| vec![truncated_key("f", i, Self::FIELD_KEY_SIZE)])
            .collect();
        Self { keys, fields }
    }
}

#[async_trait]
impl CustomCommand for HmgetBatch {
    async fn execute(&self, client: &mut dyn KvClient) -> Result<(), ClientError> {
        for (key, fields) in self.keys.iter().zip(&self.fields) {
            client.hmget(key, fields).await?;
        }
        Ok(())
    }
}

/// Writes one fixed key per execution; the smallest useful probe.
#[derive(Debug)]
pub struct SetProbe {
    key: String,
    value: Vec<u8>,
}

impl SetProbe {
    pub fn new(args: Option<&str>) -> Self {
        let value = args.unwrap_or("custom:value").as_bytes().to_vec();
        Self {
            key: "custom:key".to_string(),
            value,
        }
    }
}

#[async_trait]
impl CustomCommand for SetProbe {
    async fn execute(&self, client: &mut dyn KvClient) -> Result<(), ClientError> {
        client.set(&self.key, &self.value).await
    }
}

fn truncated_key(prefix: &str, index: usize, size: usize) -> String {
    let mut key = format!("{prefix}:{index}");
    key.truncate(size);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;
    use crate::client::ConnectFactory as _;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    #[test]
    fn load_resolves_by_file_stem() {
        assert!(load(Some(Path::new("/plugins/hmget_batch.rs")), None).is_ok());
        assert!(load(Some(Path::new("set_probe.py")), None).is_ok());
        assert!(load(None, None).is_ok());

        let err = load(Some(&PathBuf::from("nope.so")), None).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn hmget_batch_parses_size_from_args() {
        let command = HmgetBatch::new(Some("3"));
        assert_eq!(command.keys.len(), 3);
        // Junk args fall back to the default.
        assert_eq!(HmgetBatch::new(Some("lots")).keys.len(), 500);
        assert_eq!(HmgetBatch::new(None).keys.len(), 500);
    }

    #[test]
    fn keys_are_truncated_to_their_budget() {
        let command = HmgetBatch::new(Some("2000"));
        assert!(command.keys.iter().all(|k| k.len() <= 10));
        assert!(command.fields.iter().all(|f| f[0].len() <= 8));
    }

    #[tokio::test]
    async fn hmget_batch_issues_one_call_per_key() {
        let factory = MockFactory::new();
        let mut client = factory.connect().await.unwrap();
        let command = HmgetBatch::new(Some("5"));
        command.execute(client.as_mut()).await.unwrap();
        assert_eq!(factory.backend.calls.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn set_probe_writes_its_args() {
        let factory = MockFactory::new();
        let mut client = factory.connect().await.unwrap();
        SetProbe::new(Some("payload"))
            .execute(client.as_mut())
            .await
            .unwrap();
        assert_eq!(
            factory.backend.data.lock().unwrap().get("custom:key"),
            Some(&b"payload".to_vec())
        );
    }
}
