//! Small JSON-file backed key/value caches.
//!
//! Each cache is a single flat JSON object on disk that is rewritten whole on every write.
//! A missing or unparseable file is treated as an empty cache and immediately repaired, so
//! reads never fail because of what's in the file. There is no file locking; a single
//! operator process is assumed.

use eyre::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// The in-memory form of a cache file.
pub type Mapping<V> = BTreeMap<String, V>;

/// How many times [`Cache::update`] re-merges when the file changes underneath it.
const MAX_MERGE_ATTEMPTS: usize = 5;

/// A typed handle onto one cache file.
#[derive(Debug, Clone)]
pub struct Cache<V> {
    path: PathBuf,
    _value: PhantomData<fn() -> V>,
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _value: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole mapping.
    ///
    /// If the file is missing or does not hold a JSON object of the expected shape, an empty
    /// mapping is persisted in its place and returned.
    pub async fn get(&self) -> eyre::Result<Mapping<V>> {
        let raw = self.read_raw().await?;
        match raw.as_deref().map(serde_json::from_slice::<Mapping<V>>) {
            Some(Ok(mapping)) => Ok(mapping),
            Some(Err(e)) => {
                tracing::warn!(path = %self.path.display(), error = %e, "resetting corrupt cache file");
                self.reset().await
            }
            None => {
                tracing::debug!(path = %self.path.display(), "creating missing cache file");
                self.reset().await
            }
        }
    }

    /// Looks up a single key.
    pub async fn lookup(&self, key: &str) -> eyre::Result<Option<V>> {
        Ok(self.get().await?.remove(key))
    }

    /// Overwrites the file with exactly `mapping`.
    ///
    /// This is not a merge: keys absent from `mapping` are lost. Use [`Cache::update`] to
    /// change individual entries.
    pub async fn put(&self, mapping: &Mapping<V>) -> eyre::Result<()> {
        let bytes = serde_json::to_vec(mapping).context("serialize cache contents")?;
        self.write_raw(&bytes).await
    }

    /// Applies `merge` to the current mapping and writes the result back.
    ///
    /// The file is read again just before writing. If its contents changed since the mapping
    /// was loaded, the merge is re-applied to the fresh contents so that entries written in the
    /// meantime are kept.
    pub async fn update<F>(&self, mut merge: F) -> eyre::Result<Mapping<V>>
    where
        F: FnMut(&mut Mapping<V>),
    {
        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            let snapshot = self.read_raw().await?;
            let mut mapping = snapshot
                .as_deref()
                .and_then(|raw| serde_json::from_slice::<Mapping<V>>(raw).ok())
                .unwrap_or_default();
            merge(&mut mapping);

            let current = self.read_raw().await?;
            if current != snapshot {
                tracing::debug!(
                    path = %self.path.display(),
                    attempt,
                    "cache changed during update, merging again"
                );
                continue;
            }

            self.put(&mapping).await?;
            return Ok(mapping);
        }

        eyre::bail!(
            "cache file {} kept changing while being updated",
            self.path.display()
        )
    }

    async fn reset(&self) -> eyre::Result<Mapping<V>> {
        let empty = Mapping::new();
        self.put(&empty).await?;
        Ok(empty)
    }

    async fn read_raw(&self) -> eyre::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).wrap_err_with(|| format!("read {}", self.path.display())),
        }
    }

    async fn write_raw(&self, bytes: &[u8]) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .wrap_err_with(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, bytes)
            .await
            .wrap_err_with(|| format!("write {}", self.path.display()))
    }
}
