use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::{Result, Storage, StoreError};

/// A typed JSON document persisted after every mutation.
///
/// All access goes through one async mutex, so a load-mutate-persist cycle
/// is never interleaved with another one on the same document. Writes run on
/// the blocking pool while that mutex is held.
pub struct Document<T, S> {
    label: String,
    value: Mutex<T>,
    storage: Arc<Mutex<S>>,
}

impl<T, S> Document<T, S>
where
    T: Serialize + DeserializeOwned + Default + Clone + Send,
    S: Storage + 'static,
{
    /// Load the document. A missing or unreadable payload yields `T::default()`.
    pub fn open(label: impl Into<String>, storage: S) -> Self {
        let label = label.into();
        let value = match storage.read() {
            Ok(Some(bytes)) => match serde_json::from_slice::<T>(&bytes) {
                Ok(v) => v,
                Err(e) => {
                    warn!(document=%label, "corrupt document, using defaults: {e}");
                    T::default()
                }
            },
            Ok(None) => T::default(),
            Err(e) => {
                warn!(document=%label, "document read failed, using defaults: {e}");
                T::default()
            }
        };

        Self {
            label,
            value: Mutex::new(value),
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.value.lock().await;
        f(&guard)
    }

    pub async fn snapshot(&self) -> T {
        self.value.lock().await.clone()
    }

    /// Mutate and persist. A failed write is logged and the new state is
    /// kept in memory only.
    pub async fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.lock().await;
        let out = f(&mut guard);
        let encoded = encode(&*guard);
        self.persist(encoded).await;
        out
    }

    /// Like [`Document::update`], but the mutation is applied to a copy and
    /// only committed when `f` returns `Ok`.
    pub async fn try_update<R, E>(&self, f: impl FnOnce(&mut T) -> std::result::Result<R, E>) -> std::result::Result<R, E> {
        let mut guard = self.value.lock().await;
        let mut draft = guard.clone();
        let out = f(&mut draft)?;
        *guard = draft;
        let encoded = encode(&*guard);
        self.persist(encoded).await;
        Ok(out)
    }

    // Caller holds the value lock, so writes land in mutation order.
    async fn persist(&self, encoded: Result<Vec<u8>>) {
        if let Err(e) = self.write(encoded).await {
            error!(document=%self.label, "persist failed, keeping in-memory state: {e}");
        }
    }

    async fn write(&self, encoded: Result<Vec<u8>>) -> Result<()> {
        let bytes = encoded?;
        with_storage_blocking(self.storage.clone(), move |s| s.write(&bytes))
            .await
            .map_err(|e| StoreError::Storage(format!("write task failed: {e}")))?
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Run `f` against the storage on the blocking pool.
async fn with_storage_blocking<S, R, F>(storage: Arc<Mutex<S>>, f: F) -> std::result::Result<R, tokio::task::JoinError>
where
    S: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut S) -> R + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = storage.blocking_lock();
        f(&mut guard)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStorage;
    use serde::Deserialize;

    #[derive(Clone, Default, Serialize, Deserialize, PartialEq, Debug)]
    struct Counter {
        n: u32,
    }

    struct BrokenStorage;

    impl Storage for BrokenStorage {
        fn read(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            Err(StoreError::Storage("disk full".into()))
        }
        fn remove(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_corrupt_payload_falls_back_to_default() {
        let doc: Document<Counter, _> = Document::open("counter", InMemoryStorage::with_bytes("{not json"));
        assert_eq!(doc.snapshot().await, Counter::default());
    }

    #[tokio::test]
    async fn test_update_persists() {
        let storage = InMemoryStorage::new();
        let doc: Document<Counter, _> = Document::open("counter", storage.clone());

        doc.update(|c| c.n = 7).await;

        let saved: Counter = serde_json::from_slice(&storage.bytes().unwrap()).unwrap();
        assert_eq!(saved.n, 7);
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_memory_state() {
        let doc: Document<Counter, _> = Document::open("counter", BrokenStorage);
        doc.update(|c| c.n += 1).await;
        assert_eq!(doc.read(|c| c.n).await, 1);
    }

    #[tokio::test]
    async fn test_try_update_err_leaves_document_untouched() {
        let storage = InMemoryStorage::new();
        let doc: Document<Counter, _> = Document::open("counter", storage.clone());

        let res: std::result::Result<(), &str> = doc
            .try_update(|c| {
                c.n = 99;
                Err("rejected")
            })
            .await;

        assert!(res.is_err());
        assert_eq!(doc.read(|c| c.n).await, 0);
        assert!(storage.bytes().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let doc = std::sync::Arc::new(Document::<Counter, _>::open("counter", InMemoryStorage::new()));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let doc = doc.clone();
            handles.push(tokio::spawn(async move {
                doc.update(|c| c.n += 1).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(doc.read(|c| c.n).await, 32);
    }

    struct SlowStorage;

    impl Storage for SlowStorage {
        fn read(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            std::thread::sleep(std::time::Duration::from_millis(300));
            Ok(())
        }
        fn remove(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_write_does_not_stall_the_runtime() {
        let doc = std::sync::Arc::new(Document::<Counter, _>::open("counter", SlowStorage));

        let writer = {
            let doc = doc.clone();
            tokio::spawn(async move { doc.update(|c| c.n = 1).await })
        };

        let mut ticks = 0;
        while !writer.is_finished() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            ticks += 1;
        }

        assert!(ticks >= 5, "runtime thread was blocked, only {ticks} ticks");
        assert_eq!(doc.read(|c| c.n).await, 1);
    }
}
