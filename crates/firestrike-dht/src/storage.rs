//! Durable content-addressed storage
//!
//! Layout under the store root:
//! - `objects/<content id>`: one artifact per object (the IV-prefixed ciphertext)
//! - `staging/`: files still being written
//! - `index.bin`: bincode map from content id to object metadata
//!
//! An artifact is fully written and renamed into `objects/` before its
//! index entry is committed. A crash can leave an orphan artifact but never
//! an index entry pointing at a partial file.

use crate::error::{DhtError, Result};
use chrono::{DateTime, Utc};
use firestrike_crypto::{ContentId, Iv, Salt, IV_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.bin";
const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";

/// Metadata kept in the index for each stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Artifact size in bytes (IV included)
    pub size: u64,

    /// Size of the original file, when known
    pub plaintext_size: Option<u64>,

    /// Salt the content id was computed with
    pub salt: Salt,

    /// CBC initialization vector (first block of the artifact)
    pub iv: Iv,

    /// When this object was last written
    pub stored_at: DateTime<Utc>,
}

/// An object read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub content_id: ContentId,

    /// IV-prefixed ciphertext, exactly as stored
    pub ciphertext: Vec<u8>,

    pub iv: Iv,
    pub salt: Salt,
    pub plaintext_size: Option<u64>,
}

/// Per-node object store
///
/// Safe to share between tasks: every mutation of the index and every
/// rename or delete in `objects/` happens under one lock.
#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    index: Mutex<BTreeMap<ContentId, IndexEntry>>,
}

fn extract_iv(head: &[u8]) -> Result<Iv> {
    head.get(..IV_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| {
            DhtError::InvalidObject(format!("object shorter than IV ({} bytes)", head.len()))
        })
}

/// Write `bytes` to `path` and flush them to disk
async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

impl ContentStore {
    /// Open (or create) a store rooted at `root`
    ///
    /// Leftover staging files are discarded and index entries whose
    /// artifact has gone missing are dropped.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;

        let staging = root.join(STAGING_DIR);
        if fs::try_exists(&staging).await? {
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        let mut index = Self::load_index(&root).await?;

        let mut missing = Vec::new();
        for id in index.keys() {
            let path = root.join(OBJECTS_DIR).join(id.to_hex());
            if !fs::try_exists(&path).await? {
                missing.push(*id);
            }
        }

        let store = ContentStore {
            root,
            index: Mutex::new(BTreeMap::new()),
        };

        if !missing.is_empty() {
            warn!(
                "Dropping {} index entries with missing artifacts",
                missing.len()
            );
            for id in &missing {
                index.remove(id);
            }
            store.persist_index(&index).await?;
        }

        info!(
            "Opened content store at {} ({} objects)",
            store.root.display(),
            index.len()
        );
        *store.index.lock().await = index;
        Ok(store)
    }

    async fn load_index(root: &Path) -> Result<BTreeMap<ContentId, IndexEntry>> {
        match fs::read(root.join(INDEX_FILE)).await {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| DhtError::CorruptIndex(e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the index file atomically
    async fn persist_index(&self, index: &BTreeMap<ContentId, IndexEntry>) -> Result<()> {
        let bytes = bincode::serialize(index)?;
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        write_synced(&tmp, &bytes).await?;
        fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the artifact for a content id
    ///
    /// The file only exists while the id is in the index.
    pub fn artifact_path(&self, content_id: &ContentId) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(content_id.to_hex())
    }

    /// Fresh path under the staging directory
    ///
    /// Callers write an object there and hand it to [`ContentStore::put_file`].
    pub fn staging_path(&self) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(format!("{:016x}.part", rand::random::<u64>()))
    }

    /// Store an object from memory, replacing any object with the same id
    pub async fn put(
        &self,
        content_id: ContentId,
        ciphertext: &[u8],
        salt: Salt,
        plaintext_size: Option<u64>,
    ) -> Result<()> {
        let iv = extract_iv(ciphertext)?;

        let staged = self.staging_path();
        if let Err(e) = write_synced(&staged, ciphertext).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e);
        }

        let entry = IndexEntry {
            size: ciphertext.len() as u64,
            plaintext_size,
            salt,
            iv,
            stored_at: Utc::now(),
        };
        self.commit(content_id, &staged, entry).await
    }

    /// Commit a fully written staged file as the object for `content_id`
    ///
    /// The staged file is moved into the store; it must live on the same
    /// filesystem, which [`ContentStore::staging_path`] guarantees.
    pub async fn put_file(
        &self,
        content_id: ContentId,
        staged: &Path,
        salt: Salt,
        plaintext_size: Option<u64>,
    ) -> Result<()> {
        let mut file = fs::File::open(staged).await?;
        let size = file.metadata().await?.len();

        let mut head = [0u8; IV_SIZE];
        let mut filled = 0;
        while filled < IV_SIZE {
            let n = file.read(&mut head[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        drop(file);
        let iv = extract_iv(&head[..filled])?;

        let entry = IndexEntry {
            size,
            plaintext_size,
            salt,
            iv,
            stored_at: Utc::now(),
        };
        self.commit(content_id, staged, entry).await
    }

    async fn commit(&self, content_id: ContentId, staged: &Path, entry: IndexEntry) -> Result<()> {
        let mut index = self.index.lock().await;

        if let Err(e) = fs::rename(staged, self.artifact_path(&content_id)).await {
            let _ = fs::remove_file(staged).await;
            return Err(e.into());
        }

        let size = entry.size;
        let replaced = index.insert(content_id, entry).is_some();
        self.persist_index(&index).await?;

        debug!(
            "Stored {} ({} bytes{})",
            content_id,
            size,
            if replaced { ", replaced" } else { "" }
        );
        Ok(())
    }

    /// Look up an object locally
    pub async fn get(&self, content_id: &ContentId) -> Result<Option<StoredObject>> {
        let entry = match self.entry(content_id).await {
            Some(entry) => entry,
            None => return Ok(None),
        };

        match fs::read(self.artifact_path(content_id)).await {
            Ok(ciphertext) => Ok(Some(StoredObject {
                content_id: *content_id,
                ciphertext,
                iv: entry.iv,
                salt: entry.salt,
                plaintext_size: entry.plaintext_size,
            })),
            // Removed between the index lookup and the read
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Index metadata for a content id
    pub async fn entry(&self, content_id: &ContentId) -> Option<IndexEntry> {
        self.index.lock().await.get(content_id).cloned()
    }

    pub async fn contains(&self, content_id: &ContentId) -> bool {
        self.index.lock().await.contains_key(content_id)
    }

    /// Delete an object
    ///
    /// Returns false if the id was not stored.
    pub async fn remove(&self, content_id: &ContentId) -> Result<bool> {
        let mut index = self.index.lock().await;
        if index.remove(content_id).is_none() {
            return Ok(false);
        }
        self.persist_index(&index).await?;

        match fs::remove_file(self.artifact_path(content_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!("Removed {}", content_id);
        Ok(true)
    }

    /// Every stored id with its metadata, ordered by id
    pub async fn list(&self) -> Vec<(ContentId, IndexEntry)> {
        self.index
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    /// Total artifact bytes on disk
    pub async fn total_bytes(&self) -> u64 {
        self.index.lock().await.values().map(|e| e.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firestrike_crypto::hash_content;
    use tempfile::TempDir;

    fn blob(fill: u8, len: usize) -> Vec<u8> {
        let mut data = vec![0xEE; IV_SIZE];
        data.extend(std::iter::repeat(fill).take(len));
        data
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let data = blob(1, 64);
        let (id, salt) = hash_content(&data, None);
        store.put(id, &data, salt, Some(60)).await.unwrap();

        let object = store.get(&id).await.unwrap().unwrap();
        assert_eq!(object.content_id, id);
        assert_eq!(object.ciphertext, data);
        assert_eq!(object.iv, [0xEE; IV_SIZE]);
        assert_eq!(object.salt, salt);
        assert_eq!(object.plaintext_size, Some(60));

        assert_eq!(store.len().await, 1);
        assert_eq!(store.total_bytes().await, data.len() as u64);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let id = ContentId::from_bytes([9; 32]);

        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.contains(&id).await);
    }

    #[tokio::test]
    async fn test_put_is_idempotent_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let id = ContentId::from_bytes([2; 32]);
        let salt = Salt::generate();

        store.put(id, &blob(1, 16), salt, None).await.unwrap();
        store.put(id, &blob(2, 48), salt, Some(40)).await.unwrap();

        let object = store.get(&id).await.unwrap().unwrap();
        assert_eq!(object.ciphertext, blob(2, 48));
        assert_eq!(store.len().await, 1);
        assert_eq!(store.total_bytes().await, (IV_SIZE + 48) as u64);
    }

    #[tokio::test]
    async fn test_rejects_object_shorter_than_iv() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let id = ContentId::from_bytes([3; 32]);

        let result = store.put(id, &[0u8; 5], Salt::generate(), None).await;
        assert!(matches!(result, Err(DhtError::InvalidObject(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();
        let id = ContentId::from_bytes([4; 32]);

        store.put(id, &blob(1, 16), Salt::generate(), None).await.unwrap();
        assert!(store.remove(&id).await.unwrap());
        assert!(!store.remove(&id).await.unwrap());
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(!store.artifact_path(&id).exists());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let a = ContentId::from_bytes([5; 32]);
        let b = ContentId::from_bytes([6; 32]);
        let salt = Salt::generate();

        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            store.put(a, &blob(1, 32), salt, Some(20)).await.unwrap();
            store.put(b, &blob(2, 32), salt, None).await.unwrap();
            store.remove(&b).await.unwrap();
        }

        let store = ContentStore::open(dir.path()).await.unwrap();
        let ids: Vec<_> = store.list().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a]);

        let object = store.get(&a).await.unwrap().unwrap();
        assert_eq!(object.ciphertext, blob(1, 32));
        assert_eq!(object.plaintext_size, Some(20));
    }

    #[tokio::test]
    async fn test_drops_entries_with_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let a = ContentId::from_bytes([7; 32]);
        let b = ContentId::from_bytes([8; 32]);

        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            store.put(a, &blob(1, 16), Salt::generate(), None).await.unwrap();
            store.put(b, &blob(1, 16), Salt::generate(), None).await.unwrap();
            std::fs::remove_file(store.artifact_path(&a)).unwrap();
        }

        let store = ContentStore::open(dir.path()).await.unwrap();
        assert!(!store.contains(&a).await);
        assert!(store.contains(&b).await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_orphan_artifact_is_not_visible() {
        let dir = TempDir::new().unwrap();
        let id = ContentId::from_bytes([10; 32]);

        {
            let store = ContentStore::open(dir.path()).await.unwrap();
            // Artifact written but index never committed
            std::fs::write(store.artifact_path(&id), blob(1, 16)).unwrap();
        }

        let store = ContentStore::open(dir.path()).await.unwrap();
        assert!(store.get(&id).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_put_file_commits_staged_object() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::open(dir.path()).await.unwrap();

        let data = blob(3, 1000);
        let (id, salt) = hash_content(&data, None);
        let staged = store.staging_path();
        std::fs::write(&staged, &data).unwrap();

        store.put_file(id, &staged, salt, Some(990)).await.unwrap();

        assert!(!staged.exists());
        let entry = store.entry(&id).await.unwrap();
        assert_eq!(entry.size, data.len() as u64);
        assert_eq!(entry.plaintext_size, Some(990));
        assert_eq!(store.get(&id).await.unwrap().unwrap().ciphertext, data);
    }

    #[tokio::test]
    async fn test_open_clears_staging() {
        let dir = TempDir::new().unwrap();
        let leftover = {
            let store = ContentStore::open(dir.path()).await.unwrap();
            let path = store.staging_path();
            std::fs::write(&path, b"partial").unwrap();
            path
        };

        let _store = ContentStore::open(dir.path()).await.unwrap();
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_corrupt_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(INDEX_FILE), b"\xff\xff\xff\xff\xff\xff\xff\xff\xff")
            .unwrap();

        let result = ContentStore::open(dir.path()).await;
        assert!(matches!(result, Err(DhtError::CorruptIndex(_))));
    }

    #[tokio::test]
    async fn test_concurrent_puts() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(ContentStore::open(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let data = blob(i, 32);
                let (id, salt) = hash_content(&data, None);
                store.put(id, &data, salt, None).await.unwrap();
                id
            }));
        }

        for handle in handles {
            let id = handle.await.unwrap();
            assert!(store.get(&id).await.unwrap().is_some());
        }
        assert_eq!(store.len().await, 16);
    }
}
