//! Room storage: one binary snapshot per room, overwritten on every save.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::PersistenceError;

/// Where room snapshots live. Implementations are shared across the save and
/// load tasks the server spawns.
pub trait Persistence: Send + Sync + 'static {
    /// `Ok(None)` means the room was never saved
    fn load(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send;

    fn save(
        &self,
        room: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;
}

/// Stores each room as `<root>/<escaped room id>.grove`
#[derive(Debug, Clone)]
pub struct FilePersistence {
    root: PathBuf,
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, room: &str) -> PathBuf {
        self.root.join(format!("{}.grove", escape_room_id(room)))
    }
}

impl Persistence for FilePersistence {
    async fn load(&self, room: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match tokio::fs::read(self.path_for(room)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save(&self, room: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(room);
        // readers never see a half-written snapshot
        let tmp = path.with_extension("grove.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Room ids are arbitrary strings; keep `[A-Za-z0-9_-]` and percent-escape
/// every other byte so distinct ids never share a file.
pub fn escape_room_id(room: &str) -> String {
    let mut escaped = String::with_capacity(room.len());
    for byte in room.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{:02X}", byte));
        }
    }
    escaped
}

/// In-process storage, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rooms: Mutex<HashMap<String, Vec<u8>>>,
    failing_saves: AtomicUsize,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, room: &str) -> Option<Vec<u8>> {
        self.lock().get(room).cloned()
    }

    pub fn insert(&self, room: &str, bytes: Vec<u8>) {
        self.lock().insert(room.to_string(), bytes);
    }

    /// Make the next `n` saves fail with an I/O error
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Persistence for MemoryPersistence {
    async fn load(&self, room: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.get(room))
    }

    async fn save(&self, room: &str, bytes: &[u8]) -> Result<(), PersistenceError> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let err = std::io::Error::new(std::io::ErrorKind::Other, "injected save failure");
            return Err(err.into());
        }
        self.insert(room, bytes.to_vec());
        Ok(())
    }
}

impl<P: Persistence> Persistence for std::sync::Arc<P> {
    fn load(
        &self,
        room: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, PersistenceError>> + Send {
        (**self).load(room)
    }

    fn save(
        &self,
        room: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        (**self).save(room, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_keeps_ids_distinct() {
        assert_eq!(escape_room_id("plain-room_1"), "plain-room_1");
        assert_eq!(escape_room_id("a/b"), "a%2Fb");
        assert_ne!(escape_room_id("a/b"), escape_room_id("a_b"));
        assert_eq!(escape_room_id("../etc"), "%2E%2E%2Fetc");
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePersistence::new(dir.path().join("rooms"));

        assert_eq!(store.load("room").await.unwrap(), None);
        store.save("room", b"first").await.unwrap();
        store.save("room", b"second").await.unwrap();
        assert_eq!(store.load("room").await.unwrap(), Some(b"second".to_vec()));
        assert!(store.path_for("room").exists());
    }

    #[tokio::test]
    async fn test_memory_injected_failures() {
        let store = MemoryPersistence::new();
        store.fail_next_saves(1);
        assert!(store.save("room", b"x").await.is_err());
        store.save("room", b"y").await.unwrap();
        assert_eq!(store.load("room").await.unwrap(), Some(b"y".to_vec()));
    }
}
