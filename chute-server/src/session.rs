//! Transfer session store: open uploads keyed by (uploader, filename), written by random access.
//!
//! The table lock is held only for lookup, insert and remove. Each session has its own
//! async lock, so START, writes and the close for one key are serialized while different
//! keys proceed in parallel. A session lock may be held while taking the table lock,
//! never the other way round.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use chute_core::{fragment_offset, FRAGMENT_SIZE};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Session identity: one open upload per uploader and original filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub uploader: String,
    pub filename: String,
}

impl SessionKey {
    pub fn new(uploader: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            uploader: uploader.into(),
            filename: filename.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.uploader, self.filename)
    }
}

/// Outcome of [`SessionStore::begin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begun {
    /// An open session already had this shape; nothing was created.
    Reused,
    Fresh { destination: PathBuf },
    /// A session of another shape was open; its handle was flushed and closed.
    Replaced {
        previous: PathBuf,
        destination: PathBuf,
    },
}

/// Summary of a session closed by [`SessionStore::end`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closed {
    pub destination: PathBuf,
    pub fragment_count: u32,
    /// End of the furthest write, i.e. the size of the stored file.
    pub bytes: u64,
}

struct Session {
    /// `None` while being created and once closed or aborted.
    file: Option<File>,
    destination: PathBuf,
    fragment_count: u32,
    total_size: u64,
    high_water: u64,
}

impl Session {
    fn pending(fragment_count: u32, total_size: u64) -> Self {
        Self {
            file: None,
            destination: PathBuf::new(),
            fragment_count,
            total_size,
            high_water: 0,
        }
    }
}

/// Table of open sessions. Shared by every dispatch task.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `key`, or keep the one already open.
    ///
    /// An open session with the same `fragment_count` and `total_size` is kept and
    /// `create` is not called. Otherwise `create` supplies the destination and its
    /// writable handle, and a session of another shape is replaced. Calls for one key
    /// are serialized, so concurrent identical STARTs create exactly one file.
    /// If `create` fails nothing changes.
    pub async fn begin<F, Fut>(
        &self,
        key: SessionKey,
        fragment_count: u32,
        total_size: u64,
        create: F,
    ) -> Result<Begun, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = io::Result<(PathBuf, File)>>,
    {
        let (entry, mut session) = loop {
            let existing = {
                let mut sessions = self.sessions.lock().await;
                match sessions.get(&key) {
                    Some(entry) => entry.clone(),
                    None => {
                        let entry = Arc::new(Mutex::new(Session::pending(fragment_count, total_size)));
                        // Uncontended: nobody else can see this entry yet.
                        let session = entry.clone().lock_owned().await;
                        sessions.insert(key.clone(), entry.clone());
                        break (entry, session);
                    }
                }
            };
            let session = existing.clone().lock_owned().await;
            if session.file.is_none() || !self.is_current(&key, &existing).await {
                // Closed or aborted under us; it leaves the table shortly.
                drop(session);
                tokio::task::yield_now().await;
                continue;
            }
            if session.fragment_count == fragment_count && session.total_size == total_size {
                return Ok(Begun::Reused);
            }
            break (existing, session);
        };

        let (destination, file) = match create().await {
            Ok(created) => created,
            Err(e) => {
                if session.file.is_none() {
                    drop(session);
                    self.remove_if_same(&key, &entry).await;
                }
                return Err(SessionError::Io(e));
            }
        };
        let previous = std::mem::replace(&mut session.destination, destination.clone());
        let begun = match session.file.replace(file) {
            None => Begun::Fresh { destination },
            Some(mut old) => {
                if let Err(e) = old.flush().await {
                    tracing::warn!(%key, error = %e, "flush of replaced session failed");
                }
                Begun::Replaced {
                    previous,
                    destination,
                }
            }
        };
        session.fragment_count = fragment_count;
        session.total_size = total_size;
        session.high_water = 0;
        Ok(begun)
    }

    /// Write `payload` at `sequence * FRAGMENT_SIZE`. Rewriting a sequence overwrites it in place.
    /// A filesystem error aborts the session: it is removed and its handle dropped.
    pub async fn write_fragment(
        &self,
        key: &SessionKey,
        sequence: u32,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(SessionError::NoSession)?;
        let mut session = entry.lock().await;
        let fragment_count = session.fragment_count;
        if sequence >= fragment_count {
            return Err(SessionError::OutOfRange {
                sequence,
                fragment_count,
            });
        }
        if payload.len() > FRAGMENT_SIZE {
            return Err(SessionError::PayloadTooLarge(payload.len()));
        }
        let file = session.file.as_mut().ok_or(SessionError::NoSession)?;
        let offset = fragment_offset(sequence);
        let written = match file.seek(SeekFrom::Start(offset)).await {
            Ok(_) => file.write_all(payload).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            session.file = None;
            drop(session);
            self.remove_if_same(key, &entry).await;
            return Err(SessionError::Io(e));
        }
        session.high_water = session.high_water.max(offset + payload.len() as u64);
        Ok(())
    }

    /// Remove the session, then flush and close its handle.
    pub async fn end(&self, key: &SessionKey) -> Result<Closed, SessionError> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(key)
            .ok_or(SessionError::NoSession)?;
        let mut session = entry.lock().await;
        let mut file = session.file.take().ok_or(SessionError::NoSession)?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(Closed {
            destination: session.destination.clone(),
            fragment_count: session.fragment_count,
            bytes: session.high_water,
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn is_current(&self, key: &SessionKey, entry: &Arc<Mutex<Session>>) -> bool {
        self.sessions
            .lock()
            .await
            .get(key)
            .is_some_and(|e| Arc::ptr_eq(e, entry))
    }

    async fn remove_if_same(&self, key: &SessionKey, entry: &Arc<Mutex<Session>>) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            sessions.remove(key);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session")]
    NoSession,
    #[error("fragment {sequence} is beyond the session's {fragment_count} fragments")]
    OutOfRange { sequence: u32, fragment_count: u32 },
    #[error("fragment payload of {0} bytes exceeds the fragment size")]
    PayloadTooLarge(usize),
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(user: &str, name: &str) -> SessionKey {
        SessionKey::new(user, name)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Destination factory that creates (or truncates) `path`.
    fn at(path: &Path) -> impl FnOnce() -> std::future::Ready<io::Result<(PathBuf, File)>> {
        let path = path.to_path_buf();
        move || {
            std::future::ready(std::fs::File::create(&path).map(|f| (path, File::from_std(f))))
        }
    }

    #[tokio::test]
    async fn reverse_order_fragments_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        let data = pattern(3000, 7);
        store.begin(k.clone(), 3, 3000, at(&dest)).await.unwrap();
        for seq in [2u32, 1, 0] {
            let start = seq as usize * FRAGMENT_SIZE;
            let end = (start + FRAGMENT_SIZE).min(data.len());
            store.write_fragment(&k, seq, &data[start..end]).await.unwrap();
        }
        let closed = store.end(&k).await.unwrap();
        assert_eq!(closed.bytes, 3000);
        assert_eq!(closed.destination, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn rewriting_a_fragment_keeps_last_payload() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 1, 4, at(&dest)).await.unwrap();
        store.write_fragment(&k, 0, b"aaaa").await.unwrap();
        store.write_fragment(&k, 0, b"bbbb").await.unwrap();
        store.write_fragment(&k, 0, b"cccc").await.unwrap();
        store.end(&k).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"cccc");
    }

    #[tokio::test]
    async fn skipped_fragment_leaves_sparse_gap() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 2, 1410, at(&dest)).await.unwrap();
        store.write_fragment(&k, 1, b"0123456789").await.unwrap();
        store.end(&k).await.unwrap();
        let bytes = std::fs::read(&dest).unwrap();
        assert_eq!(bytes.len(), FRAGMENT_SIZE + 10);
        assert!(bytes[..FRAGMENT_SIZE].iter().all(|&b| b == 0));
        assert_eq!(&bytes[FRAGMENT_SIZE..], b"0123456789");
    }

    #[tokio::test]
    async fn fragment_and_end_without_begin() {
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        assert!(matches!(
            store.write_fragment(&k, 0, b"x").await,
            Err(SessionError::NoSession)
        ));
        assert!(matches!(store.end(&k).await, Err(SessionError::NoSession)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn double_end_reports_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store
            .begin(k.clone(), 0, 0, at(&dir.path().join("a")))
            .await
            .unwrap();
        store.end(&k).await.unwrap();
        assert!(matches!(store.end(&k).await, Err(SessionError::NoSession)));
    }

    #[tokio::test]
    async fn sequence_beyond_fragment_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 2, 2000, at(&dest)).await.unwrap();
        assert!(matches!(
            store.write_fragment(&k, 2, b"x").await,
            Err(SessionError::OutOfRange {
                sequence: 2,
                fragment_count: 2
            })
        ));
        assert!(matches!(
            store.write_fragment(&k, 0, &vec![0u8; FRAGMENT_SIZE + 1]).await,
            Err(SessionError::PayloadTooLarge(_))
        ));
        // The session survives a rejected fragment.
        store.write_fragment(&k, 0, b"ok").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn keys_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let dest_a = dir.path().join("a");
        let dest_b = dir.path().join("b");
        let store = SessionStore::new();
        let ka = key("alice", "same.bin");
        let kb = key("bob", "same.bin");
        store.begin(ka.clone(), 1, 3, at(&dest_a)).await.unwrap();
        store.begin(kb.clone(), 1, 3, at(&dest_b)).await.unwrap();
        store.write_fragment(&kb, 0, b"bbb").await.unwrap();
        store.write_fragment(&ka, 0, b"aaa").await.unwrap();
        store.end(&ka).await.unwrap();
        store.end(&kb).await.unwrap();
        assert_eq!(std::fs::read(&dest_a).unwrap(), b"aaa");
        assert_eq!(std::fs::read(&dest_b).unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn same_shape_is_reused_without_creating() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("first");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 2, 1500, at(&dest)).await.unwrap();
        store.write_fragment(&k, 0, b"kept").await.unwrap();

        let begun = store
            .begin(k.clone(), 2, 1500, || async {
                Err::<(PathBuf, File), _>(io::Error::other("must not be called"))
            })
            .await
            .unwrap();
        assert_eq!(begun, Begun::Reused);
        let closed = store.end(&k).await.unwrap();
        assert_eq!(closed.destination, dest);
        assert_eq!(closed.bytes, 4);
    }

    #[tokio::test]
    async fn other_shape_replaces_and_closes_previous() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 1, 1, at(&first)).await.unwrap();
        let begun = store.begin(k.clone(), 1, 2, at(&second)).await.unwrap();
        assert_eq!(
            begun,
            Begun::Replaced {
                previous: first,
                destination: second.clone()
            }
        );
        assert_eq!(store.len().await, 1);
        assert_eq!(store.end(&k).await.unwrap().destination, second);
    }

    #[tokio::test]
    async fn begin_failure_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-dir").join("out.bin");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        assert!(matches!(
            store.begin(k.clone(), 1, 1, at(&missing)).await,
            Err(SessionError::Io(_))
        ));
        assert!(store.is_empty().await);
        assert!(matches!(store.end(&k).await, Err(SessionError::NoSession)));
    }

    #[tokio::test]
    async fn failed_replacement_keeps_open_session() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("first");
        let store = SessionStore::new();
        let k = key("alice", "a.bin");
        store.begin(k.clone(), 1, 3, at(&dest)).await.unwrap();
        let missing = dir.path().join("no-such-dir").join("out.bin");
        assert!(matches!(
            store.begin(k.clone(), 2, 2000, at(&missing)).await,
            Err(SessionError::Io(_))
        ));
        store.write_fragment(&k, 0, b"abc").await.unwrap();
        assert_eq!(store.end(&k).await.unwrap().destination, dest);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_begins_create_once() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..100 {
            let store = Arc::new(SessionStore::new());
            let created = Arc::new(AtomicUsize::new(0));
            let k = key("alice", "a.bin");
            let mut tasks = Vec::new();
            for i in 0..4 {
                let (store, created, k) = (store.clone(), created.clone(), k.clone());
                let dest = dir.path().join(format!("r{round}-{i}"));
                tasks.push(tokio::spawn(async move {
                    store
                        .begin(k, 2, 2000, move || {
                            created.fetch_add(1, Ordering::SeqCst);
                            at(&dest)()
                        })
                        .await
                        .unwrap()
                }));
            }
            let mut fresh = 0;
            for t in tasks {
                match t.await.unwrap() {
                    Begun::Fresh { .. } => fresh += 1,
                    Begun::Reused => {}
                    other => panic!("unexpected {other:?}"),
                }
            }
            assert_eq!(fresh, 1);
            assert_eq!(created.load(Ordering::SeqCst), 1);
            assert_eq!(store.len().await, 1);
        }
    }

    #[tokio::test]
    async fn concurrent_writes_to_different_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new());
        let mut tasks = Vec::new();
        for user in 0..8u8 {
            let store = store.clone();
            let dest = dir.path().join(format!("u{user}"));
            tasks.push(tokio::spawn(async move {
                let k = key(&format!("user{user}"), "shared.bin");
                let data = pattern(FRAGMENT_SIZE * 4, user);
                store
                    .begin(k.clone(), 4, data.len() as u64, at(&dest))
                    .await
                    .unwrap();
                for (seq, chunk) in data.chunks(FRAGMENT_SIZE).enumerate().rev() {
                    store.write_fragment(&k, seq as u32, chunk).await.unwrap();
                }
                store.end(&k).await.unwrap();
                (dest, data)
            }));
        }
        for t in tasks {
            let (dest, data) = t.await.unwrap();
            assert_eq!(std::fs::read(dest).unwrap(), data);
        }
    }
}
