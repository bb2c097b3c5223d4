//! Content-addressed blob store (spec §3.2, §4.B), coupled to the `files`
//! table in the snapshot store by two-phase commit: a `files` row is
//! written inside the same SQL transaction as the rest of the commit's
//! writes, and the corresponding blob is moved into place by hash only
//! after that transaction commits. Directory layout is the two-level
//! hex-prefix scheme `HashMapObjectDB` uses, ported from its ad hoc 32-byte
//! `Hash` to blake3's native 32-byte digest.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};

use crate::{Store, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// A fresh download, hashed to a new digest; bytes live at `tmp_path`
    /// until `perform_file_transaction` commits and renames them into
    /// place.
    Hash([u8; 32]),
    /// The url was already known; no bytes moved.
    AlreadyPresent([u8; 32]),
    /// The fetch failed permanently (not retried); recorded as a terminal
    /// error code rather than a hash.
    Error(String),
}

pub struct PendingDownload {
    pub url: String,
    pub download_url: String,
    pub outcome: DownloadOutcome,
    pub tmp_path: Option<PathBuf>,
}

#[async_trait::async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, download_url: &str) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Clone, Default)]
pub struct ConsistencyReport {
    pub missing_files: Vec<[u8; 32]>,
    pub extra_files: Vec<[u8; 32]>,
}

fn hex_prefix_path(root: &Path, hash: &[u8; 32]) -> PathBuf {
    let hex = hex::encode(hash);
    root.join(&hex[0..2]).join(&hex[2..])
}

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: impl AsRef<Path>) -> Result<BlobStore, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok(BlobStore { root })
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// `download_if_needed(url, download_url)` (spec §4.B). Checks the
    /// `files` table first; on a miss, fetches via `downloader` and writes
    /// the bytes to a temp file, returning a handle `perform_file_transaction`
    /// will later commit.
    pub async fn download_if_needed(
        &self,
        store: &Store,
        url: String,
        download_url: String,
        downloader: &(dyn Downloader + '_),
    ) -> Result<PendingDownload, StoreError> {
        let existing = {
            let url = url.clone();
            store
                .with_conn(move |conn| lookup_file(conn, &url))
                .await?
        };
        if let Some(FileRow { hash: Some(hash), .. }) = existing {
            return Ok(PendingDownload {
                url,
                download_url,
                outcome: DownloadOutcome::AlreadyPresent(hash),
                tmp_path: None,
            });
        }

        match downloader.fetch(&download_url).await {
            Ok(bytes) => {
                let hash = *blake3::hash(&bytes).as_bytes();
                let tmp_path = self.tmp_dir().join(hex::encode(hash));
                std::fs::write(&tmp_path, &bytes)?;
                Ok(PendingDownload {
                    url,
                    download_url,
                    outcome: DownloadOutcome::Hash(hash),
                    tmp_path: Some(tmp_path),
                })
            }
            Err(code) => Ok(PendingDownload {
                url,
                download_url,
                outcome: DownloadOutcome::Error(code),
                tmp_path: None,
            }),
        }
    }

    /// `perform_file_transaction(downloads, db_work)` (spec §4.B): writes
    /// every download's `files` row and runs `db_work` inside one
    /// transaction; on success, moves temp files into the blob directory
    /// by hash (deduplicating against blobs already referenced elsewhere);
    /// on any error, rolls back and deletes the temp files.
    pub async fn perform_file_transaction<F>(
        &self,
        store: &Store,
        downloads: Vec<PendingDownload>,
        db_work: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&Connection) -> Result<(), StoreError> + Send + 'static,
    {
        let tmp_paths: Vec<PathBuf> = downloads.iter().filter_map(|d| d.tmp_path.clone()).collect();
        let root = self.root.clone();

        let result = store
            .with_conn(move |conn| {
                conn.execute_batch("BEGIN IMMEDIATE")?;
                let outcome = (|| -> Result<(), StoreError> {
                    for d in &downloads {
                        write_file_row(conn, d)?;
                    }
                    db_work(conn)
                })();
                match outcome {
                    Ok(()) => {
                        conn.execute_batch("COMMIT")?;
                        Ok(downloads)
                    }
                    Err(e) => {
                        conn.execute_batch("ROLLBACK").ok();
                        Err(e)
                    }
                }
            })
            .await;

        match result {
            Ok(downloads) => {
                for d in downloads {
                    let (DownloadOutcome::Hash(hash), Some(tmp)) = (&d.outcome, &d.tmp_path) else {
                        continue;
                    };
                    let dest = hex_prefix_path(&root, hash);
                    if dest.exists() {
                        std::fs::remove_file(tmp).ok();
                        continue;
                    }
                    if let Some(parent) = dest.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(tmp, &dest)?;
                }
                Ok(())
            }
            Err(e) => {
                for tmp in tmp_paths {
                    std::fs::remove_file(tmp).ok();
                }
                Err(e)
            }
        }
    }

    /// `check_consistency(delete_extras?)` (spec §4.B): reconciles the
    /// blob directory against `files.hash`.
    pub async fn check_consistency(&self, store: &Store, delete_extras: bool) -> Result<ConsistencyReport, StoreError> {
        let referenced: Vec<[u8; 32]> = store
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT hash FROM files WHERE hash IS NOT NULL")?;
                let rows = stmt.query_map([], |r| r.get::<_, Vec<u8>>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    let bytes = row?;
                    if bytes.len() == 32 {
                        let mut arr = [0u8; 32];
                        arr.copy_from_slice(&bytes);
                        out.push(arr);
                    }
                }
                Ok(out)
            })
            .await?;

        let root = self.root.clone();
        let on_disk = tokio::task::spawn_blocking(move || list_blob_hashes(&root))
            .await
            .map_err(|_| StoreError::WorkerPanicked)??;

        let referenced_set: std::collections::HashSet<_> = referenced.iter().copied().collect();
        let on_disk_set: std::collections::HashSet<_> = on_disk.iter().copied().collect();

        let missing_files: Vec<_> = referenced_set.difference(&on_disk_set).copied().collect();
        let extra_files: Vec<_> = on_disk_set.difference(&referenced_set).copied().collect();

        if delete_extras {
            let root = self.root.clone();
            let to_delete = extra_files.clone();
            tokio::task::spawn_blocking(move || {
                for hash in &to_delete {
                    let _ = std::fs::remove_file(hex_prefix_path(&root, hash));
                }
            })
            .await
            .map_err(|_| StoreError::WorkerPanicked)?;
        }

        Ok(ConsistencyReport { missing_files, extra_files })
    }
}

struct FileRow {
    hash: Option<[u8; 32]>,
}

fn lookup_file(conn: &Connection, url: &str) -> Result<Option<FileRow>, StoreError> {
    let row: Option<Option<Vec<u8>>> = conn
        .query_row("SELECT hash FROM files WHERE url = ?1", [url], |r| r.get(0))
        .optional()?;
    Ok(row.map(|hash| FileRow {
        hash: hash.and_then(|bytes| {
            if bytes.len() == 32 {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(&bytes);
                Some(arr)
            } else {
                None
            }
        }),
    }))
}

fn write_file_row(conn: &Connection, d: &PendingDownload) -> Result<(), StoreError> {
    match &d.outcome {
        DownloadOutcome::Hash(hash) | DownloadOutcome::AlreadyPresent(hash) => {
            conn.execute(
                "INSERT OR REPLACE INTO files (url, download_url, hash, error_code) VALUES (?1,?2,?3,NULL)",
                params![d.url, d.download_url, hash.to_vec()],
            )?;
        }
        DownloadOutcome::Error(code) => {
            conn.execute(
                "INSERT OR REPLACE INTO files (url, download_url, hash, error_code) VALUES (?1,?2,NULL,?3)",
                params![d.url, d.download_url, code],
            )?;
        }
    }
    Ok(())
}

fn list_blob_hashes(root: &Path) -> Result<Vec<[u8; 32]>, StoreError> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return Ok(out);
    };
    for entry in entries.flatten() {
        let prefix = entry.file_name();
        let Some(prefix) = prefix.to_str() else { continue };
        if prefix == "tmp" || prefix.len() != 2 {
            continue;
        }
        let Ok(inner) = std::fs::read_dir(entry.path()) else { continue };
        for file in inner.flatten() {
            let name = file.file_name();
            let Some(name) = name.to_str() else { continue };
            let full = format!("{prefix}{name}");
            if let Ok(bytes) = hex::decode(&full) {
                if bytes.len() == 32 {
                    let mut arr = [0u8; 32];
                    arr.copy_from_slice(&bytes);
                    out.push(arr);
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    struct FixedDownloader(Vec<u8>);

    #[async_trait::async_trait]
    impl Downloader for FixedDownloader {
        async fn fetch(&self, _download_url: &str) -> Result<Vec<u8>, String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn download_then_commit_moves_temp_file_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        let store = Store::open_in_memory().unwrap();
        let downloader = FixedDownloader(b"hello world".to_vec());

        let pending = blobs
            .download_if_needed(&store, "https://x/a.png".into(), "https://cdn/a.png".into(), &downloader)
            .await
            .unwrap();
        let hash = match pending.outcome {
            DownloadOutcome::Hash(h) => h,
            _ => panic!("expected fresh hash"),
        };

        blobs
            .perform_file_transaction(&store, vec![pending], |_conn| Ok(()))
            .await
            .unwrap();

        let dest = hex_prefix_path(dir.path(), &hash);
        assert!(dest.exists());

        let report = blobs.check_consistency(&store, false).await.unwrap();
        assert!(report.missing_files.is_empty());
        assert!(report.extra_files.is_empty());
    }

    #[tokio::test]
    async fn already_present_url_skips_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        let store = Store::open_in_memory().unwrap();
        let downloader = FixedDownloader(b"data".to_vec());

        let first = blobs
            .download_if_needed(&store, "https://x/a.png".into(), "https://cdn/a.png".into(), &downloader)
            .await
            .unwrap();
        blobs
            .perform_file_transaction(&store, vec![first], |_conn| Ok(()))
            .await
            .unwrap();

        let second = blobs
            .download_if_needed(&store, "https://x/a.png".into(), "https://cdn/a.png".into(), &downloader)
            .await
            .unwrap();
        assert!(matches!(second.outcome, DownloadOutcome::AlreadyPresent(_)));
        assert!(second.tmp_path.is_none());
    }
}
