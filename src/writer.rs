//! Backup, write, validate, then roll back or clean up
//!
//! # Commit protocol
//!
//! ```text
//! stage (per file):   mkdir -p parent
//!                     read current content (absent is fine)
//!                     rename current -> <path>.bak      rollback point
//!                     write replacement or old + "\n" + new
//! commit (once):      run the validator over the whole tree
//!                     ok  -> delete every .bak
//!                     err -> rename every .bak back (or remove files that
//!                            did not exist before), report the rejected bodies
//! ```
//!
//! [`ConfigWriter::write_checked`] is stage + commit for a single file. Joint
//! commits stage several files with [`ConfigWriter::write_unchecked`] and pass
//! them all to one [`ConfigWriter::commit`].
//!
//! Once staging starts the sequence must reach commit or rollback, so callers
//! run it through [`run_to_completion`]: dropping the caller's future leaves
//! the task, and the lock guard it owns, running until the tree is consistent.

use crate::command::ConfigValidator;
use crate::error::SyncError;
use crate::layout::backup_path;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Tracing target for configuration bodies the validator rejected
pub const REJECTED_TARGET: &str = "gatesync::rejected";

/// A file written but not yet validated
#[derive(Debug)]
pub struct StagedWrite {
    path: PathBuf,
    /// Present when the file existed before this write
    backup: Option<PathBuf>,
    written: Vec<u8>,
}

impl StagedWrite {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a previous version existed and was backed up
    pub fn has_old_config(&self) -> bool {
        self.backup.is_some()
    }

    /// Bytes written to the file
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Restore the state before the write
    async fn rollback(&self) {
        let result = match &self.backup {
            Some(backup) => tokio::fs::rename(backup, &self.path).await,
            None => tokio::fs::remove_file(&self.path).await,
        };
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Rollback config file failure");
        }
    }

    /// Drop the rollback point after a successful check
    async fn discard_backup(&self) {
        if let Some(backup) = &self.backup {
            if let Err(e) = tokio::fs::remove_file(backup).await {
                warn!(path = %backup.display(), error = %e, "Remove old config file failure");
            }
        }
    }
}

/// Run `work` on its own task while holding `guard`.
///
/// The task is not cancelled when the returned future is dropped; `guard` is
/// released only after `work` finishes. On normal completion the guard is
/// handed back for the next step.
pub async fn run_to_completion<G, F>(guard: G, work: F) -> Result<(G, F::Output), SyncError>
where
    G: Send + 'static,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        let output = work.await;
        (guard, output)
    })
    .await
    .map_err(|e| SyncError::Commit(e.to_string()))
}

/// A `.bak` outside a commit means an earlier commit never finished. The
/// backup is the last accepted state, so it goes back over whatever is live.
async fn recover_backup(path: &Path) -> Result<(), SyncError> {
    let backup = backup_path(path);
    match tokio::fs::metadata(&backup).await {
        Ok(_) => {
            warn!(path = %path.display(), backup = %backup.display(), "Found leftover backup, restoring last accepted config");
            tokio::fs::rename(&backup, path)
                .await
                .map_err(|e| SyncError::io("restore", &backup, e))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::io("check", backup, e)),
    }
}

/// Writes configuration files under the protection of an external validator
#[derive(Debug)]
pub struct ConfigWriter<V> {
    validator: Arc<V>,
}

impl<V> Clone for ConfigWriter<V> {
    fn clone(&self) -> Self {
        Self {
            validator: Arc::clone(&self.validator),
        }
    }
}

impl<V: ConfigValidator> ConfigWriter<V> {
    pub fn new(validator: V) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }

    pub fn validator(&self) -> &V {
        &self.validator
    }

    /// Write `body` to `path` and keep it only if the validator accepts the tree.
    ///
    /// With `first` set, or when the file does not exist yet, `body` replaces
    /// the file; otherwise it is appended to the current content after a
    /// newline. On rejection the file is left exactly as before the call and
    /// [`SyncError::Validation`] is returned.
    pub async fn write_checked(&self, first: bool, body: &[u8], path: &Path) -> Result<(), SyncError> {
        let staged = self.write_unchecked(first, body, path).await?;
        self.commit(vec![staged]).await
    }

    /// Steps up to and including the write, without validation
    pub async fn write_unchecked(
        &self,
        first: bool,
        body: &[u8],
        path: &Path,
    ) -> Result<StagedWrite, SyncError> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SyncError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        recover_backup(path).await?;

        let old = match tokio::fs::read(path).await {
            Ok(old) => Some(old),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::io("read", path, e)),
        };
        debug!(path = %path.display(), has_old_config = old.is_some(), first, "Staging config file");

        let content = match &old {
            Some(old) if !first && !old.is_empty() => {
                let mut merged = Vec::with_capacity(old.len() + 1 + body.len());
                merged.extend_from_slice(old);
                merged.push(b'\n');
                merged.extend_from_slice(body);
                merged
            }
            _ => body.to_vec(),
        };

        let backup = match old {
            Some(_) => {
                let backup = backup_path(path);
                tokio::fs::rename(path, &backup)
                    .await
                    .map_err(|e| SyncError::io("rename", path, e))?;
                Some(backup)
            }
            None => None,
        };

        let staged = StagedWrite {
            path: path.to_path_buf(),
            backup,
            written: content,
        };
        if let Err(e) = tokio::fs::write(path, &staged.written).await {
            staged.rollback().await;
            return Err(SyncError::io("write", path, e));
        }
        Ok(staged)
    }

    /// Stage every `(body, path)` pair, then validate once for all of them.
    ///
    /// If a later file cannot be staged, the files already staged are rolled
    /// back and the staging error is returned.
    pub async fn write_checked_all(&self, first: bool, files: &[(&[u8], &Path)]) -> Result<(), SyncError> {
        let mut staged = Vec::with_capacity(files.len());
        for (body, path) in files {
            match self.write_unchecked(first, body, path).await {
                Ok(file) => staged.push(file),
                Err(e) => {
                    self.abandon(staged).await;
                    return Err(e);
                }
            }
        }
        self.commit(staged).await
    }

    /// Roll back staged files without validating, e.g. when a sibling write failed
    pub async fn abandon(&self, staged: Vec<StagedWrite>) {
        for file in &staged {
            file.rollback().await;
        }
    }

    /// Validate once for all `staged` files, then clean up or roll back each.
    pub async fn commit(&self, staged: Vec<StagedWrite>) -> Result<(), SyncError> {
        match self.validator.check().await {
            Ok(()) => {
                for file in &staged {
                    file.discard_backup().await;
                }
                Ok(())
            }
            Err(e) => {
                for file in &staged {
                    file.rollback().await;
                }
                for file in &staged {
                    // Operators see exactly what was refused; the live tree
                    // stays at the last accepted state
                    error!(
                        target: REJECTED_TARGET,
                        path = %file.path.display(),
                        body = %String::from_utf8_lossy(&file.written),
                        "failure config body"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Validator answering from a script; passes once the script runs out
    #[derive(Default)]
    struct Scripted {
        answers: Mutex<VecDeque<bool>>,
    }

    impl Scripted {
        fn new(answers: &[bool]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().copied().collect()),
            }
        }
    }

    impl ConfigValidator for Scripted {
        async fn check(&self) -> Result<(), SyncError> {
            if self.answers.lock().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(SyncError::Validation {
                    output: "scripted failure".to_string(),
                })
            }
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_first_write_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("http/acme/servers.conf");
        let writer = ConfigWriter::new(Scripted::default());

        writer.write_checked(false, b"server a;", &path).await.unwrap();
        assert_eq!(read(&path), "server a;");
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_replace_then_merge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.conf");
        std::fs::write(&path, "stale").unwrap();
        let writer = ConfigWriter::new(Scripted::default());

        writer.write_checked(true, b"C1", &path).await.unwrap();
        writer.write_checked(false, b"C2", &path).await.unwrap();
        assert_eq!(read(&path), "C1\nC2");
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_rejection_restores_previous_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.conf");
        let writer = ConfigWriter::new(Scripted::new(&[true, true, false]));

        writer.write_checked(true, b"C1", &path).await.unwrap();
        writer.write_checked(false, b"C2", &path).await.unwrap();
        let err = writer.write_checked(false, b"C3", &path).await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(read(&path), "C1\nC2");
        assert!(!backup_path(&path).exists());

        // Later entries still merge onto the last accepted state
        writer.write_checked(false, b"C4", &path).await.unwrap();
        assert_eq!(read(&path), "C1\nC2\nC4");
    }

    #[tokio::test]
    async fn test_rejected_new_file_is_removed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upstreams.conf");
        let writer = ConfigWriter::new(Scripted::new(&[false]));

        let err = writer.write_checked(true, b"broken", &path).await.unwrap_err();
        assert!(err.is_validation());
        assert!(!path.exists());
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_unchecked_reports_old_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.conf");
        let writer = ConfigWriter::new(Scripted::default());

        let staged = writer.write_unchecked(true, b"one", &path).await.unwrap();
        assert!(!staged.has_old_config());
        writer.commit(vec![staged]).await.unwrap();

        let staged = writer.write_unchecked(false, b"two", &path).await.unwrap();
        assert!(staged.has_old_config());
        assert!(backup_path(&path).exists());
        assert_eq!(staged.written(), b"one\ntwo");
        writer.commit(vec![staged]).await.unwrap();
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_joint_rollback() {
        let dir = TempDir::new().unwrap();
        let servers = dir.path().join("http/acme/servers.conf");
        let upstreams = dir.path().join("stream/acme/upstreams.conf");
        let writer = ConfigWriter::new(Scripted::new(&[false]));

        std::fs::create_dir_all(servers.parent().unwrap()).unwrap();
        std::fs::write(&servers, "server old;").unwrap();

        let a = writer.write_unchecked(false, b"server new;", &servers).await.unwrap();
        let b = writer.write_unchecked(false, b"upstream new;", &upstreams).await.unwrap();
        let err = writer.commit(vec![a, b]).await.unwrap_err();

        assert!(err.is_validation());
        assert_eq!(read(&servers), "server old;");
        assert!(!upstreams.exists());
        assert!(!backup_path(&servers).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_joint_staging_failure_rolls_back_earlier_files() {
        let dir = TempDir::new().unwrap();
        let upstreams = dir.path().join("stream/acme/upstreams.conf");
        std::fs::create_dir_all(upstreams.parent().unwrap()).unwrap();
        std::fs::write(&upstreams, "upstream old;").unwrap();
        // "http" is a file, so the server directory cannot be created
        std::fs::write(dir.path().join("http"), "").unwrap();
        let servers = dir.path().join("http/acme/servers.conf");
        let writer = ConfigWriter::new(Scripted::default());

        let err = writer
            .write_checked_all(
                false,
                &[(b"upstream new;".as_slice(), upstreams.as_path()), (b"server new;".as_slice(), servers.as_path())],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::CreateDir { .. }));
        assert_eq!(read(&upstreams), "upstream old;");
        assert!(!backup_path(&upstreams).exists());
    }

    #[tokio::test]
    async fn test_empty_existing_file_is_not_merged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.conf");
        std::fs::write(&path, "").unwrap();
        let writer = ConfigWriter::new(Scripted::default());

        writer.write_checked(false, b"C1", &path).await.unwrap();
        assert_eq!(read(&path), "C1");
    }

    #[tokio::test]
    async fn test_leftover_backup_is_restored_before_staging() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.conf");
        // An interrupted commit: unchecked content live, accepted content in .bak
        std::fs::write(&path, "server unchecked;").unwrap();
        std::fs::write(backup_path(&path), "server good;").unwrap();
        let writer = ConfigWriter::new(Scripted::default());

        writer.write_checked(false, b"server next;", &path).await.unwrap();
        assert_eq!(read(&path), "server good;\nserver next;");
        assert!(!backup_path(&path).exists());

        // Backup with the live file missing
        std::fs::rename(&path, backup_path(&path)).unwrap();
        let staged = writer.write_unchecked(false, b"server last;", &path).await.unwrap();
        assert!(staged.has_old_config());
        writer.commit(vec![staged]).await.unwrap();
        assert_eq!(read(&path), "server good;\nserver next;\nserver last;");
    }

    #[tokio::test]
    async fn test_run_to_completion_survives_dropped_caller() {
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let guard = Arc::clone(&lock).lock_owned().await;
        let flag = Arc::clone(&done);
        let work = async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        };
        let interrupted =
            tokio::time::timeout(std::time::Duration::from_millis(10), run_to_completion(guard, work)).await;
        assert!(interrupted.is_err());

        // The guard is released only once the work has finished
        let _guard = lock.lock().await;
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_run_to_completion_returns_guard() {
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        let guard = Arc::clone(&lock).lock_owned().await;

        let (guard, value) = run_to_completion(guard, async { 7 }).await.unwrap();
        assert_eq!(value, 7);
        assert!(lock.try_lock().is_err());
        drop(guard);
        assert!(lock.try_lock().is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_dir_failure() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("http");
        std::fs::write(&blocker, "not a directory").unwrap();
        let writer = ConfigWriter::new(Scripted::default());

        let err = writer
            .write_checked(true, b"x", &blocker.join("acme/servers.conf"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CreateDir { .. }));
    }
}
