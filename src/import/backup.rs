//! Local backup file: the last-resort sink for records that could not be
//! stored or queued.
//!
//! Newline-delimited JSON, one record per append. The file name carries the
//! timestamp the sink was created at, so one run writes one file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::{ImportError, PersistStrategy, Tier};
use crate::domain::User;

/// Append-only backup file.
pub struct BackupFile {
    path: PathBuf,
    // Serializes appends so lines never interleave.
    write_lock: Mutex<()>,
}

impl BackupFile {
    /// `failed_users_<YYYYMMDD_HHMMSS>.json` inside `dir`, stamped now.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let name = format!(
            "failed_users_{}.json",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        Self::at(dir.as_ref().join(name))
    }

    /// Backup file at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a JSON line. Creates the file if absent.
    pub async fn append(&self, user: &User) -> Result<(), ImportError> {
        let mut line = user.to_payload().map_err(ImportError::Serialization)?;
        line.push(b'\n');

        let backup_err = |source| ImportError::Backup {
            path: self.path.clone(),
            source,
        };

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(backup_err)?;
        file.write_all(&line).await.map_err(backup_err)?;
        file.flush().await.map_err(backup_err)?;
        Ok(())
    }
}

#[async_trait]
impl PersistStrategy for BackupFile {
    fn tier(&self) -> Tier {
        Tier::Backup
    }

    async fn persist(&self, user: &mut User) -> Result<(), ImportError> {
        match self.append(user).await {
            Ok(()) => {
                info!(
                    user_uuid = ?user.uuid,
                    path = %self.path.display(),
                    "User stored in backup file"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    user_uuid = ?user.uuid,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to write user to backup file"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_pattern() {
        let backup = BackupFile::new("/tmp");
        let name = backup.path().file_name().unwrap().to_str().unwrap();

        assert!(name.starts_with("failed_users_"));
        assert!(name.ends_with(".json"));
        // failed_users_ + YYYYMMDD_HHMMSS + .json
        assert_eq!(name.len(), "failed_users_".len() + 15 + ".json".len());
    }

    #[tokio::test]
    async fn test_appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path());

        let first = User::new("a@x.io", "1");
        let second = User::new("b@x.io", "2");
        backup.append(&first).await.unwrap();
        backup.append(&second).await.unwrap();

        let content = std::fs::read_to_string(backup.path()).unwrap();
        let lines: Vec<User> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![first, second]);
    }

    #[derive(Clone, Default)]
    struct Levels(std::sync::Arc<std::sync::Mutex<Vec<tracing::Level>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for Levels {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    #[tokio::test]
    async fn test_successful_write_logs_at_info() {
        use tracing_subscriber::layer::SubscriberExt;

        let levels = Levels::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(levels.clone()));

        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::new(dir.path());
        let mut user = User::new("a@x.io", "1");
        backup.persist(&mut user).await.unwrap();

        assert_eq!(*levels.0.lock().unwrap(), vec![tracing::Level::INFO]);
    }

    #[tokio::test]
    async fn test_unwritable_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backup = BackupFile::at(dir.path().join("missing").join("backup.json"));

        let mut user = User::new("a@x.io", "1");
        let err = backup.persist(&mut user).await.unwrap_err();
        assert!(matches!(err, ImportError::Backup { .. }));
    }
}
