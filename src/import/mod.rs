//! Bulk user import.
//!
//! Each record is admitted into a bounded set of in-flight slots and then
//! walked down a ranked list of persist strategies until one succeeds:
//!
//! 1. `DirectWrite`: create in its own transaction
//! 2. `QueuePublish`: hand to the queue consumer, with fixed-delay retry
//! 3. `BackupFile`: append to a local newline-delimited JSON file
//!
//! A record that is not admitted skips the direct write and runs its fallback
//! in the submission loop, so at most one rejected record is in its fallback
//! tiers at a time. A record that falls
//! through every tier is lost; that is only visible in the logs and in
//! [`ImportReport::lost`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::bus::BusError;
use crate::domain::User;
use crate::services::ServiceError;

mod admission;
mod backup;
mod strategy;

pub use admission::{Admission, AdmissionPolicy, Slot};
pub use backup::BackupFile;
pub use strategy::{DirectWrite, QueuePublish};

/// Errors raised by the import pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("Failed to read batch source {path}: {message}")]
    Source { path: PathBuf, message: String },

    #[error("Direct write failed: {0}")]
    Direct(#[from] ServiceError),

    #[error("Publish failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: BusError,
    },

    #[error("Failed to write backup file {path}: {source}")]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Rank of a persist strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    DirectWrite,
    QueuePublish,
    Backup,
}

/// One way of getting a record stored.
#[async_trait]
pub trait PersistStrategy: Send + Sync {
    fn tier(&self) -> Tier;

    async fn persist(&self, user: &mut User) -> Result<(), ImportError>;
}

/// Where a record ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Persisted(Tier),
    Lost,
}

/// Per-tier counts for one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub total: usize,
    pub committed: usize,
    pub queued: usize,
    pub backed_up: usize,
    pub lost: usize,
    /// Records turned away by admission control (counted again by tier).
    pub rejected: usize,
    pub peak_in_flight: usize,
}

impl ImportReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Persisted(Tier::DirectWrite) => self.committed += 1,
            Outcome::Persisted(Tier::QueuePublish) => self.queued += 1,
            Outcome::Persisted(Tier::Backup) => self.backed_up += 1,
            Outcome::Lost => self.lost += 1,
        }
    }
}

/// Import configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// JSON array of user records.
    pub source: PathBuf,
    /// Maximum records in flight at once.
    pub capacity: usize,
    pub admission: AdmissionPolicy,
    /// Total publish attempts before falling back to the backup file.
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    /// Directory the backup file is created in.
    pub backup_dir: PathBuf,
}

impl ImportConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("users_data.json"),
            capacity: 10,
            admission: AdmissionPolicy::Reject,
            max_retries: 3,
            retry_delay_ms: 2000,
            backup_dir: PathBuf::from("."),
        }
    }
}

/// Read a batch of users from a JSON array file.
pub async fn load_batch(path: impl AsRef<Path>) -> Result<Vec<User>, ImportError> {
    let path = path.as_ref();
    let source_err = |message: String| ImportError::Source {
        path: path.to_path_buf(),
        message,
    };

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| source_err(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| source_err(e.to_string()))
}

/// Runs a batch through admission control and the ranked strategies.
pub struct Importer {
    tiers: Arc<[Arc<dyn PersistStrategy>]>,
    admission: Admission,
}

impl Importer {
    /// `tiers` are tried in order.
    pub fn new(tiers: Vec<Arc<dyn PersistStrategy>>, admission: Admission) -> Self {
        Self {
            tiers: tiers.into(),
            admission,
        }
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Process every record and wait for all of them to finish.
    pub async fn run(&self, users: Vec<User>) -> ImportReport {
        let mut report = ImportReport {
            total: users.len(),
            ..Default::default()
        };
        let mut tasks = JoinSet::new();

        for mut user in users {
            let uuid = user.ensure_uuid();
            let tiers = Arc::clone(&self.tiers);
            let span = info_span!("import.record", user_uuid = %uuid);

            match self.admission.admit().await {
                Some(slot) => {
                    tasks.spawn(
                        async move {
                            let _slot = slot;
                            persist(&tiers, &mut user, false).await
                        }
                        .instrument(span),
                    );
                }
                None => {
                    // Handled inline: overload paces the loop instead of
                    // piling up tasks.
                    report.rejected += 1;
                    span.in_scope(|| warn!("Capacity exhausted, routing record to fallback"));
                    let outcome = persist(&tiers, &mut user, true).instrument(span).await;
                    report.record(outcome);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(error = %e, "Import task failed");
                    report.lost += 1;
                }
            }
        }

        report.peak_in_flight = self.admission.peak();
        info!(
            total = report.total,
            committed = report.committed,
            queued = report.queued,
            backed_up = report.backed_up,
            lost = report.lost,
            rejected = report.rejected,
            peak_in_flight = report.peak_in_flight,
            "Import finished"
        );
        report
    }
}

/// Walk the tiers in order; each is fully attempted before the next.
async fn persist(tiers: &[Arc<dyn PersistStrategy>], user: &mut User, skip_direct: bool) -> Outcome {
    for strategy in tiers {
        let tier = strategy.tier();
        if skip_direct && tier == Tier::DirectWrite {
            continue;
        }
        match strategy.persist(user).await {
            Ok(()) => return Outcome::Persisted(tier),
            Err(e) => warn!(tier = ?tier, error = %e, "Persist tier failed"),
        }
    }

    error!(
        email = %user.email,
        payload = %String::from_utf8_lossy(&user.to_payload().unwrap_or_default()),
        "Every persist tier failed, record lost"
    );
    Outcome::Lost
}
