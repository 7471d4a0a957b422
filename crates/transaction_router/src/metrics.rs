//! Router transaction metrics.
//!
//! These are plain atomics on an injectable object rather than registry
//! globals: every router holds an `Arc<RouterMetrics>`, and tests hand each
//! router a fresh instance. A process-wide default exists for server wiring.

use std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use common::Document;
use serde_json::Value;

use crate::commit::CommitType;

#[derive(Default)]
pub struct CommitTypeStats {
    pub initiated: AtomicU64,
    pub successful: AtomicU64,
    pub successful_duration_micros: AtomicU64,
}

#[derive(Default)]
pub struct RouterMetrics {
    pub total_started: AtomicU64,
    pub total_committed: AtomicU64,
    pub total_aborted: AtomicU64,
    /// Participants added to transactions, counted at first contact.
    pub total_contacted_participants: AtomicU64,
    /// Distinct participant targeting events; transport retries of one
    /// targeting don't count.
    pub total_requests_targeted: AtomicU64,
    /// Participants at the moment commit began, credited once per
    /// transaction even when the commit is retried.
    pub total_participants_at_commit: AtomicU64,
    commit_types: [CommitTypeStats; CommitType::COUNT],
}

impl RouterMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commit_type_stats(&self, commit_type: CommitType) -> &CommitTypeStats {
        &self.commit_types[commit_type.index()]
    }

    pub fn note_commit_initiated(&self, commit_type: CommitType) {
        self.commit_type_stats(commit_type)
            .initiated
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_commit_successful(&self, commit_type: CommitType, duration: Duration) {
        let stats = self.commit_type_stats(commit_type);
        stats.successful.fetch_add(1, Ordering::Relaxed);
        stats
            .successful_duration_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn server_status(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(
            "totalStarted".to_owned(),
            Value::from(self.total_started.load(Ordering::Relaxed)),
        );
        doc.insert(
            "totalCommitted".to_owned(),
            Value::from(self.total_committed.load(Ordering::Relaxed)),
        );
        doc.insert(
            "totalAborted".to_owned(),
            Value::from(self.total_aborted.load(Ordering::Relaxed)),
        );
        doc.insert(
            "totalContactedParticipants".to_owned(),
            Value::from(self.total_contacted_participants.load(Ordering::Relaxed)),
        );
        doc.insert(
            "totalRequestsTargeted".to_owned(),
            Value::from(self.total_requests_targeted.load(Ordering::Relaxed)),
        );
        doc.insert(
            "totalParticipantsAtCommit".to_owned(),
            Value::from(self.total_participants_at_commit.load(Ordering::Relaxed)),
        );

        let mut commit_types = Document::new();
        for commit_type in [
            CommitType::NoShards,
            CommitType::SingleShard,
            CommitType::SingleWriteShard,
            CommitType::ReadOnly,
            CommitType::TwoPhaseCommit,
            CommitType::RecoverWithToken,
        ] {
            let stats = self.commit_type_stats(commit_type);
            let mut entry = Document::new();
            entry.insert(
                "initiated".to_owned(),
                Value::from(stats.initiated.load(Ordering::Relaxed)),
            );
            entry.insert(
                "successful".to_owned(),
                Value::from(stats.successful.load(Ordering::Relaxed)),
            );
            entry.insert(
                "successfulDurationMicros".to_owned(),
                Value::from(stats.successful_duration_micros.load(Ordering::Relaxed)),
            );
            commit_types.insert(commit_type.as_str().to_owned(), Value::Object(entry));
        }
        doc.insert("commitTypes".to_owned(), Value::Object(commit_types));
        doc
    }
}
