//! Commit-path selection.

use crate::participant::{
    Participant,
    ReadOnly,
};

/// The commit protocol chosen for a transaction, decided from the observed
/// participant classifications when the commit statement arrives. Recorded
/// on the router so a commit retry after an unknown result re-runs the same
/// path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitType {
    /// No participants were ever contacted; nothing to commit remotely.
    NoShards,
    /// A single participant, read-only or not: one `commitTransaction`.
    SingleShard,
    /// Several participants, exactly one of which wrote: commit the readers
    /// first, then the writer.
    SingleWriteShard,
    /// Several participants, all read-only: commit them all in parallel.
    ReadOnly,
    /// Two or more writers: `coordinateCommitTransaction` on the
    /// coordinator.
    TwoPhaseCommit,
    /// Commit driven by a client recovery token naming a shard this router
    /// never contacted.
    RecoverWithToken,
}

impl CommitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoShards => "noShards",
            Self::SingleShard => "singleShard",
            Self::SingleWriteShard => "singleWriteShard",
            Self::ReadOnly => "readOnly",
            Self::TwoPhaseCommit => "twoPhaseCommit",
            Self::RecoverWithToken => "recoverWithToken",
        }
    }

    pub const COUNT: usize = 6;

    /// Stable index into per-commit-type metric arrays.
    pub fn index(&self) -> usize {
        match self {
            Self::NoShards => 0,
            Self::SingleShard => 1,
            Self::SingleWriteShard => 2,
            Self::ReadOnly => 3,
            Self::TwoPhaseCommit => 4,
            Self::RecoverWithToken => 5,
        }
    }
}

/// Pick the commit path from fully-classified participants. Callers must
/// have rejected unclassified (`Unset`) participants already.
pub fn decide_commit_type<'a>(
    participants: impl ExactSizeIterator<Item = &'a Participant> + Clone,
) -> CommitType {
    match participants.len() {
        0 => CommitType::NoShards,
        1 => CommitType::SingleShard,
        _ => {
            let writers = participants
                .filter(|p| p.read_only == ReadOnly::NotReadOnly)
                .count();
            match writers {
                0 => CommitType::ReadOnly,
                1 => CommitType::SingleWriteShard,
                _ => CommitType::TwoPhaseCommit,
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use common::types::{
        ReadConcern,
        StmtId,
    };

    use super::{
        decide_commit_type,
        CommitType,
    };
    use crate::participant::{
        Participant,
        ReadOnly,
        SharedOptions,
    };

    fn participant(read_only: ReadOnly) -> Participant {
        let mut p = Participant::new(false, StmtId::FIRST, SharedOptions {
            read_concern: ReadConcern::default(),
            at_cluster_time: None,
        });
        p.read_only = read_only;
        p
    }

    #[test]
    fn test_decision_table() {
        let ro = || participant(ReadOnly::ReadOnly);
        let rw = || participant(ReadOnly::NotReadOnly);

        let cases: Vec<(Vec<Participant>, CommitType)> = vec![
            (vec![], CommitType::NoShards),
            (vec![ro()], CommitType::SingleShard),
            (vec![rw()], CommitType::SingleShard),
            (vec![ro(), ro()], CommitType::ReadOnly),
            (vec![ro(), rw()], CommitType::SingleWriteShard),
            (vec![rw(), rw()], CommitType::TwoPhaseCommit),
            (vec![ro(), rw(), rw()], CommitType::TwoPhaseCommit),
        ];
        for (participants, expected) in cases {
            assert_eq!(decide_commit_type(participants.iter()), expected);
        }
    }
}
