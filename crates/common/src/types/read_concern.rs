use anyhow::Context;
use errors::ErrorMetadata;
use serde_json::Value;

use super::{
    ClusterTime,
    OpTime,
};
use crate::document::Document;

/// Read concern levels understood by the cluster. Transactions support
/// `local`, `majority` and `snapshot`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Snapshot,
    Available,
    Linearizable,
}

impl ReadConcernLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Majority => "majority",
            Self::Snapshot => "snapshot",
            Self::Available => "available",
            Self::Linearizable => "linearizable",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let level = match s {
            "local" => Self::Local,
            "majority" => Self::Majority,
            "snapshot" => Self::Snapshot,
            "available" => Self::Available,
            "linearizable" => Self::Linearizable,
            _ => anyhow::bail!(ErrorMetadata::bad_request(
                "InvalidReadConcernLevel",
                format!("unrecognized read concern level {s}"),
            )),
        };
        Ok(level)
    }

    pub fn supported_in_transaction(&self) -> bool {
        matches!(self, Self::Local | Self::Majority | Self::Snapshot)
    }
}

/// Read concern arguments as supplied by the client. `atClusterTime` is not
/// part of this: the router selects it and merges it in when attaching
/// snapshot read concern to participant requests.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReadConcern {
    pub level: Option<ReadConcernLevel>,
    pub after_cluster_time: Option<ClusterTime>,
    pub after_op_time: Option<OpTime>,
}

impl ReadConcern {
    pub fn snapshot() -> Self {
        Self {
            level: Some(ReadConcernLevel::Snapshot),
            ..Default::default()
        }
    }

    pub fn with_level(level: ReadConcernLevel) -> Self {
        Self {
            level: Some(level),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.level.is_none() && self.after_cluster_time.is_none() && self.after_op_time.is_none()
    }

    pub fn is_snapshot(&self) -> bool {
        self.level == Some(ReadConcernLevel::Snapshot)
    }

    /// Wire form, with the router-selected `atClusterTime` merged in when
    /// present. `None` when there is nothing to attach.
    pub fn to_document(&self, at_cluster_time: Option<ClusterTime>) -> Option<Document> {
        if self.is_empty() && at_cluster_time.is_none() {
            return None;
        }
        let mut doc = Document::new();
        if let Some(level) = self.level {
            doc.insert("level".to_owned(), Value::from(level.as_str()));
        }
        if let Some(after) = self.after_cluster_time {
            doc.insert("afterClusterTime".to_owned(), after.to_json());
        }
        if let Some(after) = self.after_op_time {
            doc.insert("afterOpTime".to_owned(), after.to_json());
        }
        if let Some(at) = at_cluster_time {
            doc.insert("atClusterTime".to_owned(), at.to_json());
        }
        Some(doc)
    }

    pub fn from_document(doc: &Document) -> anyhow::Result<Self> {
        let level = match doc.get("level") {
            Some(v) => {
                let s = v
                    .as_str()
                    .context("readConcern level must be a string")?;
                Some(ReadConcernLevel::parse(s)?)
            },
            None => None,
        };
        let after_cluster_time = doc
            .get("afterClusterTime")
            .and_then(Value::as_u64)
            .map(ClusterTime::from_u64);
        let after_op_time = match doc.get("afterOpTime") {
            Some(v) => Some(serde_json::from_value(v.clone())?),
            None => None,
        };
        Ok(Self {
            level,
            after_cluster_time,
            after_op_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{
        ReadConcern,
        ReadConcernLevel,
    };
    use crate::types::ClusterTime;

    #[test]
    fn test_empty_read_concern_attaches_nothing() {
        assert_eq!(ReadConcern::default().to_document(None), None);
    }

    #[test]
    fn test_snapshot_wire_form_includes_selected_time() {
        let doc = ReadConcern::snapshot()
            .to_document(Some(ClusterTime::new(3, 1)))
            .unwrap();
        assert_eq!(doc.get("level"), Some(&Value::from("snapshot")));
        assert_eq!(
            doc.get("atClusterTime"),
            Some(&ClusterTime::new(3, 1).to_json())
        );
    }

    #[test]
    fn test_non_snapshot_preserves_after_cluster_time() {
        let rc = ReadConcern {
            level: Some(ReadConcernLevel::Majority),
            after_cluster_time: Some(ClusterTime::new(10, 1)),
            after_op_time: None,
        };
        let doc = rc.to_document(None).unwrap();
        assert_eq!(
            doc.get("afterClusterTime"),
            Some(&ClusterTime::new(10, 1).to_json())
        );
        assert!(!doc.contains_key("atClusterTime"));
        assert_eq!(ReadConcern::from_document(&doc).unwrap(), rc);
    }

    #[test]
    fn test_unsupported_levels_in_transactions() {
        for level in [ReadConcernLevel::Available, ReadConcernLevel::Linearizable] {
            assert!(!level.supported_in_transaction());
        }
        for level in [
            ReadConcernLevel::Local,
            ReadConcernLevel::Majority,
            ReadConcernLevel::Snapshot,
        ] {
            assert!(level.supported_in_transaction());
        }
    }
}
