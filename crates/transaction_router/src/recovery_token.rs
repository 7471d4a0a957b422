//! The recovery token returned to clients on commit, and sent back by them
//! on commit retries that may land on a different router.

use common::{
    types::ShardId,
    Document,
};
use serde::{
    Deserialize,
    Serialize,
};

/// `{ recoveryShardId?: <shard> }`, and nothing else. The named shard is the
/// transaction's recovery shard: the place a later commit retry can learn
/// the transaction's outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryToken {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_shard_id: Option<ShardId>,
}

impl RecoveryToken {
    pub fn new(recovery_shard_id: Option<ShardId>) -> Self {
        Self { recovery_shard_id }
    }

    pub fn to_document(&self) -> Document {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => Document::new(),
        }
    }

    pub fn from_document(doc: &Document) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            doc.clone(),
        ))?)
    }
}
