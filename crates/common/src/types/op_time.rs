use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

use super::ClusterTime;

/// A position in a replica set's oplog: the timestamp of an entry plus the
/// election term it was written in. Ordered by `(term, ts)`.
#[cfg_attr(
    any(test, feature = "testing"),
    derive(proptest_derive::Arbitrary)
)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpTime {
    #[serde(rename = "ts")]
    pub ts: ClusterTime,
    #[serde(rename = "t")]
    pub term: i64,
}

impl OpTime {
    pub fn new(ts: ClusterTime, term: i64) -> Self {
        Self { ts, term }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "ts": self.ts.as_u64(), "t": self.term })
    }
}

impl PartialOrd for OpTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.term, self.ts).cmp(&(other.term, other.ts))
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{ts: {}, t: {}}}", self.ts, self.term)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ClusterTime,
        OpTime,
    };

    #[test]
    fn test_term_dominates_timestamp() {
        let old_term = OpTime::new(ClusterTime::new(100, 0), 1);
        let new_term = OpTime::new(ClusterTime::new(50, 0), 2);
        assert!(new_term > old_term);
    }
}
