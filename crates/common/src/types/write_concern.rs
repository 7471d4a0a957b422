use std::time::Duration;

use serde_json::Value;

use crate::document::Document;

/// The `w` component of a write concern: an acknowledgement count or
/// `"majority"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteConcernW {
    Number(i64),
    Majority,
}

/// Client write concern, forwarded verbatim onto commit and abort bodies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteConcern {
    pub w: WriteConcernW,
    pub w_timeout: Option<Duration>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: WriteConcernW::Majority,
            w_timeout: None,
        }
    }

    pub fn nodes(n: i64) -> Self {
        Self {
            w: WriteConcernW::Number(n),
            w_timeout: None,
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        let w = match &self.w {
            WriteConcernW::Number(n) => Value::from(*n),
            WriteConcernW::Majority => Value::from("majority"),
        };
        doc.insert("w".to_owned(), w);
        if let Some(timeout) = self.w_timeout {
            doc.insert("wtimeout".to_owned(), Value::from(timeout.as_millis() as u64));
        }
        doc
    }
}
