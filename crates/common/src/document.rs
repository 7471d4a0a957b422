//! Wire-shaped command bodies and responses.
//!
//! Command bodies travel as JSON objects in-process; parsing the cluster's
//! binary wire format happens at the transport edge and is out of scope
//! here.

use errors::{
    ErrorCode,
    ErrorMetadata,
};
use serde_json::Value;

/// A command body or response body.
pub type Document = serde_json::Map<String, Value>;

/// The response to a remote command that reached the shard and ran. The body
/// may still describe a command-level failure (`{"ok": 0, ...}`).
#[derive(Clone, Debug, PartialEq)]
pub struct CommandResponse {
    body: Document,
}

impl CommandResponse {
    pub fn new(body: Document) -> Self {
        Self { body }
    }

    pub fn ok() -> Self {
        let mut body = Document::new();
        body.insert("ok".to_owned(), Value::from(1));
        Self { body }
    }

    pub fn error(code: ErrorCode, errmsg: &str) -> Self {
        let mut body = Document::new();
        body.insert("ok".to_owned(), Value::from(0));
        body.insert("code".to_owned(), Value::from(code.as_i32()));
        body.insert("errmsg".to_owned(), Value::from(errmsg));
        Self { body }
    }

    pub fn is_ok(&self) -> bool {
        match self.body.get("ok") {
            Some(Value::Number(n)) => n.as_f64() == Some(1.0),
            Some(Value::Bool(b)) => *b,
            _ => false,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        let code = self.body.get("code")?.as_i64()?;
        ErrorCode::from_i32(code as i32)
    }

    pub fn errmsg(&self) -> Option<&str> {
        self.body.get("errmsg")?.as_str()
    }

    /// The `readOnly` classification shards report on in-transaction
    /// statement responses.
    pub fn read_only(&self) -> Option<bool> {
        self.body.get("readOnly")?.as_bool()
    }

    pub fn write_concern_error(&self) -> Option<&Value> {
        self.body.get("writeConcernError")
    }

    pub fn body(&self) -> &Document {
        &self.body
    }

    pub fn into_body(self) -> Document {
        self.body
    }

    /// Turn a command-level failure into a classified error; ok responses
    /// pass through.
    pub fn into_status(self) -> anyhow::Result<CommandResponse> {
        if self.is_ok() {
            return Ok(self);
        }
        let msg = self
            .errmsg()
            .unwrap_or("remote command failed")
            .to_owned();
        match self.error_code() {
            Some(code) => {
                let metadata = ErrorMetadata::new(code, "RemoteCommandError", msg);
                metadata.record();
                anyhow::bail!(metadata)
            },
            None => anyhow::bail!("remote command failed without a recognized code: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::{
        ErrorCode,
        ErrorMetadataAnyhowExt,
    };
    use serde_json::json;

    use super::{
        CommandResponse,
        Document,
    };

    fn doc(value: serde_json::Value) -> Document {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn test_ok_detection() {
        assert!(CommandResponse::ok().is_ok());
        assert!(CommandResponse::new(doc(json!({"ok": 1.0, "readOnly": true}))).is_ok());
        assert!(!CommandResponse::new(doc(json!({"ok": 0, "code": 251}))).is_ok());
        assert!(!CommandResponse::new(doc(json!({}))).is_ok());
    }

    #[test]
    fn test_error_code_parsing() {
        let resp = CommandResponse::error(ErrorCode::NoSuchTransaction, "no such transaction");
        assert_eq!(resp.error_code(), Some(ErrorCode::NoSuchTransaction));
        let err = resp.into_status().unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::NoSuchTransaction));
    }

    #[test]
    fn test_read_only_flag() {
        let resp = CommandResponse::new(doc(json!({"ok": 1, "readOnly": false})));
        assert_eq!(resp.read_only(), Some(false));
        assert_eq!(CommandResponse::ok().read_only(), None);
    }
}
