//! Mock remote command executor for router tests: scripts responses per
//! shard and records every outbound request.

use std::collections::{
    HashMap,
    VecDeque,
};

use async_trait::async_trait;
use common::{
    remote::RemoteCommandExecutor,
    types::ShardId,
    CommandResponse,
    Document,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub shard_id: ShardId,
    pub db: String,
    pub body: Document,
}

const KNOWN_COMMANDS: &[&str] = &[
    "abortTransaction",
    "commitTransaction",
    "coordinateCommitTransaction",
    "insert",
    "update",
    "delete",
    "find",
    "aggregate",
];

impl RecordedRequest {
    pub fn command_name(&self) -> &'static str {
        KNOWN_COMMANDS
            .iter()
            .find(|name| self.body.contains_key(**name))
            .copied()
            .unwrap_or("unknown")
    }
}

pub enum Scripted {
    Response(CommandResponse),
    TransportError(ErrorMetadata),
}

#[derive(Default)]
pub struct TestExecutor {
    scripted: Mutex<HashMap<ShardId, VecDeque<Scripted>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl TestExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_response(&self, shard_id: &ShardId, response: CommandResponse) {
        self.scripted
            .lock()
            .entry(shard_id.clone())
            .or_default()
            .push_back(Scripted::Response(response));
    }

    pub fn enqueue_transport_error(&self, shard_id: &ShardId, error: ErrorMetadata) {
        self.scripted
            .lock()
            .entry(shard_id.clone())
            .or_default()
            .push_back(Scripted::TransportError(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn take_requests(&self) -> Vec<RecordedRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub fn requests_named(&self, command_name: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.command_name() == command_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl RemoteCommandExecutor for TestExecutor {
    async fn run_command(
        &self,
        shard_id: &ShardId,
        db: &str,
        command: Document,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<CommandResponse> {
        self.requests.lock().push(RecordedRequest {
            shard_id: shard_id.clone(),
            db: db.to_owned(),
            body: command,
        });
        let scripted = self
            .scripted
            .lock()
            .get_mut(shard_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            None => Ok(CommandResponse::ok()),
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::TransportError(error)) => Err(anyhow::anyhow!(error)),
        }
    }
}
