//! The seam to shard primaries: a capability to send a named command and
//! await the response. Transport belongs to the host process; retry policy
//! lives here.

use async_trait::async_trait;
use errors::ErrorMetadataAnyhowExt;
use tokio_util::sync::CancellationToken;

use crate::{
    document::{
        CommandResponse,
        Document,
    },
    types::ShardId,
};

/// Commit, abort and coordinate-commit all run on the admin database.
pub const ADMIN_DB: &str = "admin";

/// Sends a command body to a shard's primary and awaits the outcome.
///
/// `Err` is a transport-level failure (the command may or may not have run),
/// classified via `ErrorMetadata`; `Ok` carries the command-level response,
/// which may itself be non-ok. Implementations must return promptly with an
/// error when `cancel` fires.
#[async_trait]
pub trait RemoteCommandExecutor: Send + Sync + 'static {
    async fn run_command(
        &self,
        shard_id: &ShardId,
        db: &str,
        command: Document,
        cancel: &CancellationToken,
    ) -> anyhow::Result<CommandResponse>;
}

/// Run an idempotent command, retrying transport-retryable failures up to
/// `REMOTE_RETRY_ATTEMPTS` total attempts.
pub async fn run_idempotent(
    executor: &dyn RemoteCommandExecutor,
    shard_id: &ShardId,
    db: &str,
    command: Document,
    cancel: &CancellationToken,
) -> anyhow::Result<CommandResponse> {
    let attempts = (*crate::knobs::REMOTE_RETRY_ATTEMPTS).max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match executor
            .run_command(shard_id, db, command.clone(), cancel)
            .await
        {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable_remote() && attempt < attempts => {
                tracing::debug!(
                    shard = %shard_id,
                    attempt,
                    error = %e,
                    "Retrying idempotent remote command"
                );
            },
            Err(e) => return Err(e),
        }
    }
}
