//! Resend Engine: replay pending artifacts after a reconnect (spec 4.9).
//!
//! On every fresh binding the three [`crate::pending::PendingStore`] maps are
//! replayed to the orchestrator, since a reconnect means everything sent
//! over the old socket may never have been acked. Each artifact gets its own
//! attempt budget and linear backoff; one artifact exhausting its budget
//! does not block the others from being attempted.

use std::time::Duration;

use tracing::{debug, warn};

use super::HostSession;
use crate::error::HostError;
use crate::pending::PendingStore;
use crate::rpc::HostMethod;

/// Which of [`PendingStore`]'s three maps a replayed artifact belongs to, so
/// [`replay_one`] can clear the right entry once the artifact is no longer
/// in need of replay.
#[derive(Clone, Copy)]
enum ArtifactKind {
    Io,
    Layout,
    Loading,
}

async fn clear_artifact(pending: &PendingStore, kind: ArtifactKind, key: &str) {
    match kind {
        ArtifactKind::Io => pending.remove_io(key).await,
        ArtifactKind::Layout => pending.remove_layout(key).await,
        ArtifactKind::Loading => pending.remove_loading(key).await,
    }
}

/// Replay every pending I/O call, page layout, and loading state against the
/// session's current transport, up to `max_attempts` rounds per artifact
/// with `retry_interval * attemptNumber` backoff between attempts.
pub(super) async fn replay_pending(session: &HostSession, max_attempts: u32, retry_interval: Duration) {
    let pending = session.pending();
    let rpc = session.rpc();

    for (transaction_id, instruction) in pending.snapshot_io().await {
        replay_one(
            rpc,
            pending,
            max_attempts,
            retry_interval,
            HostMethod::SendIoCall,
            serde_json::json!({
                "transactionId": transaction_id.clone(),
                "ioCall": instruction.to_string(),
            }),
            ArtifactKind::Io,
            &transaction_id,
        )
        .await;
    }

    for (page_key, layout) in pending.snapshot_layouts().await {
        replay_one(
            rpc,
            pending,
            max_attempts,
            retry_interval,
            HostMethod::SendPage,
            serde_json::json!({
                "pageKey": page_key.clone(),
                "page": layout.to_string(),
            }),
            ArtifactKind::Layout,
            &page_key,
        )
        .await;
    }

    for (scope_id, state) in pending.snapshot_loading().await {
        let mut payload = state;
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("transactionId".into(), serde_json::Value::String(scope_id.clone()));
        }
        replay_one(
            rpc,
            pending,
            max_attempts,
            retry_interval,
            HostMethod::SendLoadingCall,
            payload,
            ArtifactKind::Loading,
            &scope_id,
        )
        .await;
    }
}

/// Replay a single artifact, clearing it from `pending` once it no longer
/// needs replay: on a successful round trip (including a response whose
/// body itself reports `{"type":"ERROR"}` — per spec 4.7 that's still a
/// terminal outcome, not a reason to keep retrying) or on a terminal I/O
/// error kind (`CANCELED`/`TRANSACTION_CLOSED`/a rejected `SEND_IO_CALL`).
/// Any other error backs off and retries up to `max_attempts`, leaving the
/// entry in place for the next reconnect's replay.
#[expect(clippy::too_many_arguments, reason = "mirrors the artifact's own wire shape plus its pending-map identity")]
async fn replay_one(
    rpc: &crate::rpc::RpcClient,
    pending: &PendingStore,
    max_attempts: u32,
    retry_interval: Duration,
    method: HostMethod,
    payload: serde_json::Value,
    kind: ArtifactKind,
    key: &str,
) {
    for attempt in 1..=max_attempts.max(1) {
        match rpc.send(method, payload.clone(), attempt).await {
            Ok(_) => {
                clear_artifact(pending, kind, key).await;
                return;
            }
            Err(HostError::Canceled | HostError::TransactionClosed | HostError::RenderError(_)) => {
                debug!(%method, %key, "resend hit a terminal I/O error, dropping the artifact");
                clear_artifact(pending, kind, key).await;
                return;
            }
            Err(err) => {
                debug!(%method, attempt, error = %err, "resend attempt failed");
                if attempt < max_attempts {
                    tokio::time::sleep(retry_interval.saturating_mul(attempt)).await;
                }
            }
        }
    }
    warn!(%method, "resend exhausted attempt budget, giving up on this artifact");
}
