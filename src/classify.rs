//! Classifies in-flight LOCAL actions after a sync attempt by diffing them
//! against the authoritative SYNCED layer.

use crate::db::{repo, ActionKey, ActionRow, Pool};
use crate::model::SyncStatus;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use tracing::instrument;

/// Verdict for one LOCAL row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The synced layer absorbed the change; the LOCAL row can go.
    Absorbed,
    /// The intended change never appeared (or appeared differently)
    /// server-side.
    Failed,
}

/// Compare one LOCAL row against its SYNCED counterpart, if any.
pub fn classify(local: &ActionRow, synced: Option<&ActionRow>) -> Verdict {
    match synced {
        Some(synced) => {
            if synced.reserved != local.reserved || synced.offered != local.offered {
                Verdict::Failed
            } else {
                Verdict::Absorbed
            }
        }
        None => {
            if local.reserved != 0 || local.offered != 0 {
                Verdict::Failed
            } else {
                // A cancellation of something the server no longer knows
                // about; nothing to confirm.
                Verdict::Absorbed
            }
        }
    }
}

/// Outcome counts of one classifier pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncTally {
    pub failed: u64,
    pub succeeded: u64,
}

/// Run the classifier over every LOCAL action of one credential. FAILED
/// rows are flipped in place, absorbed rows deleted; no LOCAL row is ever
/// created here.
#[instrument(skip(pool))]
pub async fn finalize_sync(pool: &Pool, credential_id: i64) -> Result<SyncTally> {
    let locals = repo::actions_by_status(pool, credential_id, SyncStatus::Local).await?;
    let synced: HashMap<ActionKey, ActionRow> =
        repo::actions_by_status(pool, credential_id, SyncStatus::Synced)
            .await?
            .into_iter()
            .map(|row| (row.key(), row))
            .collect();

    let mut tally = SyncTally::default();
    let now = Utc::now();
    let mut tx = pool.begin().await?;
    for local in &locals {
        match classify(local, synced.get(&local.key())) {
            Verdict::Failed => {
                repo::fail_local_action_tx(&mut tx, local, now).await?;
                tally.failed += 1;
            }
            Verdict::Absorbed => {
                repo::delete_local_action_tx(&mut tx, local).await?;
                tally.succeeded += 1;
            }
        }
    }
    tx.commit().await?;

    tracing::info!(
        credential_id,
        failed = tally.failed,
        succeeded = tally.succeeded,
        "classifier pass finished"
    );
    Ok(tally)
}
