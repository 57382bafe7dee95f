//! ConfirmationStore — pending destructive actions awaiting user approval.
//!
//! One batch per identity. Expiry is computed from the stored creation time
//! and timeout on every access; nothing runs in the background. A batch
//! leaves `Pending` exactly once and is removed from the store when it does.

use chrono::{DateTime, Utc};

use super::database::{self, SharedDatabase};
use super::errors::AgentError;
use super::types::{
    ActionStatus, BatchStatus, ConfirmationBatch, Decision, PendingAction, Resolution,
    ResolvedAction, Verdict,
};

/// Default minutes before an unanswered batch lapses.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 5;

/// Persisted confirmation batches, keyed by identity.
#[derive(Clone)]
pub struct ConfirmationStore {
    db: SharedDatabase,
}

impl ConfirmationStore {
    pub fn new(db: SharedDatabase) -> Self {
        Self { db }
    }

    /// Open a batch for `identity`.
    ///
    /// A lapsed batch left behind is expired first. An unexpired one is a
    /// conflict: batches are never silently replaced.
    pub fn propose(
        &self,
        identity: &str,
        actions: Vec<PendingAction>,
        timeout_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<ConfirmationBatch, AgentError> {
        let db = database::lock(&self.db)?;

        if let Some(existing) = db.get_batch_for_identity(identity)? {
            if !existing.is_expired(now) {
                return Err(AgentError::ConfirmationConflictError {
                    identity: identity.to_string(),
                    batch_id: existing.id,
                });
            }
            db.delete_batch(&existing.id)?;
            tracing::info!(identity = %identity, batch = %existing.id, "expired batch swept on propose");
        }

        let actions = actions
            .into_iter()
            .enumerate()
            .map(|(i, mut action)| {
                action.id = (i + 1).to_string();
                action.status = ActionStatus::Pending;
                action
            })
            .collect();

        let batch = ConfirmationBatch {
            id: short_id(),
            identity: identity.to_string(),
            created_at: now,
            timeout_minutes,
            status: BatchStatus::Pending,
            actions,
        };
        db.insert_batch(&batch)?;

        tracing::info!(
            identity = %identity,
            batch = %batch.id,
            actions = batch.actions.len(),
            timeout_minutes,
            "confirmation batch proposed"
        );
        Ok(batch)
    }

    /// Apply a decision to the identity's batch.
    ///
    /// `Confirm` and `Reject` act on the action named by `selector`; without a
    /// selector they act on every pending action, as does `ConfirmAll`.
    /// An expired batch is left untouched and reported as
    /// [`AgentError::BatchExpiredError`]; [`Self::expire`] removes it.
    pub fn resolve(
        &self,
        identity: &str,
        decision: Decision,
        selector: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Resolution, AgentError> {
        let db = database::lock(&self.db)?;

        let mut batch = db
            .get_batch_for_identity(identity)?
            .ok_or_else(|| AgentError::NoBatchError {
                identity: identity.to_string(),
            })?;

        if batch.is_expired(now) {
            return Err(AgentError::BatchExpiredError { batch_id: batch.id });
        }

        let selector = match decision {
            Decision::ConfirmAll => None,
            Decision::Confirm | Decision::Reject => selector,
        };
        let (new_status, verdict) = match decision {
            Decision::Confirm | Decision::ConfirmAll => (ActionStatus::Approved, Verdict::Execute),
            Decision::Reject => (ActionStatus::Rejected, Verdict::Discard),
        };

        if let Some(id) = selector {
            let named_pending = batch
                .actions
                .iter()
                .any(|a| a.id == id && a.status == ActionStatus::Pending);
            if !named_pending {
                return Err(AgentError::UnknownAction {
                    batch_id: batch.id,
                    action_id: id.to_string(),
                });
            }
        }

        let mut resolved = Vec::new();
        for action in batch.actions.iter_mut() {
            let selected = selector.map(|id| action.id == id).unwrap_or(true);
            if selected && action.status == ActionStatus::Pending {
                action.status = new_status;
                resolved.push(ResolvedAction {
                    action: action.clone(),
                    verdict,
                });
            }
        }

        if batch.pending_count() == 0 {
            let any_approved = batch
                .actions
                .iter()
                .any(|a| a.status == ActionStatus::Approved);
            batch.status = if any_approved {
                BatchStatus::Confirmed
            } else {
                BatchStatus::Rejected
            };
            db.delete_batch(&batch.id)?;
        } else {
            db.update_batch(&batch)?;
        }

        tracing::info!(
            identity = %identity,
            batch = %batch.id,
            decision = ?decision,
            affected = resolved.len(),
            status = batch.status.as_str(),
            "confirmation decision applied"
        );
        Ok(Resolution { batch, resolved })
    }

    /// The identity's batch if it is still open.
    pub fn pending(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ConfirmationBatch>, AgentError> {
        let batch = database::lock(&self.db)?.get_batch_for_identity(identity)?;
        Ok(batch.filter(|b| !b.is_expired(now)))
    }

    /// Expire and remove the identity's batch if it has lapsed.
    pub fn expire(
        &self,
        identity: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ConfirmationBatch>, AgentError> {
        let db = database::lock(&self.db)?;
        match db.get_batch_for_identity(identity)? {
            Some(mut batch) if batch.is_expired(now) => {
                batch.status = BatchStatus::Expired;
                db.delete_batch(&batch.id)?;
                tracing::info!(identity = %identity, batch = %batch.id, "confirmation batch expired");
                Ok(Some(batch))
            }
            _ => Ok(None),
        }
    }

    /// Expire and remove every lapsed batch. Never touches the vault.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<ConfirmationBatch>, AgentError> {
        let db = database::lock(&self.db)?;
        let mut expired = Vec::new();
        for mut batch in db.list_batches()? {
            if batch.is_expired(now) {
                batch.status = BatchStatus::Expired;
                db.delete_batch(&batch.id)?;
                expired.push(batch);
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "swept expired confirmation batches");
        }
        Ok(expired)
    }

    /// Move the base hash of the identity's still-pending actions on `target`
    /// to `hash`, after an approved action from the same batch changed it.
    ///
    /// Returns how many actions were rebased. No open batch is not an error.
    pub fn rebase(
        &self,
        identity: &str,
        target: &str,
        hash: Option<&str>,
    ) -> Result<usize, AgentError> {
        let db = database::lock(&self.db)?;
        let Some(mut batch) = db.get_batch_for_identity(identity)? else {
            return Ok(0);
        };
        let mut rebased = 0;
        for action in batch.actions.iter_mut() {
            if action.status == ActionStatus::Pending && action.target == target {
                action.base_hash = hash.map(str::to_string);
                rebased += 1;
            }
        }
        if rebased > 0 {
            db.update_batch(&batch)?;
            tracing::debug!(identity = %identity, batch = %batch.id, target = %target, rebased, "pending actions rebased");
        }
        Ok(rebased)
    }

    /// Drop the identity's batch regardless of state (history clear).
    pub fn discard(&self, identity: &str) -> Result<Option<ConfirmationBatch>, AgentError> {
        let db = database::lock(&self.db)?;
        let batch = db.get_batch_for_identity(identity)?;
        if let Some(ref b) = batch {
            db.delete_batch(&b.id)?;
        }
        Ok(batch)
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::database::AgentDatabase;
    use crate::agent_core::types::{ActionKind, ActionPreview};
    use chrono::Duration;

    fn test_store() -> ConfirmationStore {
        ConfirmationStore::new(AgentDatabase::open(":memory:").unwrap().shared())
    }

    fn action(target: &str) -> PendingAction {
        PendingAction {
            id: String::new(),
            tool_call_id: format!("call_{target}"),
            tool_name: "delete_note".to_string(),
            kind: ActionKind::Delete,
            target: target.to_string(),
            preview: ActionPreview {
                summary: format!("Delete note {target}"),
                before: None,
                after: None,
            },
            arguments: serde_json::json!({"path": target}),
            base_hash: None,
            status: ActionStatus::Pending,
        }
    }

    #[test]
    fn test_propose_assigns_ids() {
        let store = test_store();
        let now = Utc::now();
        let batch = store
            .propose("u1", vec![action("A.md"), action("B.md")], 5, now)
            .unwrap();
        assert_eq!(batch.id.len(), 8);
        assert_eq!(batch.actions[0].id, "1");
        assert_eq!(batch.actions[1].id, "2");
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(store.pending("u1", now).unwrap().is_some());
    }

    #[test]
    fn test_propose_conflicts_with_open_batch() {
        let store = test_store();
        let now = Utc::now();
        let first = store.propose("u1", vec![action("A.md")], 5, now).unwrap();
        let err = store
            .propose("u1", vec![action("B.md")], 5, now + Duration::minutes(1))
            .unwrap_err();
        match err {
            AgentError::ConfirmationConflictError { batch_id, .. } => assert_eq!(batch_id, first.id),
            other => panic!("unexpected error: {other:?}"),
        }
        // Other identities are independent.
        store.propose("u2", vec![action("B.md")], 5, now).unwrap();
    }

    #[test]
    fn test_propose_replaces_expired_batch() {
        let store = test_store();
        let now = Utc::now();
        store.propose("u1", vec![action("A.md")], 5, now).unwrap();
        let second = store
            .propose("u1", vec![action("B.md")], 5, now + Duration::minutes(6))
            .unwrap();
        assert_eq!(second.actions[0].target, "B.md");
    }

    #[test]
    fn test_confirm_all_resolves_every_action() {
        let store = test_store();
        let now = Utc::now();
        store
            .propose("u1", vec![action("A.md"), action("B.md"), action("C.md")], 5, now)
            .unwrap();

        let res = store.resolve("u1", Decision::ConfirmAll, None, now).unwrap();
        assert_eq!(res.resolved.len(), 3);
        assert!(res.resolved.iter().all(|r| r.verdict == Verdict::Execute));
        assert_eq!(res.batch.pending_count(), 0);
        assert_eq!(res.batch.status, BatchStatus::Confirmed);
        assert!(res.is_complete());

        // Resolved batches are gone; a second decision has nothing to act on.
        let err = store.resolve("u1", Decision::ConfirmAll, None, now).unwrap_err();
        assert!(matches!(err, AgentError::NoBatchError { .. }));
    }

    #[test]
    fn test_individual_decisions() {
        let store = test_store();
        let now = Utc::now();
        store
            .propose("u1", vec![action("A.md"), action("B.md")], 5, now)
            .unwrap();

        let res = store.resolve("u1", Decision::Reject, Some("2"), now).unwrap();
        assert_eq!(res.resolved.len(), 1);
        assert_eq!(res.resolved[0].action.target, "B.md");
        assert_eq!(res.resolved[0].verdict, Verdict::Discard);
        assert!(!res.is_complete());

        // Already decided action cannot be decided again.
        let err = store.resolve("u1", Decision::Confirm, Some("2"), now).unwrap_err();
        assert!(matches!(err, AgentError::UnknownAction { .. }));
        let err = store.resolve("u1", Decision::Confirm, Some("9"), now).unwrap_err();
        assert!(matches!(err, AgentError::UnknownAction { .. }));

        let res = store.resolve("u1", Decision::Confirm, Some("1"), now).unwrap();
        assert_eq!(res.resolved[0].verdict, Verdict::Execute);
        assert_eq!(res.batch.status, BatchStatus::Confirmed);
    }

    #[test]
    fn test_reject_without_selector_rejects_all() {
        let store = test_store();
        let now = Utc::now();
        store
            .propose("u1", vec![action("A.md"), action("B.md")], 5, now)
            .unwrap();
        let res = store.resolve("u1", Decision::Reject, None, now).unwrap();
        assert_eq!(res.resolved.len(), 2);
        assert_eq!(res.batch.status, BatchStatus::Rejected);
        assert!(store.pending("u1", now).unwrap().is_none());
    }

    #[test]
    fn test_resolve_after_timeout_fails_and_leaves_batch() {
        let store = test_store();
        let t = Utc::now();
        let batch = store.propose("u1", vec![action("Old.md")], 5, t).unwrap();

        let late = t + Duration::minutes(6);
        for _ in 0..2 {
            let err = store.resolve("u1", Decision::ConfirmAll, None, late).unwrap_err();
            assert!(matches!(err, AgentError::BatchExpiredError { .. }));
        }
        assert!(store.pending("u1", late).unwrap().is_none());

        let expired = store.expire("u1", late).unwrap().unwrap();
        assert_eq!(expired.id, batch.id);
        assert_eq!(expired.status, BatchStatus::Expired);
        assert_eq!(expired.actions[0].status, ActionStatus::Pending);

        let err = store.resolve("u1", Decision::ConfirmAll, None, late).unwrap_err();
        assert!(matches!(err, AgentError::NoBatchError { .. }));
    }

    #[test]
    fn test_sweep_only_touches_lapsed() {
        let store = test_store();
        let t = Utc::now();
        store.propose("old", vec![action("A.md")], 5, t).unwrap();
        store
            .propose("new", vec![action("B.md")], 5, t + Duration::minutes(4))
            .unwrap();

        let swept = store.sweep(t + Duration::minutes(5)).unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].identity, "old");
        assert!(store.pending("new", t + Duration::minutes(5)).unwrap().is_some());
    }

    #[test]
    fn test_rebase_moves_only_pending_actions_on_target() {
        let store = test_store();
        let now = Utc::now();
        store
            .propose("u1", vec![action("A.md"), action("A.md"), action("B.md")], 5, now)
            .unwrap();
        store.resolve("u1", Decision::Confirm, Some("1"), now).unwrap();

        assert_eq!(store.rebase("u1", "A.md", Some("abc")).unwrap(), 1);
        let batch = store.pending("u1", now).unwrap().unwrap();
        assert_eq!(batch.actions[0].base_hash, None);
        assert_eq!(batch.actions[1].base_hash.as_deref(), Some("abc"));
        assert_eq!(batch.actions[2].base_hash, None);

        assert_eq!(store.rebase("nobody", "A.md", None).unwrap(), 0);
    }

    #[test]
    fn test_discard() {
        let store = test_store();
        let now = Utc::now();
        store.propose("u1", vec![action("A.md")], 5, now).unwrap();
        assert!(store.discard("u1").unwrap().is_some());
        assert!(store.discard("u1").unwrap().is_none());
    }
}
