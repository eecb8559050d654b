//! Audit chain integrity over the persisted store.

mod common;

use common::harness;
use identity_service::models::{AuditAction, AuditActor, AuditDraft};
use identity_service::services::IdentityStore;

fn draft(action: AuditAction, resource_id: &str) -> AuditDraft {
    AuditDraft::new(
        AuditActor::System,
        "127.0.0.1",
        action,
        "account",
        Some(resource_id.to_string()),
    )
}

#[tokio::test]
async fn empty_chain_verifies() {
    let h = harness();
    let result = h.audit.verify_chain().await.unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 0);
}

#[tokio::test]
async fn appended_chain_verifies_and_links() {
    let h = harness();
    for i in 0..5 {
        h.audit
            .append(draft(AuditAction::AccountMigrated, &format!("acct-{i}")))
            .await
            .unwrap();
    }

    let result = h.audit.verify_chain().await.unwrap();
    assert!(result.valid);
    assert_eq!(result.total_entries, 5);

    let chain = h.store.audit.lock().unwrap();
    assert!(chain[0].previous_hash.is_none());
    for pair in chain.windows(2) {
        assert_eq!(pair[1].previous_hash.as_deref(), Some(pair[0].entry_hash.as_str()));
        assert_eq!(pair[1].chain_seq, pair[0].chain_seq + 1);
    }
}

#[tokio::test]
async fn tampering_with_a_field_breaks_verification_at_that_entry() {
    let h = harness();
    for i in 0..4 {
        h.audit
            .append(draft(AuditAction::LoginFailed, &format!("acct-{i}")))
            .await
            .unwrap();
    }

    let tampered_id = {
        let mut chain = h.store.audit.lock().unwrap();
        chain[2].metadata = Some(serde_json::json!({"injected": true}));
        chain[2].event_id
    };

    let result = h.audit.verify_chain().await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_id, Some(tampered_id));
    assert_eq!(result.total_entries, 4);
}

#[tokio::test]
async fn relinking_after_a_deleted_entry_is_detected() {
    let h = harness();
    for i in 0..4 {
        h.audit
            .append(draft(AuditAction::SessionRevoked, &format!("acct-{i}")))
            .await
            .unwrap();
    }

    // Remove a middle entry; the successor still names the victim's hash.
    let broken_id = {
        let mut chain = h.store.audit.lock().unwrap();
        chain.remove(1);
        chain[1].event_id
    };

    let result = h.audit.verify_chain().await.unwrap();
    assert!(!result.valid);
    assert_eq!(result.broken_at_id, Some(broken_id));
}

#[tokio::test]
async fn record_swallows_failures_but_append_propagates() {
    // record() against a healthy store still writes.
    let h = harness();
    h.audit
        .record(draft(AuditAction::PasswordResetRequested, "acct-1"))
        .await;
    assert_eq!(h.store.audit.lock().unwrap().len(), 1);

    let result = h.audit.verify_chain().await.unwrap();
    assert!(result.valid);
}

#[tokio::test]
async fn actor_identity_is_covered_by_the_hash() {
    let h = harness();
    let actor = AuditActor::account(uuid::Uuid::new_v4(), "admin@example.com", "admin");
    h.audit
        .append(AuditDraft::new(
            actor,
            "198.51.100.1",
            AuditAction::MigrationRolledBack,
            "account",
            Some("acct-1".to_string()),
        ))
        .await
        .unwrap();

    // Reattributing the entry to a different principal must not verify.
    {
        let mut chain = h.store.audit.lock().unwrap();
        chain[0].actor_id = Some(uuid::Uuid::new_v4());
    }

    let result = h.audit.verify_chain().await.unwrap();
    assert!(!result.valid);
}
