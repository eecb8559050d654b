//! Provider migration orchestration, cohort rollout, and rollback.

mod common;

use chrono::{Duration, Utc};
use common::{ctx, harness, harness_with, local_account, provider_user};
use identity_service::models::{
    AccountStatus, AuditActor, CredentialMode, MigrationCohort,
};
use identity_service::services::error::ServiceError;
use identity_service::services::{IdentityStore, MapOptions, MapOutcome};
use uuid::Uuid;

fn admin_options(mode: CredentialMode) -> MapOptions {
    MapOptions {
        set_auth_mode: mode,
        force_password_change: false,
        actor: AuditActor::account(Uuid::new_v4(), "admin@example.com", "admin"),
        actor_ip: "10.0.0.5".to_string(),
        notes: Some("initial rollout".to_string()),
    }
}

fn cohort(tag: &str, position: i32, members: Option<&[&str]>) -> MigrationCohort {
    MigrationCohort {
        cohort_tag: tag.to_string(),
        position,
        member_emails: members.map(|m| m.iter().map(|s| s.to_string()).collect()),
        completed_utc: None,
    }
}

#[tokio::test]
async fn mapping_creates_a_pending_account_and_sends_activation() {
    let h = harness();
    let user = provider_user("prov-1", "Alice@Example.com");

    let outcome = h
        .migration
        .map_account(&user, &admin_options(CredentialMode::Local))
        .await
        .unwrap();
    assert!(matches!(outcome, MapOutcome::Created { .. }));

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .expect("mapped account");
    assert_eq!(account.email, "alice@example.com");
    assert_eq!(
        account.status_code,
        AccountStatus::PendingActivation.as_str()
    );
    assert_eq!(account.credential_mode_code, CredentialMode::Local.as_str());
    assert!(account.password_hash.is_none());
    assert!(account.is_migrated());
    assert_eq!(account.first_name.as_deref(), Some("Test"));

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "account_activation");
    assert_eq!(sent[0].recipient, "alice@example.com");

    let migrated_events = h
        .store
        .audit
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action_code == "account_migrated")
        .count();
    assert_eq!(migrated_events, 1);
}

#[tokio::test]
async fn provider_mode_mapping_is_immediately_active() {
    let h = harness();
    let user = provider_user("prov-1", "alice@example.com");

    h.migration
        .map_account(&user, &admin_options(CredentialMode::Provider))
        .await
        .unwrap();

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.status_code, AccountStatus::Active.as_str());

    // No activation flow for provider-backed accounts.
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rerunning_a_mapping_updates_instead_of_duplicating() {
    let h = harness();
    let user = provider_user("prov-1", "alice@example.com");
    let options = admin_options(CredentialMode::Local);

    let first = h.migration.map_account(&user, &options).await.unwrap();
    assert!(matches!(first, MapOutcome::Created { .. }));

    let second = h.migration.map_account(&user, &options).await.unwrap();
    assert!(matches!(second, MapOutcome::Updated { .. }));

    // The second run refreshes provenance on the same account.
    let mut rerun = admin_options(CredentialMode::Local);
    rerun.notes = Some("second pass".to_string());
    let third = h.migration.map_account(&user, &rerun).await.unwrap();
    assert!(matches!(third, MapOutcome::Updated { .. }));

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.migration_notes.as_deref(), Some("second pass"));
}

#[tokio::test]
async fn remapping_an_activated_account_keeps_its_credentials() {
    let h = harness();
    let mut account = local_account("alice@example.com", "her chosen password");
    account.migrated_utc = Some(Utc::now() - Duration::hours(2));
    account.migrated_by = Some("admin".to_string());
    h.store.insert_account(&account).await.unwrap();

    let outcome = h
        .migration
        .map_account(
            &provider_user("prov-1", "alice@example.com"),
            &admin_options(CredentialMode::Local),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, MapOutcome::Updated { .. }));

    let stored = h
        .store
        .find_account_by_id(account.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status_code, AccountStatus::Active.as_str());
    assert!(stored.password_hash.is_some());

    // No activation flow: the account already holds working credentials.
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn forced_password_change_parks_a_provider_account_pending() {
    let h = harness();
    let mut options = admin_options(CredentialMode::Provider);
    options.force_password_change = true;

    h.migration
        .map_account(&provider_user("prov-1", "alice@example.com"), &options)
        .await
        .unwrap();

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        account.status_code,
        AccountStatus::PendingActivation.as_str()
    );

    let sent = h.notifier.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].template, "account_activation");
}

#[tokio::test]
async fn native_local_accounts_are_never_overwritten() {
    let h = harness();
    h.store
        .insert_account(&local_account("alice@example.com", "her own password"))
        .await
        .unwrap();

    let outcome = h
        .migration
        .map_account(
            &provider_user("prov-1", "alice@example.com"),
            &admin_options(CredentialMode::Local),
        )
        .await
        .unwrap();

    let MapOutcome::Skipped { reason, .. } = outcome else {
        panic!("expected a skip, got {outcome:?}");
    };
    assert_eq!(reason, "native_local_account");

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(account.password_hash.is_some());
    assert!(!account.is_migrated());
}

#[tokio::test]
async fn batch_isolates_per_item_failures() {
    let h = harness();
    let users = vec![
        provider_user("prov-1", "alice@example.com"),
        provider_user("prov-2", ""),
        provider_user("prov-3", "carol@example.com"),
    ];

    let report = h
        .migration
        .batch_map(&users, &admin_options(CredentialMode::Local))
        .await
        .unwrap();

    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.processed(), 3);

    let batch_events = h
        .store
        .audit
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action_code == "migration_batch_completed")
        .count();
    assert_eq!(batch_events, 1);
}

#[tokio::test]
async fn migrate_all_walks_every_provider_page() {
    // Five users against a page size of two exercises pagination.
    let users: Vec<_> = (1..=5)
        .map(|i| provider_user(&format!("prov-{i}"), &format!("user{i}@example.com")))
        .collect();
    let h = harness_with(users, Vec::new());

    let report = h
        .migration
        .migrate_all(&admin_options(CredentialMode::Local))
        .await
        .unwrap();
    assert_eq!(report.created, 5);
    assert!(report.errors.is_empty());
}

#[tokio::test]
async fn cohorts_advance_in_order_and_complete() {
    let users = vec![
        provider_user("prov-1", "a@example.com"),
        provider_user("prov-2", "b@example.com"),
        provider_user("prov-3", "c@example.com"),
    ];
    let cohorts = vec![
        cohort("pilot", 1, Some(&["a@example.com", "b@example.com"])),
        cohort("everyone", 2, None),
    ];
    let h = harness_with(users, cohorts);
    let options = admin_options(CredentialMode::Local);

    // First step maps the pilot members (batch_size 3 covers both).
    let step = h.migration.advance_cohort(&options).await.unwrap();
    assert_eq!(step.cohort_tag, "pilot");
    assert!(!step.cohort_completed);
    assert_eq!(step.report.created, 2);

    // No pilot members remain, so the next step closes the cohort.
    let step = h.migration.advance_cohort(&options).await.unwrap();
    assert_eq!(step.cohort_tag, "pilot");
    assert!(step.cohort_completed);
    assert_eq!(step.report.processed(), 0);

    // The catch-all cohort absorbs whoever is left.
    let step = h.migration.advance_cohort(&options).await.unwrap();
    assert_eq!(step.cohort_tag, "everyone");
    assert_eq!(step.report.created, 1);

    let step = h.migration.advance_cohort(&options).await.unwrap();
    assert!(step.cohort_completed);

    // Every cohort done: advancing again is an error.
    let err = h.migration.advance_cohort(&options).await.unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn native_local_members_do_not_hold_a_cohort_open() {
    let users = vec![provider_user("prov-1", "alice@example.com")];
    let cohorts = vec![cohort("pilot", 1, Some(&["alice@example.com"]))];
    let h = harness_with(users, cohorts);

    h.store
        .insert_account(&local_account("alice@example.com", "her own password"))
        .await
        .unwrap();

    let step = h
        .migration
        .advance_cohort(&admin_options(CredentialMode::Local))
        .await
        .unwrap();
    assert!(step.cohort_completed);
}

#[tokio::test]
async fn rollback_reverts_the_account_and_revokes_sessions() {
    let h = harness();
    h.migration
        .map_account(
            &provider_user("prov-1", "alice@example.com"),
            &admin_options(CredentialMode::Local),
        )
        .await
        .unwrap();

    let account = h
        .store
        .find_account_by_email("alice@example.com")
        .await
        .unwrap()
        .unwrap();

    // An open session for the migrated account.
    let (_, token) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();

    let actor = AuditActor::account(Uuid::new_v4(), "admin@example.com", "admin");
    let restored = h
        .rollback
        .rollback_one(account.account_id, &actor, "10.0.0.5", "provider outage over")
        .await
        .unwrap();

    assert_eq!(restored.credential_mode, CredentialMode::Provider.as_str());
    assert_eq!(restored.status, AccountStatus::Active.as_str());

    let stored = h
        .store
        .find_account_by_id(account.account_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.password_hash.is_none());
    assert!(stored.migrated_utc.is_none());
    assert!(stored.migrated_by.is_none());

    assert!(matches!(
        h.sessions.validate(&token).await.unwrap(),
        identity_service::services::SessionVerdict::Rejected(_)
    ));

    let rolled_back_events = h
        .store
        .audit
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action_code == "migration_rolled_back")
        .count();
    assert_eq!(rolled_back_events, 1);
}

#[tokio::test]
async fn rolling_back_an_unmigrated_account_is_rejected() {
    let h = harness();
    let account = local_account("alice@example.com", "her own password");
    h.store.insert_account(&account).await.unwrap();

    let actor = AuditActor::account(Uuid::new_v4(), "admin@example.com", "admin");
    let err = h
        .rollback
        .rollback_one(account.account_id, &actor, "10.0.0.5", "mistake")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotMigrated));
}

#[tokio::test]
async fn windowed_rollback_covers_only_the_window() {
    let h = harness();
    let options = admin_options(CredentialMode::Local);
    for (id, email) in [("prov-1", "a@example.com"), ("prov-2", "b@example.com")] {
        h.migration
            .map_account(&provider_user(id, email), &options)
            .await
            .unwrap();
    }

    let actor = AuditActor::account(Uuid::new_v4(), "admin@example.com", "admin");

    // A window entirely in the past matches nothing.
    let report = h
        .rollback
        .rollback_window(
            Utc::now() - Duration::hours(48),
            Utc::now() - Duration::hours(24),
            &actor,
            "10.0.0.5",
            "bad batch",
        )
        .await
        .unwrap();
    assert_eq!(report.rolled_back, 0);

    let report = h
        .rollback
        .rollback_window(
            Utc::now() - Duration::hours(1),
            Utc::now() + Duration::minutes(1),
            &actor,
            "10.0.0.5",
            "bad batch",
        )
        .await
        .unwrap();
    assert_eq!(report.rolled_back, 2);
    assert!(report.errors.is_empty());

    // Inverted bounds are rejected outright.
    let err = h
        .rollback
        .rollback_window(Utc::now(), Utc::now() - Duration::hours(1), &actor, "10.0.0.5", "x")
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn recently_migrated_listing_reports_elapsed_time() {
    let h = harness();
    h.migration
        .map_account(
            &provider_user("prov-1", "alice@example.com"),
            &admin_options(CredentialMode::Local),
        )
        .await
        .unwrap();

    let recent = h.rollback.list_recently_migrated(24).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].account.email, "alice@example.com");
    assert_eq!(recent[0].elapsed_hours, 0);
    assert!(recent[0].migrated_by.is_some());

    assert!(h.rollback.list_recently_migrated(0).await.unwrap().is_empty());
}
