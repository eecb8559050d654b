//! Login flow, progressive lockout, and timing-safety behavior.

mod common;

use common::{ctx, ctx_with_agent, harness, local_account, provider_account};
use identity_service::models::{AccountStatus, CredentialMode};
use identity_service::services::error::ServiceError;
use identity_service::services::IdentityStore;

#[tokio::test]
async fn unknown_email_and_wrong_password_are_indistinguishable() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    let unknown = h
        .login
        .login("nobody@example.com", "whatever", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    let wrong = h
        .login
        .login("jane@example.com", "not the password", &ctx("198.51.100.1"))
        .await
        .unwrap_err();

    assert!(matches!(unknown, ServiceError::InvalidCredentials));
    assert!(matches!(wrong, ServiceError::InvalidCredentials));
    assert_eq!(unknown.to_string(), wrong.to_string());
}

#[tokio::test]
async fn provider_mode_account_cannot_use_local_login() {
    let h = harness();
    h.store
        .insert_account(&provider_account("sso@example.com"))
        .await
        .unwrap();

    let err = h
        .login
        .login("sso@example.com", "anything", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidCredentials));
}

#[tokio::test]
async fn fifth_failure_locks_the_account_with_unlock_time() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    // Every failed verification stays generic, the lockout-crossing fifth
    // attempt included: the crossing itself must not confirm the account
    // exists.
    for i in 1..=5 {
        let err = h
            .login
            .login("jane@example.com", "wrong", &ctx("198.51.100.1"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ServiceError::InvalidCredentials),
            "attempt {i} should report the generic error"
        );
    }

    // The lock surfaces on the next attempt, correct password or not.
    let err = h
        .login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap_err();
    let ServiceError::AccountLocked { until } = err else {
        panic!("attempt against the locked account should report the lock, got {err}");
    };
    assert!(until > chrono::Utc::now());
}

#[tokio::test]
async fn suspended_account_stays_generic_even_while_locked() {
    let h = harness();
    let mut account = local_account("jane@example.com", "correct horse battery");
    account.status_code = AccountStatus::Suspended.as_str().to_string();
    account.locked_until = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    h.store.insert_account(&account).await.unwrap();

    // Suspension wins over the lockout: the informative lock message is
    // only for accounts that could otherwise authenticate.
    let err = h
        .login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidCredentials));
}

#[tokio::test]
async fn lockout_audit_event_fires_only_at_the_threshold() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    for _ in 0..5 {
        let _ = h
            .login
            .login("jane@example.com", "wrong", &ctx("198.51.100.1"))
            .await;
    }
    // Two more attempts against the locked account.
    for _ in 0..2 {
        let _ = h
            .login
            .login("jane@example.com", "wrong", &ctx("198.51.100.1"))
            .await;
    }

    let chain = h.store.audit.lock().unwrap();
    let locked_events = chain
        .iter()
        .filter(|e| e.action_code == "account_locked")
        .count();
    let failed_events = chain
        .iter()
        .filter(|e| e.action_code == "login_failed")
        .count();

    assert_eq!(locked_events, 1, "one lock event at the exact crossing");
    assert_eq!(failed_events, 7, "every failed attempt is audited");
}

#[tokio::test]
async fn successful_login_resets_the_failure_counter() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    for _ in 0..3 {
        let _ = h
            .login
            .login("jane@example.com", "wrong", &ctx("198.51.100.1"))
            .await;
    }

    let success = h
        .login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();
    assert_eq!(success.account.email, "jane@example.com");

    let stored = h
        .store
        .find_account_by_id(account.account_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.failed_attempts, 0);
    assert!(stored.locked_until.is_none());
    assert!(stored.last_login_utc.is_some());

    // Earlier failures no longer count toward the schedule: four more
    // failures do not lock.
    for _ in 0..4 {
        let err = h
            .login
            .login("jane@example.com", "wrong", &ctx("198.51.100.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));
    }
}

#[tokio::test]
async fn email_lookup_is_case_and_whitespace_insensitive() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    let success = h
        .login
        .login(
            "  Jane@Example.COM ",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();
    assert_eq!(success.account.email, "jane@example.com");
}

#[tokio::test]
async fn suspicious_login_from_new_origin_notifies_and_audits() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    // Establish history from a known origin.
    h.login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx_with_agent("198.51.100.1", "Firefox"),
        )
        .await
        .unwrap();

    // Same device, new origin.
    h.login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx_with_agent("203.0.113.77", "Firefox"),
        )
        .await
        .unwrap();

    let notifier = h.notifier.clone();
    let flagged = common::eventually(move || {
        notifier
            .sent
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.template == "suspicious_login")
    })
    .await;
    assert!(flagged, "expected a suspicious-login notification");

    let store = h.store.clone();
    let audited = common::eventually(move || {
        store
            .audit
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.action_code == "suspicious_login_flagged")
    })
    .await;
    assert!(audited, "expected a suspicious-login audit event");
}

#[tokio::test]
async fn first_login_is_not_flagged() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    h.login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();

    // Give any (incorrect) detached task a chance to run.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(h.notifier.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pending_account_activates_and_logs_in() {
    let h = harness();
    let mut account = local_account("new@example.com", "placeholder");
    account.password_hash = None;
    account.status_code = AccountStatus::PendingActivation.as_str().to_string();
    h.store.insert_account(&account).await.unwrap();

    // Pending accounts cannot log in.
    let err = h
        .login
        .login("new@example.com", "anything", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidCredentials));

    let (record, raw) = identity_service::models::SingleUseToken::issue(
        account.account_id,
        identity_service::models::TokenPurpose::Activation,
        "198.51.100.1".to_string(),
        72,
    );
    h.store.insert_token(&record).await.unwrap();

    let activated = h
        .login
        .activate_account(&raw, "a brand new passphrase", &ctx("198.51.100.1"))
        .await
        .unwrap();
    assert_eq!(activated.status, AccountStatus::Active.as_str());
    assert_eq!(
        activated.credential_mode,
        CredentialMode::Local.as_str()
    );

    h.login
        .login(
            "new@example.com",
            "a brand new passphrase",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();

    // The token is single-use.
    let err = h
        .login
        .activate_account(&raw, "another passphrase!!", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::TokenAlreadyUsed));
}

#[tokio::test]
async fn password_reset_round_trip_revokes_sessions() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let success = h
        .login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();

    h.login
        .request_password_reset("jane@example.com", &ctx("198.51.100.1"))
        .await
        .unwrap();

    let raw = {
        let sent = h.notifier.sent.lock().unwrap();
        let reset = sent
            .iter()
            .find(|n| n.template == "password_reset")
            .expect("reset notification");
        reset.params["token"].as_str().unwrap().to_string()
    };

    h.login
        .confirm_password_reset(&raw, "an entirely new secret", &ctx("198.51.100.1"))
        .await
        .unwrap();

    // Old password dead, new one works.
    let err = h
        .login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidCredentials));
    h.login
        .login(
            "jane@example.com",
            "an entirely new secret",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();

    // The pre-reset session is gone.
    let verdict = h.sessions.validate(&success.token).await.unwrap();
    assert!(matches!(
        verdict,
        identity_service::services::SessionVerdict::Rejected(
            identity_service::services::session::SessionRejection::SessionRevoked
        )
    ));
}

#[tokio::test]
async fn reset_request_for_unknown_email_is_silent() {
    let h = harness();
    h.login
        .request_password_reset("ghost@example.com", &ctx("198.51.100.1"))
        .await
        .unwrap();
    assert!(h
        .notifier
        .sent
        .lock()
        .unwrap()
        .iter()
        .all(|n| n.template != "password_reset"));
}

#[tokio::test]
async fn superseded_reset_token_is_invalid() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    h.login
        .request_password_reset("jane@example.com", &ctx("198.51.100.1"))
        .await
        .unwrap();
    let first = {
        let sent = h.notifier.sent.lock().unwrap();
        sent.last().unwrap().params["token"].as_str().unwrap().to_string()
    };

    h.login
        .request_password_reset("jane@example.com", &ctx("198.51.100.1"))
        .await
        .unwrap();

    let err = h
        .login
        .confirm_password_reset(&first, "an entirely new secret", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::TokenExpired));
}
