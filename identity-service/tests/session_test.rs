//! Session issuance and two-phase validation.

mod common;

use chrono::{Duration, Utc};
use common::{ctx, harness, local_account};
use identity_service::models::Session;
use identity_service::services::jwt::token_hash;
use identity_service::services::IdentityStore;
use identity_service::services::session::SessionRejection;
use identity_service::services::SessionVerdict;
use uuid::Uuid;

#[tokio::test]
async fn issued_token_validates() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (session, token) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();

    let verdict = h.sessions.validate(&token).await.unwrap();
    let SessionVerdict::Valid(validated) = verdict else {
        panic!("expected a valid session");
    };
    assert_eq!(validated.account_id, account.account_id);
    assert_eq!(validated.session_id, session.session_id);
    assert_eq!(validated.role, "member");
    assert!(validated.expires_utc > Utc::now());
}

#[tokio::test]
async fn only_a_hash_of_the_token_is_persisted() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (session, token) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();

    assert_ne!(session.token_hash, token);
    assert_eq!(session.token_hash, token_hash(&token));
    assert_eq!(session.token_hash.len(), 64);
}

#[tokio::test]
async fn revocation_takes_effect_immediately() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (session, token) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();
    assert!(h.sessions.revoke(session.session_id).await.unwrap());

    let verdict = h.sessions.validate(&token).await.unwrap();
    assert!(matches!(
        verdict,
        SessionVerdict::Rejected(SessionRejection::SessionRevoked)
    ));

    // Revoking again is a no-op.
    assert!(!h.sessions.revoke(session.session_id).await.unwrap());
}

#[tokio::test]
async fn expired_session_record_is_rejected() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    // A well-signed token whose durable record has already lapsed.
    let session_id = Uuid::new_v4();
    let (token, _) = h
        .jwt
        .issue_session_token(account.account_id, "member", session_id)
        .unwrap();
    let session = Session {
        session_id,
        account_id: account.account_id,
        token_hash: token_hash(&token),
        ip_address: "198.51.100.1".to_string(),
        user_agent: None,
        client_app: "compliance-app".to_string(),
        created_utc: Utc::now() - Duration::hours(9),
        expires_utc: Utc::now() - Duration::hours(1),
        revoked_utc: None,
    };
    h.store.insert_session(&session).await.unwrap();

    let verdict = h.sessions.validate(&token).await.unwrap();
    assert!(matches!(
        verdict,
        SessionVerdict::Rejected(SessionRejection::SessionExpired)
    ));
}

#[tokio::test]
async fn token_without_a_session_record_is_rejected() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (token, _) = h
        .jwt
        .issue_session_token(account.account_id, "member", Uuid::new_v4())
        .unwrap();

    let verdict = h.sessions.validate(&token).await.unwrap();
    assert!(matches!(
        verdict,
        SessionVerdict::Rejected(SessionRejection::SessionNotFound)
    ));
}

#[tokio::test]
async fn tampered_token_is_rejected() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (_, token) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();

    // Flip a character in the signature segment.
    let mut tampered = token.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });

    let verdict = h.sessions.validate(&tampered).await.unwrap();
    assert!(matches!(
        verdict,
        SessionVerdict::Rejected(SessionRejection::InvalidToken)
    ));

    assert!(matches!(
        h.sessions.validate("not even a jwt").await.unwrap(),
        SessionVerdict::Rejected(SessionRejection::InvalidToken)
    ));
}

#[tokio::test]
async fn second_token_for_the_same_session_fails_the_hash_check() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let (session, _original) = h.sessions.issue(&account, &ctx("198.51.100.1")).await.unwrap();

    // A fresh, validly-signed token reusing the sid does not match the
    // persisted hash.
    let (forged, _) = h
        .jwt
        .issue_session_token(account.account_id, "admin", session.session_id)
        .unwrap();

    let verdict = h.sessions.validate(&forged).await.unwrap();
    assert!(matches!(
        verdict,
        SessionVerdict::Rejected(SessionRejection::InvalidToken)
    ));
}

#[tokio::test]
async fn logout_revokes_and_is_idempotent() {
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

    h.login.logout(&success.token, &ctx("198.51.100.1")).await.unwrap();
    assert!(matches!(
        h.sessions.validate(&success.token).await.unwrap(),
        SessionVerdict::Rejected(SessionRejection::SessionRevoked)
    ));

    // A second logout with the now-dead token still succeeds.
    h.login.logout(&success.token, &ctx("198.51.100.1")).await.unwrap();

    let revoked_events = h
        .store
        .audit
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action_code == "session_revoked")
        .count();
    assert_eq!(revoked_events, 1);
}

#[tokio::test]
async fn purge_deletes_only_long_expired_sessions() {
    let h = harness();
    let account = local_account("jane@example.com", "correct horse battery");
    h.store.insert_account(&account).await.unwrap();

    let make_session = |expires_utc| Session {
        session_id: Uuid::new_v4(),
        account_id: account.account_id,
        token_hash: "0".repeat(64),
        ip_address: "198.51.100.1".to_string(),
        user_agent: None,
        client_app: "compliance-app".to_string(),
        created_utc: Utc::now() - Duration::days(30),
        expires_utc,
        revoked_utc: None,
    };

    h.store
        .insert_session(&make_session(Utc::now() - Duration::days(20)))
        .await
        .unwrap();
    h.store
        .insert_session(&make_session(Utc::now() - Duration::hours(2)))
        .await
        .unwrap();
    h.store
        .insert_session(&make_session(Utc::now() + Duration::hours(2)))
        .await
        .unwrap();

    let purged = h.sessions.purge_expired(72).await.unwrap();
    assert_eq!(purged, 1);
}
