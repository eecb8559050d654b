//! Windowed rate limiting, including fail-closed behavior.

mod common;

use std::sync::Arc;

use common::{ctx, harness, local_account, LOGIN_LIMIT};
use identity_service::services::error::ServiceError;
use identity_service::services::rate_limit::{FailingCounters, MemoryCounters};
use identity_service::services::{IdentityStore, WindowLimiter};

#[tokio::test]
async fn limiter_allows_up_to_the_threshold_then_denies() {
    let limiter = WindowLimiter::new(Arc::new(MemoryCounters::new()), "rl:test:", 3, 60);

    for i in 1..=3 {
        let decision = limiter.check("198.51.100.1:jane@example.com").await;
        assert!(decision.allowed, "call {i} should be allowed");
        assert_eq!(decision.remaining, 3 - i);
        assert_eq!(decision.retry_after_seconds, 0);
    }

    let denied = limiter.check("198.51.100.1:jane@example.com").await;
    assert!(!denied.allowed);
    assert!(denied.retry_after_seconds >= 1);
    assert!(denied.retry_after_seconds <= 60);
}

#[tokio::test]
async fn identifiers_have_independent_windows() {
    let limiter = WindowLimiter::new(Arc::new(MemoryCounters::new()), "rl:test:", 2, 60);

    limiter.check("198.51.100.1:jane@example.com").await;
    limiter.check("198.51.100.1:jane@example.com").await;
    assert!(!limiter.check("198.51.100.1:jane@example.com").await.allowed);

    // Different IP, same email: separate counter.
    assert!(limiter.check("203.0.113.9:jane@example.com").await.allowed);
}

#[tokio::test]
async fn unreachable_counter_store_denies() {
    let limiter = WindowLimiter::new(Arc::new(FailingCounters), "rl:test:", 100, 60);

    let decision = limiter.check("198.51.100.1:jane@example.com").await;
    assert!(!decision.allowed);
    assert_eq!(decision.retry_after_seconds, 60);
}

#[tokio::test]
async fn login_attempts_beyond_the_window_are_rejected_and_audited() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    // Burn the window with pre-lookup rejections against an unknown email;
    // the limiter keys on ip:email, so "jane" is untouched.
    for _ in 0..LOGIN_LIMIT {
        let err = h
            .login
            .login("ghost@example.com", "wrong", &ctx("198.51.100.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));
    }

    let err = h
        .login
        .login("ghost@example.com", "wrong", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    let ServiceError::RateLimited { retry_after } = err else {
        panic!("expected a rate-limited rejection, got {err}");
    };
    assert!(retry_after >= 1);

    let audited = h
        .store
        .audit
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.action_code == "login_rate_limited")
        .count();
    assert_eq!(audited, 1);

    // The same caller can still log in as a different identity.
    h.login
        .login(
            "jane@example.com",
            "correct horse battery",
            &ctx("198.51.100.1"),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn reset_requests_are_limited_per_caller() {
    let h = harness();
    h.store
        .insert_account(&local_account("jane@example.com", "correct horse battery"))
        .await
        .unwrap();

    for _ in 0..common::RESET_LIMIT {
        h.login
            .request_password_reset("jane@example.com", &ctx("198.51.100.1"))
            .await
            .unwrap();
    }

    let err = h
        .login
        .request_password_reset("jane@example.com", &ctx("198.51.100.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::RateLimited { .. }));
}
