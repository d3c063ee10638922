use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use agent_fleet::runtime::retry::RetryPolicy;
use agent_fleet::AppError;

fn fast(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

fn transient(err: &AppError) -> bool {
    err.is_retryable()
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_millis(500),
    };

    assert_eq!(policy.backoff(0), Duration::from_millis(100));
    assert_eq!(policy.backoff(1), Duration::from_millis(200));
    assert_eq!(policy.backoff(2), Duration::from_millis(400));
    assert_eq!(policy.backoff(3), Duration::from_millis(500));
    assert_eq!(policy.backoff(40), Duration::from_millis(500));
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = AtomicU32::new(0);

    let result = fast(4)
        .run("inspect", transient, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Runtime("connection reset".into()))
            } else {
                Ok("running")
            }
        })
        .await;

    assert_eq!(result.expect("eventually succeeds"), "running");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn permanent_failures_are_not_retried() {
    let calls = AtomicU32::new(0);

    let result: Result<(), AppError> = fast(4)
        .run("create", transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Validation("bad image".into()))
        })
        .await;

    assert!(matches!(result, Err(AppError::Validation(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn attempts_are_bounded() {
    let calls = AtomicU32::new(0);

    let result: Result<(), AppError> = fast(3)
        .run("stop", transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Runtime("daemon busy".into()))
        })
        .await;

    assert!(matches!(result, Err(AppError::Runtime(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn none_policy_tries_once() {
    let calls = AtomicU32::new(0);

    let _: Result<(), AppError> = RetryPolicy::none()
        .run("start", transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Runtime("down".into()))
        })
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
