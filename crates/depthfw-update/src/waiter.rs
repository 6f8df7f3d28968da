//! Bounded polling for hot-plug transitions

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use depthfw_core::ErrorKind;

use crate::error::UpdateError;
use crate::task::TaskContext;

/// Failure message for probe errors that carry no usable description
pub const UNKNOWN_WAIT_FAILURE: &str =
    "Unknown error during update.\nPlease reconnect the camera to exit recovery mode";

/// Poll `probe` until it yields a value or `deadline` elapses
///
/// The probe runs at least once. Between attempts the worker sleeps for the
/// task's poll interval. Returns:
/// - `Ok(Some(value))` as soon as the probe finds what it waits for
/// - `Ok(None)` on timeout; the task state is untouched so the caller picks
///   the failure message
/// - `Ok(None)` when the probe returns an error; that error is not retried,
///   it fails the task and runs `cleanup` before returning
/// - `Err(UpdateError::Cancelled)` once the task holder has gone away
pub async fn check_for<T, P, Fut, C>(
    ctx: &TaskContext,
    mut probe: P,
    cleanup: C,
    deadline: Duration,
) -> Result<Option<T>, UpdateError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, UpdateError>>,
    C: FnOnce(),
{
    let start = Instant::now();
    let mut attempts: u32 = 0;

    loop {
        ctx.ensure_active()?;
        attempts += 1;

        match probe().await {
            Ok(Some(found)) => {
                debug!(task = %ctx.id(), attempts, "Wait satisfied");
                return Ok(Some(found));
            }
            Ok(None) => {}
            Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
            Err(e) => {
                let kind = e.kind();
                let message = match kind {
                    ErrorKind::Unknown => UNKNOWN_WAIT_FAILURE.to_string(),
                    _ => e.to_string(),
                };
                ctx.fail_with(kind, message);
                cleanup();
                return Ok(None);
            }
        }

        let now = Instant::now();
        ctx.sleep(ctx.poll_interval()).await?;
        if now.duration_since(start) >= deadline {
            debug!(
                task = %ctx.id(),
                attempts,
                deadline_secs = deadline.as_secs_f32(),
                "Wait timed out"
            );
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskStatus, UpdateTask, Workflow};
    use async_trait::async_trait;
    use depthfw_core::DeviceError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Idle;

    #[async_trait]
    impl Workflow for Idle {
        fn process_name(&self) -> &str {
            "Idle"
        }

        async fn process_flow(&self, _ctx: &TaskContext) -> Result<(), UpdateError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_error_is_not_retried() {
        let task = UpdateTask::new(Idle);
        let ctx = task.claim_context();
        let calls = AtomicUsize::new(0);
        let cleanups = AtomicUsize::new(0);

        let found = check_for(
            &ctx,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<Option<()>, _>(UpdateError::from(DeviceError::protocol(
                        "query_devices",
                        "",
                        "Device busy",
                    )))
                }
            },
            || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!(found.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        let snapshot = task.snapshot();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some("query_devices():\nDevice busy")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_probe_error_uses_generic_message() {
        let task = UpdateTask::new(Idle);
        let ctx = task.claim_context();

        let found = check_for(
            &ctx,
            || async { Err::<Option<()>, _>(UpdateError::Unknown("opaque".into())) },
            || {},
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(found.is_none());
        assert_eq!(task.check_error().as_deref(), Some(UNKNOWN_WAIT_FAILURE));
        assert_eq!(task.snapshot().error_kind, Some(ErrorKind::Unknown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_fail_task() {
        let task = UpdateTask::new(Idle);
        let ctx = task.claim_context();
        let calls = AtomicUsize::new(0);
        let cleanups = AtomicUsize::new(0);
        let started = Instant::now();

        let found = check_for(
            &ctx,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<Option<()>, UpdateError>(None) }
            },
            || {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert!(found.is_none());
        let calls = calls.load(Ordering::SeqCst);
        assert!((600..=602).contains(&calls), "probe ran {} times", calls);
        assert!(started.elapsed() >= Duration::from_secs(60));
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(task.check_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_value_immediately() {
        let task = UpdateTask::new(Idle);
        let ctx = task.claim_context();
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let found = check_for(
            &ctx,
            || {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok::<_, UpdateError>(if attempt == 2 { Some("dfu") } else { None })
                }
            },
            || {},
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(found, Some("dfu"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_wait() {
        let task = UpdateTask::new(Idle);
        let ctx = task.claim_context();
        let calls = AtomicUsize::new(0);

        let waiter = check_for(
            &ctx,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<Option<()>, UpdateError>(None) }
            },
            || {},
            Duration::from_secs(60),
        );
        let dropper = async {
            tokio::time::sleep(Duration::from_millis(250)).await;
            drop(task);
        };

        let (result, ()) = tokio::join!(waiter, dropper);
        assert!(matches!(result, Err(UpdateError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
