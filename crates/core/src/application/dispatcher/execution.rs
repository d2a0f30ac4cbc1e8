// Guarded handler execution: timeout, panic isolation, shutdown interruption
use crate::application::gate::GatePermit;
use crate::application::dispatcher::ShutdownToken;
use crate::domain::{JobId, JobPayload, Outcome};
use crate::port::JobHandler;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// How an invocation ended
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Execution {
    Finished(Outcome),
    /// Shutdown grace ran out before the handler returned
    Interrupted,
}

/// Run a handler in its own task
///
/// The permit (if any) moves into the task, so it is released when the task
/// ends, whether it returns, times out, panics or is aborted. A panic or a
/// timeout becomes a retryable failure; the dispatcher keeps running.
pub(crate) async fn run_guarded(
    handler: Arc<dyn JobHandler>,
    job_id: JobId,
    payload: JobPayload,
    timeout: Duration,
    permit: Option<GatePermit>,
    shutdown: ShutdownToken,
    grace: Duration,
) -> Execution {
    let mut task = tokio::spawn(async move {
        let _permit = permit;
        tokio::time::timeout(timeout, handler.execute(job_id, &payload)).await
    });

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = grace_expired(shutdown, grace) => {
            task.abort();
            return match task.await {
                // Finished while we were aborting
                Ok(Ok(outcome)) => Execution::Finished(outcome),
                _ => {
                    warn!(job_id = job_id, "Handler interrupted by shutdown");
                    Execution::Interrupted
                }
            };
        }
    };

    match joined {
        Ok(Ok(outcome)) => Execution::Finished(outcome),
        Ok(Err(_elapsed)) => {
            warn!(job_id = job_id, timeout_secs = timeout.as_secs(), "Handler timed out");
            Execution::Finished(Outcome::retryable(format!(
                "handler timed out after {}s",
                timeout.as_secs()
            )))
        }
        Err(join_err) if join_err.is_panic() => {
            let panic_msg = panic_message(join_err.into_panic());
            error!(job_id = job_id, panic_msg = %panic_msg, "Handler panicked");
            Execution::Finished(Outcome::retryable(format!("handler panicked: {panic_msg}")))
        }
        Err(join_err) => {
            error!(job_id = job_id, error = %join_err, "Handler task cancelled");
            Execution::Finished(Outcome::retryable("handler task cancelled"))
        }
    }
}

async fn grace_expired(mut shutdown: ShutdownToken, grace: Duration) {
    shutdown.wait().await;
    tokio::time::sleep(grace).await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
