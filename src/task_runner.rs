//! Supervised background tasks.
//!
//! Long-running loops (the trading loop, the monitoring server) restart on
//! failure with exponential backoff. A clean completion ends supervision;
//! too many consecutive quick failures stop the retries and surface an
//! error so the caller can decide whether the process should live without
//! the task. An iteration that stayed up past `stable_after` before failing
//! resets the failure budget, so a crash every few hours never exhausts it.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{error, warn};

/// Restart policy for a supervised task.
#[derive(Debug, Clone)]
pub struct TaskPolicy {
    /// Give up after this many consecutive failures.
    pub max_consecutive_failures: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// An iteration that runs at least this long counts as stable and
    /// resets the failure budget.
    pub stable_after: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
            stable_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Task '{task}' gave up after {failures} consecutive failures: {last_error}")]
pub struct TaskGaveUp {
    pub task: String,
    pub failures: u32,
    pub last_error: String,
}

/// Run `task_fn` in a restart loop. Returns `Ok(())` as soon as an
/// iteration completes cleanly; each failure doubles the retry delay up to
/// the cap, and exhausting the failure budget returns the give-up error.
pub async fn run_supervised<F, Fut>(
    task_name: &str,
    policy: TaskPolicy,
    mut task_fn: F,
) -> Result<(), TaskGaveUp>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut failures = 0u32;
    let mut delay = policy.initial_retry_delay;

    loop {
        let started = Instant::now();
        match task_fn().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                if failures > 0 && started.elapsed() >= policy.stable_after {
                    warn!(
                        task = task_name,
                        "task ran stable before failing, resetting failure budget"
                    );
                    failures = 0;
                    delay = policy.initial_retry_delay;
                }

                failures += 1;
                error!(
                    task = task_name,
                    attempt = failures,
                    max = policy.max_consecutive_failures,
                    error = %e,
                    "supervised task failed"
                );

                if failures >= policy.max_consecutive_failures {
                    return Err(TaskGaveUp {
                        task: task_name.to_string(),
                        failures,
                        last_error: e,
                    });
                }

                warn!(task = task_name, retry_in = ?delay, "retrying after backoff");
                sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_retry_delay);
            }
        }
    }
}
