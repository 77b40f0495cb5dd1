//! Task supervision.
//!
//! Long-running component loops are wrapped in a supervisor that
//! restarts them on unexpected faults with exponential backoff. A
//! component faulting three times inside a minute is treated as
//! unrecoverable and cancels the whole process.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::feed::Backoff;

const FAULT_WINDOW: Duration = Duration::from_secs(60);
const MAX_FAULTS_IN_WINDOW: usize = 3;

/// Spawns `factory`'s future under supervision. The future is
/// restarted after an error or panic; a clean `Ok` exit ends
/// supervision. Escalation cancels `root`.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    root: CancellationToken,
    mut factory: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = Backoff::default();
        let mut faults: VecDeque<Instant> = VecDeque::new();

        loop {
            // Run the component as its own task so panics surface as
            // join errors instead of unwinding through the supervisor.
            let mut run = tokio::spawn(factory());

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    run.abort();
                    let _ = run.await;
                    return;
                }
                joined = &mut run => joined,
            };

            if cancel.is_cancelled() {
                return;
            }

            match outcome {
                Ok(Ok(())) => {
                    info!(task = name, "task finished cleanly");
                    return;
                }
                Ok(Err(e)) => warn!(task = name, error = %e, "task faulted"),
                Err(e) if e.is_panic() => error!(task = name, "task panicked"),
                Err(_) => return, // aborted during shutdown
            }

            let now = Instant::now();
            faults.push_back(now);
            while let Some(front) = faults.front() {
                if now.duration_since(*front) > FAULT_WINDOW {
                    faults.pop_front();
                } else {
                    break;
                }
            }

            if faults.len() >= MAX_FAULTS_IN_WINDOW {
                error!(
                    task = name,
                    faults = faults.len(),
                    "fault limit reached, shutting the process down",
                );
                root.cancel();
                return;
            }

            let delay = backoff.next_delay();
            warn!(task = name, retry_in = ?delay, "restarting task");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    })
}
