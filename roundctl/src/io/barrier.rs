//! Completion barrier: block until the submitted job reports a terminal status.
//!
//! There is no push notification from the job, so the barrier polls two
//! signals: the State File content and the scheduler's view of the queue.
//! Time is read and spent through a [`Clock`] so tests can run the loop
//! without real delays.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::request::JobHandle;
use crate::io::config::BarrierConfig;
use crate::io::scheduler::{QueueState, Scheduler};
use crate::io::state_file::{StateFile, StateValue};

/// Source of time for polling loops.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Shared flag that aborts a waiting barrier at its next poll.
///
/// A hook for embedding callers. The `roundctl` binary never cancels it:
/// `SIGINT` and `SIGTERM` keep their default effect and end the process, and
/// `barrier.timeout_secs` is the way to bound a wait from the command line.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BarrierOptions {
    pub poll_interval: Duration,
    /// `None` waits without limit.
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

impl BarrierOptions {
    pub fn from_config(config: &BarrierConfig, cancel: CancelToken) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
            cancel,
        }
    }
}

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("state file holds a non-integer job status: {content:?}")]
    Unparsable { content: String },
    #[error("job {job} left the queue without writing a terminal status")]
    JobVanished { job: JobHandle },
    #[error("gave up waiting for job {job} after {waited:?}")]
    TimedOut { job: JobHandle, waited: Duration },
    #[error("wait for job {job} was cancelled")]
    Cancelled { job: JobHandle },
    #[error("state file: {0:#}")]
    Io(anyhow::Error),
}

/// Wait until `job` writes a terminal value into `state_file`, or leaves the queue.
///
/// Returns the job's exit status. Never returns a status while the file still
/// holds the pending sentinel. The State File is left in place for the caller.
#[instrument(skip_all, fields(job = %job, poll_secs = options.poll_interval.as_secs()))]
pub fn await_completion<S: Scheduler, C: Clock>(
    scheduler: &S,
    clock: &C,
    job: &JobHandle,
    state_file: &StateFile,
    options: &BarrierOptions,
) -> Result<i64, BarrierError> {
    let started = clock.now();
    let mut polls = 0u64;

    loop {
        if options.cancel.is_cancelled() {
            warn!("completion wait cancelled");
            return Err(BarrierError::Cancelled { job: job.clone() });
        }

        polls += 1;
        if let Some(status) = terminal_status(state_file)? {
            info!(status, polls, "job reported terminal status");
            return Ok(status);
        }

        match scheduler.query(job) {
            Ok(QueueState::Gone) => {
                debug!(polls, "job left the queue, reading state file once more");
                return match terminal_status(state_file)? {
                    Some(status) => {
                        info!(status, polls, "job reported terminal status");
                        Ok(status)
                    }
                    None => Err(BarrierError::JobVanished { job: job.clone() }),
                };
            }
            Ok(QueueState::Active(state)) => debug!(state = %state, polls, "job still active"),
            // The state file stays authoritative; a flaky query only delays resolution.
            Err(err) => warn!(err = %format!("{err:#}"), "queue query failed, still waiting"),
        }

        let waited = clock.now().saturating_duration_since(started);
        if let Some(timeout) = options.timeout
            && waited >= timeout
        {
            warn!(waited_secs = waited.as_secs(), "completion wait timed out");
            return Err(BarrierError::TimedOut {
                job: job.clone(),
                waited,
            });
        }

        clock.sleep(options.poll_interval);
    }
}

fn terminal_status(state_file: &StateFile) -> Result<Option<i64>, BarrierError> {
    match state_file.read().map_err(BarrierError::Io)? {
        StateValue::Pending => Ok(None),
        StateValue::Terminal(status) => Ok(Some(status)),
        StateValue::Malformed(content) => Err(BarrierError::Unparsable { content }),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::request::extract_job_id;
    use crate::test_support::{ManualClock, ScriptedJob, ScriptedScheduler};

    fn options() -> BarrierOptions {
        BarrierOptions {
            poll_interval: Duration::from_secs(30),
            timeout: None,
            cancel: CancelToken::new(),
        }
    }

    fn job() -> JobHandle {
        extract_job_id("Submitted batch job 55").expect("id")
    }

    fn pending_state(dir: &std::path::Path) -> StateFile {
        let state = StateFile::new(dir.join("admd.state"));
        state.mark_pending().expect("mark");
        state
    }

    #[test]
    fn returns_status_once_state_file_changes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        let scheduler = ScriptedScheduler::new("55").with_job(ScriptedJob {
            state_file: state.path().to_path_buf(),
            polls_before_write: 3,
            writes: Some("0".to_string()),
            leaves_queue: false,
        });
        let clock = ManualClock::new();

        let status =
            await_completion(&scheduler, &clock, &job(), &state, &options()).expect("await");

        assert_eq!(status, 0);
        // Three polls saw the sentinel and slept; the fourth query wrote the status.
        assert_eq!(clock.sleeps(), 4);
        assert_eq!(clock.elapsed(), Duration::from_secs(120));
        assert!(state.path().exists(), "barrier must not delete the state file");
    }

    #[test]
    fn does_not_return_while_sentinel_remains() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        let scheduler = ScriptedScheduler::new("55").with_job(ScriptedJob {
            state_file: state.path().to_path_buf(),
            polls_before_write: usize::MAX,
            writes: None,
            leaves_queue: false,
        });
        let clock = ManualClock::new();
        let opts = BarrierOptions {
            timeout: Some(Duration::from_secs(600)),
            ..options()
        };

        let err = await_completion(&scheduler, &clock, &job(), &state, &opts).unwrap_err();

        assert!(matches!(err, BarrierError::TimedOut { .. }));
        assert!(scheduler.queries() >= 20);
        assert_eq!(fs::read_to_string(state.path()).expect("read"), "PEND\n");
    }

    #[test]
    fn job_leaving_queue_after_writing_resolves() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        let scheduler = ScriptedScheduler::new("55").with_job(ScriptedJob {
            state_file: state.path().to_path_buf(),
            polls_before_write: 1,
            writes: Some("137".to_string()),
            leaves_queue: true,
        });

        let status = await_completion(&scheduler, &ManualClock::new(), &job(), &state, &options())
            .expect("await");
        assert_eq!(status, 137);
        assert_eq!(scheduler.queries(), 2);
    }

    #[test]
    fn job_leaving_queue_without_status_is_vanished() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        let scheduler = ScriptedScheduler::new("55").with_job(ScriptedJob {
            state_file: state.path().to_path_buf(),
            polls_before_write: 0,
            writes: None,
            leaves_queue: true,
        });

        let err = await_completion(&scheduler, &ManualClock::new(), &job(), &state, &options())
            .unwrap_err();
        assert!(matches!(err, BarrierError::JobVanished { .. }));
    }

    #[test]
    fn garbage_status_is_unparsable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        fs::write(state.path(), "segfault\n").expect("write");
        let scheduler = ScriptedScheduler::new("55");

        let err = await_completion(&scheduler, &ManualClock::new(), &job(), &state, &options())
            .unwrap_err();
        match err {
            BarrierError::Unparsable { content } => assert_eq!(content, "segfault"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn cancelled_token_stops_the_wait() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = pending_state(temp.path());
        let scheduler = ScriptedScheduler::new("55");
        let opts = options();
        opts.cancel.cancel();

        let err = await_completion(&scheduler, &ManualClock::new(), &job(), &state, &opts)
            .unwrap_err();
        assert!(matches!(err, BarrierError::Cancelled { .. }));
        assert_eq!(scheduler.queries(), 0);
    }

    #[test]
    fn missing_state_file_is_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = StateFile::new(temp.path().join("never-written"));
        let scheduler = ScriptedScheduler::new("55");

        let err = await_completion(&scheduler, &ManualClock::new(), &job(), &state, &options())
            .unwrap_err();
        assert!(matches!(err, BarrierError::Io(_)));
    }
}
