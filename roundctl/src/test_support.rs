//! Test-only fakes for the round controller's collaborators.

use std::cell::{Cell, RefCell};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};

use crate::core::params::{DEFAULT_DB_PORT, RoundParams, Workload};
use crate::core::request::{JobHandle, SubmitRequest};
use crate::io::barrier::Clock;
use crate::io::generator::{Generator, GeneratorOutput};
use crate::io::relocate::LogRelocator;
use crate::io::scheduler::{QueueState, Scheduler};
use crate::io::store::StoreLauncher;

/// Deterministic round parameters rooted at `data_home`.
pub fn round_params(data_home: &str) -> RoundParams {
    RoundParams {
        round: 4,
        workload: Workload::Traj,
        tasks: 8,
        steps: 5000,
        minutes: 90,
        data_home: PathBuf::from(data_home),
        port: DEFAULT_DB_PORT,
        platform: "local".to_string(),
        nodes: None,
    }
}

/// Fresh temporary data home.
pub fn temp_data_home() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

/// How a scripted batch job behaves while the barrier polls it.
#[derive(Debug, Clone)]
pub struct ScriptedJob {
    pub state_file: PathBuf,
    /// Queries answered before the job writes `writes`.
    pub polls_before_write: usize,
    /// Status written into the state file. `None` never writes.
    pub writes: Option<String>,
    /// Report the job as gone once it would have written.
    pub leaves_queue: bool,
}

/// Scheduler returning a canned submit response and following a [`ScriptedJob`].
pub struct ScriptedScheduler {
    response: String,
    job: Option<ScriptedJob>,
    submissions: RefCell<Vec<SubmitRequest>>,
    queries: Cell<usize>,
    /// Queries since the last submission.
    job_polls: Cell<usize>,
    written: Cell<bool>,
}

impl ScriptedScheduler {
    pub fn new(response: &str) -> Self {
        Self {
            response: response.to_string(),
            job: None,
            submissions: RefCell::new(Vec::new()),
            queries: Cell::new(0),
            job_polls: Cell::new(0),
            written: Cell::new(false),
        }
    }

    pub fn with_job(mut self, job: ScriptedJob) -> Self {
        self.job = Some(job);
        self
    }

    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.submissions.borrow().clone()
    }

    pub fn queries(&self) -> usize {
        self.queries.get()
    }
}

impl Scheduler for ScriptedScheduler {
    fn submit(&self, request: &SubmitRequest) -> Result<String> {
        self.submissions.borrow_mut().push(request.clone());
        self.job_polls.set(0);
        self.written.set(false);
        Ok(self.response.clone())
    }

    fn query(&self, _job: &JobHandle) -> Result<QueueState> {
        self.queries.set(self.queries.get() + 1);
        let polls = self.job_polls.get() + 1;
        self.job_polls.set(polls);

        let Some(job) = &self.job else {
            return Ok(QueueState::Active("RUNNING".to_string()));
        };
        if polls <= job.polls_before_write {
            return Ok(QueueState::Active("RUNNING".to_string()));
        }
        if let Some(status) = &job.writes
            && !self.written.get()
        {
            fs::write(&job.state_file, format!("{status}\n"))?;
            self.written.set(true);
        }
        if job.leaves_queue {
            Ok(QueueState::Gone)
        } else {
            Ok(QueueState::Active("COMPLETING".to_string()))
        }
    }
}

/// Generator returning canned stdout per run, or failing to run at all.
///
/// Runs past the end of the script repeat the last entry.
pub struct ScriptedGenerator {
    script: Vec<Result<String, String>>,
    runs: Cell<usize>,
}

impl ScriptedGenerator {
    pub fn new(stdout: &str) -> Self {
        Self::sequence(&[stdout])
    }

    pub fn sequence(outputs: &[&str]) -> Self {
        Self {
            script: outputs.iter().map(|out| Ok(out.to_string())).collect(),
            runs: Cell::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            script: vec![Err(message.to_string())],
            runs: Cell::new(0),
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.get()
    }
}

impl Generator for ScriptedGenerator {
    fn run(&self, _params: &RoundParams) -> Result<GeneratorOutput> {
        let run = self.runs.get();
        self.runs.set(run + 1);
        let entry = self
            .script
            .get(run)
            .or(self.script.last())
            .ok_or_else(|| anyhow!("empty generator script"))?;
        match entry {
            Ok(stdout) => Ok(GeneratorOutput {
                stdout: stdout.clone(),
                exit_code: Some(0),
            }),
            Err(message) => Err(anyhow!("{message}")),
        }
    }
}

/// Store that only counts lifecycle calls.
#[derive(Default)]
pub struct FakeStore {
    starts: Cell<usize>,
    stops: Cell<usize>,
    fail_start: bool,
    fail_stop: bool,
    /// Socket artifacts to leave behind on stop, as a crashed store would.
    leave_socket: Option<PathBuf>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn leaving_socket(socket_file: &Path) -> Self {
        Self {
            leave_socket: Some(socket_file.to_path_buf()),
            ..Self::default()
        }
    }

    /// Store that crashes on shutdown: leaves its socket behind and reports an error.
    pub fn failing_stop(socket_file: &Path) -> Self {
        Self {
            fail_stop: true,
            ..Self::leaving_socket(socket_file)
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.get()
    }

    pub fn stops(&self) -> usize {
        self.stops.get()
    }
}

impl StoreLauncher for FakeStore {
    type Handle = ();

    fn start(&self, _data_home: &Path, _port: u16) -> Result<()> {
        self.starts.set(self.starts.get() + 1);
        if self.fail_start {
            return Err(anyhow!("address already in use"));
        }
        Ok(())
    }

    fn stop(&self, _handle: ()) -> Result<()> {
        self.stops.set(self.stops.get() + 1);
        if let Some(socket_file) = &self.leave_socket {
            if let Some(parent) = socket_file.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(socket_file, "")?;
        }
        if self.fail_stop {
            return Err(anyhow!("store exited with signal 6"));
        }
        Ok(())
    }
}

/// Clock that advances only when slept on.
pub struct ManualClock {
    start: Instant,
    now: Cell<Instant>,
    sleeps: Cell<usize>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            now: Cell::new(start),
            sleeps: Cell::new(0),
        }
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.get()
    }

    pub fn elapsed(&self) -> Duration {
        self.now.get() - self.start
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
        self.sleeps.set(self.sleeps.get() + 1);
    }
}

/// Relocator recording the rounds it was asked to hand off.
#[derive(Default)]
pub struct RecordingRelocator {
    rounds: RefCell<Vec<u32>>,
    fail: bool,
}

impl RecordingRelocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn rounds(&self) -> Vec<u32> {
        self.rounds.borrow().clone()
    }
}

impl LogRelocator for RecordingRelocator {
    fn relocate(&self, params: &RoundParams) -> Result<()> {
        self.rounds.borrow_mut().push(params.round);
        if self.fail {
            return Err(anyhow!("archive volume is read-only"));
        }
        Ok(())
    }
}
