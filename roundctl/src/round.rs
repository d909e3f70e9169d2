//! Orchestration for a single round.
//!
//! A round brings the store up, lets the generator decide whether new work is
//! needed, takes the store down again, and then either stops (skip or fatal)
//! or submits one batch job and blocks until that job reports its exit status
//! through the State File.

use std::path::Path;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::core::params::{ParamsError, RoundParams};
use crate::core::request::{JobHandle, ResourceRequest, SubmitRequest};
use crate::core::status::{DecodeError, StatusClass, StatusCode, decode_status};
use crate::core::template::{render_one, round_context};
use crate::core::types::RoundPhase;
use crate::exit_codes;
use crate::io::barrier::{BarrierError, BarrierOptions, CancelToken, Clock, await_completion};
use crate::io::config::{ControllerConfig, PlatformProfile};
use crate::io::generator::Generator;
use crate::io::relocate::LogRelocator;
use crate::io::round_log::{RoundPaths, RoundRecord, write_generator_log, write_round_record};
use crate::io::scheduler::{Scheduler, SubmissionError, submit_job};
use crate::io::state_file::StateFile;
use crate::io::store::{StoreLauncher, StoreOwnership, StorePaths, recover_lock_artifacts};

/// External collaborators a round talks to.
pub struct RoundServices<'a, S, G, Q, C, L> {
    pub store: &'a S,
    pub generator: &'a G,
    pub scheduler: &'a Q,
    pub clock: &'a C,
    pub relocator: &'a L,
    pub cancel: CancelToken,
}

/// How a round ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A job ran to a zero status; the next round may start.
    Continue { job: JobHandle, job_status: i64 },
    /// The generator found unfinished work; nothing was submitted.
    Skip { status: StatusCode },
}

impl RoundOutcome {
    fn label(&self) -> &'static str {
        match self {
            RoundOutcome::Continue { .. } => "continue",
            RoundOutcome::Skip { .. } => "skip",
        }
    }
}

#[derive(Debug, Error)]
pub enum RoundError {
    #[error("invalid round parameters: {0}")]
    Params(#[from] ParamsError),
    #[error("configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("store: {0:#}")]
    Store(anyhow::Error),
    #[error("generator: {0:#}")]
    Generator(anyhow::Error),
    #[error("cannot decode generator status: {0}")]
    Decode(#[from] DecodeError),
    #[error("generator reported fatal status {0}")]
    GeneratorFatal(StatusCode),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error("Error from job status: {status}")]
    JobFailure { job: JobHandle, status: i64 },
    #[error("state file: {0:#}")]
    StateFile(anyhow::Error),
}

impl RoundError {
    /// Every round error stops the caller's loop.
    pub fn exit_code(&self) -> i32 {
        exit_codes::FATAL
    }
}

/// Run one round end to end.
#[instrument(skip_all, fields(round = params.round, workload = %params.workload))]
pub fn run_round<S, G, Q, C, L>(
    params: &RoundParams,
    config: &ControllerConfig,
    services: &RoundServices<'_, S, G, Q, C, L>,
) -> Result<RoundOutcome, RoundError>
where
    S: StoreLauncher,
    G: Generator,
    Q: Scheduler,
    C: Clock,
    L: LogRelocator,
{
    let started = services.clock.now();

    enter(RoundPhase::Init);
    params.validate()?;
    let profile = config
        .platform(&params.platform)
        .map_err(RoundError::Config)?;
    let round_paths = RoundPaths::new(&params.data_home, &config.paths.rounds_dir, params.round);

    enter(RoundPhase::StoreUp);
    let handle = services
        .store
        .start(&params.data_home, params.port)
        .map_err(RoundError::Store)?;

    enter(RoundPhase::GeneratorRun);
    let generated = services.generator.run(params);
    if let Ok(output) = &generated
        && let Err(err) = write_generator_log(&round_paths, &output.stdout)
    {
        warn!(err = %format!("{err:#}"), "failed to write generator log");
    }

    enter(RoundPhase::StoreDown);
    if let Err(err) = services.store.stop(handle) {
        warn!(
            err = %format!("{err:#}"),
            "store did not stop cleanly, forcing lock artifact recovery"
        );
    }
    let store_paths = StorePaths::new(&params.data_home, &config.paths);
    let ownership = StoreOwnership::assert_sole_client(&params.data_home);
    recover_lock_artifacts(&store_paths, &ownership).map_err(RoundError::Store)?;

    let output = generated.map_err(RoundError::Generator)?;

    let mut record = RoundRecord {
        round: params.round,
        workload: params.workload,
        platform: params.platform.clone(),
        data_home: params.data_home.clone(),
        generator_status: None,
        class: None,
        job_id: None,
        job_status: None,
        outcome: "error".to_string(),
        error: None,
        duration_ms: 0,
    };

    let result = (|| -> Result<RoundOutcome, RoundError> {
        enter(RoundPhase::Decode);
        let status = decode_status(&output.stdout)?;
        record.generator_status = Some(status.0);
        record.class = Some(status.class());
        match status.class() {
            StatusClass::Fatal => {
                error!(status = status.0, "generator reported a fatal status");
                return Err(RoundError::GeneratorFatal(status));
            }
            StatusClass::Skip => {
                info!(status = status.0, "existing incomplete work found");
                return Ok(RoundOutcome::Skip { status });
            }
            StatusClass::Proceed => {}
        }

        enter(RoundPhase::Submit);
        let state_file = StateFile::new(params.data_home.join(&config.paths.state_file));
        let request = build_request(params, config, profile, state_file.path())?;
        state_file.mark_pending().map_err(RoundError::StateFile)?;
        let job = submit_job(services.scheduler, &request)?;
        record.job_id = Some(job.clone());

        enter(RoundPhase::Await);
        let options = BarrierOptions::from_config(&config.barrier, services.cancel.clone());
        let job_status = await_completion(
            services.scheduler,
            services.clock,
            &job,
            &state_file,
            &options,
        )?;
        record.job_status = Some(job_status);
        state_file.remove().map_err(RoundError::StateFile)?;

        if job_status != 0 {
            error!(job = %job, "Error from job status: {job_status}");
            return Err(RoundError::JobFailure {
                job,
                status: job_status,
            });
        }

        enter(RoundPhase::Handoff);
        if let Err(err) = services.relocator.relocate(params) {
            warn!(err = %format!("{err:#}"), "log relocation failed");
        }
        Ok(RoundOutcome::Continue { job, job_status })
    })();

    record.outcome = match &result {
        Ok(outcome) => outcome.label().to_string(),
        Err(_) => "error".to_string(),
    };
    record.error = result.as_ref().err().map(|err| err.to_string());
    let elapsed = services.clock.now().saturating_duration_since(started);
    record.duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    if let Err(err) = write_round_record(&round_paths, &record) {
        warn!(err = %format!("{err:#}"), "failed to write round record");
    }

    result
}

/// Build the batch submission for a proceeding round.
pub fn build_request(
    params: &RoundParams,
    config: &ControllerConfig,
    profile: &PlatformProfile,
    state_file: &Path,
) -> Result<SubmitRequest, RoundError> {
    let job_name = render_one(&config.scheduler.job_name, &round_context(params))
        .map_err(|err| RoundError::Config(anyhow!("render scheduler.job_name: {err}")))?;
    let job_script = if profile.job_script.is_absolute() {
        profile.job_script.clone()
    } else {
        params.data_home.join(&profile.job_script)
    };
    let resources = ResourceRequest {
        nodes: params.nodes.unwrap_or(profile.nodes),
        minutes: params.minutes,
        allocation: profile.allocation.clone(),
        queue: profile.queue.clone(),
        flags: profile.flags.clone(),
    };
    Ok(SubmitRequest::new(
        job_name,
        resources,
        job_script,
        params,
        state_file,
    ))
}

fn enter(phase: RoundPhase) {
    info!(phase = %phase, "entering phase");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::core::request::{ENV_ROUND, ENV_STATE_FILE};
    use crate::test_support::{
        FakeStore, ManualClock, RecordingRelocator, ScriptedGenerator, ScriptedJob,
        ScriptedScheduler, round_params, temp_data_home,
    };

    struct Harness {
        store: FakeStore,
        generator: ScriptedGenerator,
        scheduler: ScriptedScheduler,
        clock: ManualClock,
        relocator: RecordingRelocator,
    }

    impl Harness {
        fn new(generator: ScriptedGenerator, scheduler: ScriptedScheduler) -> Self {
            Self {
                store: FakeStore::new(),
                generator,
                scheduler,
                clock: ManualClock::new(),
                relocator: RecordingRelocator::new(),
            }
        }

        fn run(&self, params: &RoundParams) -> Result<RoundOutcome, RoundError> {
            let services = RoundServices {
                store: &self.store,
                generator: &self.generator,
                scheduler: &self.scheduler,
                clock: &self.clock,
                relocator: &self.relocator,
                cancel: CancelToken::new(),
            };
            run_round(params, &ControllerConfig::default(), &services)
        }
    }

    fn finishing_job(data_home: &Path, status: &str) -> ScriptedScheduler {
        ScriptedScheduler::new("Submitted batch job 812\n").with_job(ScriptedJob {
            state_file: data_home.join("admd.state"),
            polls_before_write: 2,
            writes: Some(status.to_string()),
            leaves_queue: false,
        })
    }

    fn record(data_home: &Path) -> serde_json::Value {
        let path = data_home.join("rounds").join("4").join("round.json");
        serde_json::from_str(&fs::read_to_string(path).expect("round record")).expect("json")
    }

    #[test]
    fn proceed_submits_once_and_waits_for_the_job() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::new("connecting to store\n0\n"),
            finishing_job(home.path(), "0"),
        );

        let outcome = harness.run(&params).expect("round");

        match outcome {
            RoundOutcome::Continue { job, job_status } => {
                assert_eq!(job.as_str(), "812");
                assert_eq!(job_status, 0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let submissions = harness.scheduler.submissions();
        assert_eq!(submissions.len(), 1);
        let env = &submissions[0].env;
        assert!(env.contains(&(ENV_ROUND.to_string(), "4:traj:8:5000:90".to_string())));
        assert!(env.contains(&(
            ENV_STATE_FILE.to_string(),
            home.path().join("admd.state").display().to_string()
        )));
        assert_eq!(harness.store.starts(), 1);
        assert_eq!(harness.store.stops(), 1);
        assert_eq!(harness.relocator.rounds(), vec![4]);
        assert!(!home.path().join("admd.state").exists());
        assert_eq!(harness.clock.elapsed(), Duration::from_secs(90));

        let record = record(home.path());
        assert_eq!(record["outcome"], "continue");
        assert_eq!(record["job_id"], "812");
        assert_eq!(record["duration_ms"], 90_000);
    }

    #[test]
    fn skip_never_submits() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::new("3\n"),
            ScriptedScheduler::new("Submitted batch job 1"),
        );

        let outcome = harness.run(&params).expect("round");

        assert_eq!(
            outcome,
            RoundOutcome::Skip {
                status: StatusCode(3)
            }
        );
        assert!(harness.scheduler.submissions().is_empty());
        assert_eq!(harness.store.stops(), 1);
        assert!(harness.relocator.rounds().is_empty());
        assert_eq!(record(home.path())["outcome"], "skip");
    }

    #[test]
    fn fatal_status_never_submits() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::new("-1\n"),
            ScriptedScheduler::new("Submitted batch job 1"),
        );

        let err = harness.run(&params).unwrap_err();

        assert!(matches!(err, RoundError::GeneratorFatal(StatusCode(-1))));
        assert_eq!(err.exit_code(), exit_codes::FATAL);
        assert!(harness.scheduler.submissions().is_empty());
        assert_eq!(harness.store.stops(), 1);
        let record = record(home.path());
        assert_eq!(record["outcome"], "error");
        assert_eq!(record["class"], "fatal");
    }

    #[test]
    fn undecodable_output_is_fatal() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::new("Traceback (most recent call last):\n"),
            ScriptedScheduler::new("Submitted batch job 1"),
        );

        let err = harness.run(&params).unwrap_err();

        assert!(matches!(
            err,
            RoundError::Decode(DecodeError::NotAnInteger { .. })
        ));
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[test]
    fn nonzero_job_status_is_a_job_failure() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::new("0"),
            finishing_job(home.path(), "137"),
        );

        let err = harness.run(&params).unwrap_err();

        assert_eq!(err.to_string(), "Error from job status: 137");
        assert!(matches!(err, RoundError::JobFailure { status: 137, .. }));
        assert!(harness.relocator.rounds().is_empty());
        assert!(!home.path().join("admd.state").exists());
        assert_eq!(record(home.path())["job_status"], 137);
    }

    #[test]
    fn generator_failure_still_stops_the_store() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness::new(
            ScriptedGenerator::failing("python: No module named admd"),
            ScriptedScheduler::new("Submitted batch job 1"),
        );

        let err = harness.run(&params).unwrap_err();

        assert!(matches!(err, RoundError::Generator(_)));
        assert_eq!(harness.store.stops(), 1);
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[test]
    fn store_start_failure_skips_the_generator() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness {
            store: FakeStore::failing_start(),
            ..Harness::new(
                ScriptedGenerator::new("0"),
                ScriptedScheduler::new("Submitted batch job 1"),
            )
        };

        let err = harness.run(&params).unwrap_err();

        assert!(matches!(err, RoundError::Store(_)));
        assert_eq!(harness.generator.runs(), 0);
        assert_eq!(harness.store.stops(), 0);
    }

    #[test]
    fn stale_lock_artifacts_are_recovered_after_stop() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let socket = home.path().join("socket").join("mongodb-27017.sock");
        let lock = home.path().join("db").join("mongod.lock");
        fs::create_dir_all(lock.parent().expect("parent")).expect("db dir");
        fs::write(&lock, "1234\n").expect("lock");
        let harness = Harness {
            store: FakeStore::leaving_socket(&socket),
            ..Harness::new(
                ScriptedGenerator::new("2"),
                ScriptedScheduler::new("Submitted batch job 1"),
            )
        };

        harness.run(&params).expect("round");

        assert!(!socket.exists());
        assert!(!lock.exists());
    }

    #[test]
    fn failed_store_stop_still_recovers_lock_artifacts() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let socket = home.path().join("socket").join("mongodb-27017.sock");
        let lock = home.path().join("db").join("mongod.lock");
        fs::create_dir_all(lock.parent().expect("parent")).expect("db dir");
        fs::write(&lock, "1234\n").expect("lock");
        let harness = Harness {
            store: FakeStore::failing_stop(&socket),
            ..Harness::new(
                ScriptedGenerator::new("2"),
                ScriptedScheduler::new("Submitted batch job 1"),
            )
        };

        let outcome = harness.run(&params).expect("round");

        assert_eq!(
            outcome,
            RoundOutcome::Skip {
                status: StatusCode(2)
            }
        );
        assert_eq!(harness.store.stops(), 1);
        assert!(!socket.exists());
        assert!(!lock.exists());
    }

    #[test]
    fn relocation_failure_does_not_fail_the_round() {
        let home = temp_data_home();
        let params = round_params(&home.path().display().to_string());
        let harness = Harness {
            relocator: RecordingRelocator::failing(),
            ..Harness::new(ScriptedGenerator::new("0"), finishing_job(home.path(), "0"))
        };

        let outcome = harness.run(&params).expect("round");
        assert!(matches!(outcome, RoundOutcome::Continue { .. }));
    }

    #[test]
    fn unknown_platform_fails_before_the_store_starts() {
        let home = temp_data_home();
        let mut params = round_params(&home.path().display().to_string());
        params.platform = "summit".to_string();
        let harness = Harness::new(
            ScriptedGenerator::new("0"),
            ScriptedScheduler::new("Submitted batch job 1"),
        );

        let err = harness.run(&params).unwrap_err();
        assert!(matches!(err, RoundError::Config(_)));
        assert_eq!(harness.store.starts(), 0);
    }

    #[test]
    fn request_uses_profile_and_relative_job_script() {
        let params = RoundParams {
            nodes: None,
            ..round_params("/lustre/admd")
        };
        let profile = PlatformProfile {
            allocation: Some("bip149".to_string()),
            queue: Some("batch".to_string()),
            nodes: 16,
            flags: vec!["--gpus-per-node=6".to_string()],
            job_script: PathBuf::from("jobs/traj.sh"),
        };

        let request = build_request(
            &params,
            &ControllerConfig::default(),
            &profile,
            Path::new("/lustre/admd/admd.state"),
        )
        .expect("request");

        assert_eq!(request.job_name, "admd-r4");
        assert_eq!(request.resources.nodes, 16);
        assert_eq!(request.resources.queue.as_deref(), Some("batch"));
        assert_eq!(request.job_script, PathBuf::from("/lustre/admd/jobs/traj.sh"));

        let overridden = build_request(
            &RoundParams {
                nodes: Some(2),
                ..params
            },
            &ControllerConfig::default(),
            &profile,
            Path::new("/lustre/admd/admd.state"),
        )
        .expect("request");
        assert_eq!(overridden.resources.nodes, 2);
    }
}
