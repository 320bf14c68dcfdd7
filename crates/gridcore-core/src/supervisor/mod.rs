//! The outer retry loop.
//!
//! The supervisor keeps the worker attached to work for as long as the
//! exit predicate allows: request an assignment, start the stream, build
//! a fresh driver, run it, and come back for more whatever the outcome.
//! Failures are fatal only for the stream they occur in; every
//! retry starts from a clean assignment after an interruptible backoff
//! sleep. The single exception is [`WorkerError::CoreOutdated`], which
//! propagates out so the process can exit with its distinguished code.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::driver::{Driver, DriverConfig, initial_state};
use crate::engine::{
    HarmonicEngine, IntegratorSpec, SystemSpec, parse_document,
};
use crate::error::WorkerError;
use crate::lifecycle::ExitSignal;
use crate::protocol::{CoreClient, StreamData};
use crate::transport::ServerAddr;
use crate::trust::TrustStore;
use crate::verify::{Tolerances, Verifier};

/// First backoff delay, in seconds.
pub const INITIAL_DELAY_SECS: u64 = 1;

/// Backoff ceiling, in seconds.
pub const MAX_DELAY_SECS: u64 = 300;

/// Backoff multiplier applied after every failed attempt.
const DELAY_MULTIPLIER: u64 = 5;

/// Granularity at which the backoff sleep re-checks the exit predicate.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// The next backoff delay after a failed attempt.
#[must_use]
pub const fn next_delay(current_secs: u64) -> u64 {
    let next = current_secs * DELAY_MULTIPLIER;
    if next > MAX_DELAY_SECS { MAX_DELAY_SECS } else { next }
}

/// Owns the retry loop for one worker process.
pub struct Supervisor {
    config: WorkerConfig,
    exit: ExitSignal,
}

impl Supervisor {
    /// Creates a supervisor over the given configuration.
    #[must_use]
    pub const fn new(config: WorkerConfig, exit: ExitSignal) -> Self {
        Self { config, exit }
    }

    /// Runs until the exit predicate fires.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::CoreOutdated`] when the command center
    /// declares this core outdated; every other failure is logged and
    /// retried.
    pub fn run(&self) -> Result<(), WorkerError> {
        let mut delay_secs = INITIAL_DELAY_SECS;
        while !self.exit.should_exit() {
            info!(delay_secs, "sleeping before attempt");
            self.sleep_interruptible(Duration::from_secs(delay_secs));
            if self.exit.should_exit() {
                break;
            }
            delay_secs = next_delay(delay_secs);
            match self.run_one_stream(&mut delay_secs) {
                Ok(()) => {},
                Err(err) if err.is_process_fatal() => return Err(err),
                Err(err) => warn!(error = %err, "stream attempt failed"),
            }
        }
        info!("supervisor exiting");
        Ok(())
    }

    /// One full attempt: assign, start, drive.
    fn run_one_stream(&self, delay_secs: &mut u64) -> Result<(), WorkerError> {
        let cc = ServerAddr::parse(&self.config.cc_address)?;
        let client = CoreClient::new(
            &self.config.core_key,
            &self.config.engine_name,
            TrustStore::bundled(),
            self.config.proxy.clone(),
        );
        let assigned = client.assign(
            &cc,
            self.config.donor_token.as_deref(),
            self.config.target_id.as_deref(),
        )?;
        let (session, data) = assigned.start_stream()?;
        // A successful start resets the backoff.
        *delay_secs = INITIAL_DELAY_SECS;
        let driver = self.build_driver(&data)?;
        driver.run(session, &data.files)
    }

    /// Constructs production and reference engines plus the driver for
    /// one stream. Contexts live exactly as long as the attempt.
    fn build_driver(&self, data: &StreamData) -> Result<Driver, WorkerError> {
        let steps_per_frame = data.steps_per_frame()?;
        let system: SystemSpec = parse_document(&data.files, "system.json")?;
        let integrator: IntegratorSpec = parse_document(&data.files, "integrator.json")?;
        let state = initial_state(&data.files)?;

        // Stochastic forces get a fresh seed per construction.
        #[allow(clippy::cast_sign_loss)]
        let seed = Utc::now().timestamp() as u64;
        let production = HarmonicEngine::production(
            system.clone(),
            &integrator,
            &state,
            self.config.platform,
            &self.config.engine_properties(),
            seed,
        )?;
        let reference = HarmonicEngine::reference(system, &integrator, &state, seed)?;
        let verifier = Verifier::new(Box::new(reference), Tolerances::default());

        Ok(Driver::new(
            Box::new(production),
            verifier,
            DriverConfig {
                steps_per_frame,
                checkpoint_interval: self.config.checkpoint_interval(),
                heartbeat_interval: self.config.heartbeat_interval(),
                #[cfg(feature = "managed-host")]
                wu_dir: self.config.wu_dir.clone(),
            },
            self.exit.clone(),
        ))
    }

    /// Sleeps for `duration`, waking early if the exit predicate fires.
    fn sleep_interruptible(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.exit.should_exit() {
                return;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
