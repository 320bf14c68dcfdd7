//! The simulation driver: one stream, one loop.
//!
//! The driver owns the production engine, the verifier (which owns the
//! reference engine), and the stream sink for the duration of one stream.
//! Its loop interleaves integrator stepping with frame emission,
//! checkpointing, heartbeats, and status reporting, checking the exit
//! predicate at loop-top granularity.
//!
//! Ordering invariant: exactly one `step(1)` per iteration, and
//! `current_step` is incremented strictly after the step completes. All
//! gates run before the step, so a checkpoint flushed between frame
//! boundaries records a `partial_steps` value inside
//! `[0, steps_per_frame)`, which is exactly what resume consumes.

#[cfg(feature = "managed-host")]
mod progress;

use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::engine::{SimulationEngine, SimulationState, SnapshotMask};
use crate::error::WorkerError;
use crate::frame::FrameWriter;
use crate::lifecycle::ExitSignal;
use crate::protocol::{FileMap, StreamSink};
use crate::verify::Verifier;

/// Logical name of the trajectory file inside frame submissions.
pub const TRAJECTORY_FILE: &str = "frames.trj";

/// Logical name of the checkpoint state document.
pub const STATE_FILE: &str = "state.json";

/// Logical name of the mid-frame resume counter.
pub const PARTIAL_STEPS_FILE: &str = "partial_steps";

/// How often the status line is written, in steps.
#[cfg(not(feature = "managed-host"))]
const STATUS_STRIDE: u64 = 10;

/// How often the managed-host progress file is written, in steps.
#[cfg(feature = "managed-host")]
const PROGRESS_STRIDE: u64 = 300;

/// Per-stream driver settings.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Integrator steps per emitted frame.
    pub steps_per_frame: u64,
    /// Wall-clock checkpoint cadence.
    pub checkpoint_interval: Duration,
    /// Wall-clock heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Work-unit directory for the managed-host progress file.
    #[cfg(feature = "managed-host")]
    pub wu_dir: Option<std::path::PathBuf>,
}

/// Drives one stream to completion.
pub struct Driver {
    production: Box<dyn SimulationEngine>,
    verifier: Verifier,
    config: DriverConfig,
    exit: ExitSignal,
    current_step: u64,
    last_checkpoint_step: u64,
    starting_step: u64,
    start_time: Instant,
}

impl Driver {
    /// Builds a driver around the production engine and verifier.
    #[must_use]
    pub fn new(
        production: Box<dyn SimulationEngine>,
        verifier: Verifier,
        config: DriverConfig,
        exit: ExitSignal,
    ) -> Self {
        Self {
            production,
            verifier,
            config,
            exit,
            current_step: 0,
            last_checkpoint_step: 0,
            starting_step: 0,
            start_time: Instant::now(),
        }
    }

    /// Runs the stream to completion, then flushes a final checkpoint and
    /// stops the stream.
    ///
    /// The downloaded `files` supply the resume point: a `partial_steps`
    /// entry (text-encoded integer) continues a partially completed
    /// frame; otherwise the stream starts at step zero.
    ///
    /// # Errors
    ///
    /// Errors propagate unchanged after a best-effort stop with the error
    /// text; retries are the supervisor's concern.
    pub fn run<S: StreamSink>(mut self, mut sink: S, files: &FileMap) -> Result<(), WorkerError> {
        self.resume_from(files)?;
        let loop_result = self.run_loop(&mut sink);
        let flush_result = self.flush_checkpoint(&mut sink);
        match (loop_result, flush_result) {
            (Ok(()), Ok(())) => sink.stop(None),
            (Ok(()), Err(flush_err)) => {
                error!(error = %flush_err, "final checkpoint flush failed");
                if let Err(stop_err) = sink.stop(Some(&flush_err.to_string())) {
                    warn!(error = %stop_err, "stop after failed flush also failed");
                }
                Err(flush_err)
            },
            (Err(loop_err), flush_result) => {
                error!(error = %loop_err, "stream failed");
                if let Err(flush_err) = flush_result {
                    warn!(error = %flush_err, "final checkpoint flush failed");
                }
                if let Err(stop_err) = sink.stop(Some(&loop_err.to_string())) {
                    warn!(error = %stop_err, "stop after stream failure also failed");
                }
                Err(loop_err)
            },
        }
    }

    fn resume_from(&mut self, files: &FileMap) -> Result<(), WorkerError> {
        if let Some(raw) = files.get(PARTIAL_STEPS_FILE) {
            let text = String::from_utf8_lossy(raw);
            let step = text.trim().parse::<u64>().map_err(|e| {
                WorkerError::MalformedEncoding(format!("partial_steps '{}': {e}", text.trim()))
            })?;
            self.current_step = step;
            self.last_checkpoint_step = step;
        }
        self.starting_step = self.current_step;
        self.start_time = Instant::now();
        info!(step = self.current_step, "resuming stream");
        Ok(())
    }

    fn run_loop<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), WorkerError> {
        let now = Instant::now();
        let mut next_heartbeat = now + self.config.heartbeat_interval;
        let mut next_checkpoint = now + self.config.checkpoint_interval;
        loop {
            self.report_progress();
            if self.exit.should_exit() {
                info!(step = self.current_step, "exit requested, leaving main loop");
                return Ok(());
            }
            if self.current_step > 0 && self.current_step % self.config.steps_per_frame == 0 {
                self.emit_frame(sink)?;
            }
            let now = Instant::now();
            if now >= next_heartbeat {
                sink.send_heartbeat()?;
                next_heartbeat = Instant::now() + self.config.heartbeat_interval;
            }
            if now >= next_checkpoint {
                self.flush_checkpoint(sink)?;
                next_checkpoint = Instant::now() + self.config.checkpoint_interval;
            }
            self.production.step(1)?;
            self.current_step += 1;
        }
    }

    /// Snapshots, verifies, encodes, and submits one frame.
    fn emit_frame<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), WorkerError> {
        let state = self.production.snapshot(SnapshotMask::FULL)?;
        self.verifier.check(&state)?;
        let mut writer = FrameWriter::new(Vec::new());
        writer
            .append(
                self.current_step,
                to_f32(state.time_ps),
                &box_to_f32(&state.box_vectors),
                &positions_to_f32(&state.positions),
            )
            .map_err(|e| WorkerError::SubmitFailed(format!("frame encoding: {e}")))?;
        let mut files = FileMap::new();
        files.insert(TRAJECTORY_FILE.to_string(), writer.into_inner());
        sink.send_frame(&files, 1, false)?;
        info!(step = self.current_step, "frame submitted");
        Ok(())
    }

    /// Verifies the current state and submits it as a checkpoint.
    ///
    /// Idempotent: a second flush at the same step reports a frame
    /// fraction of zero and is accepted by the server.
    fn flush_checkpoint<S: StreamSink>(&mut self, sink: &mut S) -> Result<(), WorkerError> {
        let state = self.production.snapshot(SnapshotMask::FULL)?;
        self.verifier.check(&state)?;
        let document = state.to_document()?;
        let partial = self.current_step % self.config.steps_per_frame;
        let mut files = FileMap::new();
        files.insert(STATE_FILE.to_string(), document);
        files.insert(PARTIAL_STEPS_FILE.to_string(), partial.to_string().into_bytes());
        #[allow(clippy::cast_precision_loss)]
        let frames = (self.current_step - self.last_checkpoint_step) as f64
            / self.config.steps_per_frame as f64;
        sink.send_checkpoint(&files, frames, true)?;
        self.last_checkpoint_step = self.current_step;
        info!(step = self.current_step, frames, "checkpoint flushed");
        Ok(())
    }

    #[cfg(not(feature = "managed-host"))]
    fn report_progress(&self) {
        if self.current_step % STATUS_STRIDE != 0 {
            return;
        }
        let completed = self.current_step - self.starting_step;
        if completed == 0 {
            return;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let seconds_per_frame = elapsed * self.config.steps_per_frame as f64 / completed as f64;
        #[allow(clippy::cast_precision_loss)]
        let ns_per_day = if elapsed > 0.0 {
            completed as f64 / elapsed * self.production.step_size_ps() * 86_400.0 / 1_000.0
        } else {
            0.0
        };
        info!(
            target: "gridcore::status",
            tpf_secs = format_args!("{seconds_per_frame:.1}"),
            ns_per_day = format_args!("{ns_per_day:.2}"),
            frames = self.current_step / self.config.steps_per_frame,
            step = self.current_step,
            "progress"
        );
    }

    #[cfg(feature = "managed-host")]
    fn report_progress(&self) {
        if self.current_step % PROGRESS_STRIDE != 0 {
            return;
        }
        if let Some(dir) = &self.config.wu_dir {
            if let Err(e) =
                progress::write_progress_file(dir, self.config.steps_per_frame, self.current_step)
            {
                warn!(error = %e, "could not write progress file");
            }
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_f32(value: f64) -> f32 {
    value as f32
}

#[allow(clippy::cast_possible_truncation)]
fn box_to_f32(vectors: &[[f64; 3]; 3]) -> [[f32; 3]; 3] {
    let mut out = [[0.0f32; 3]; 3];
    for (row_out, row_in) in out.iter_mut().zip(vectors) {
        for (component_out, component_in) in row_out.iter_mut().zip(row_in) {
            *component_out = *component_in as f32;
        }
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn positions_to_f32(positions: &[[f64; 3]]) -> Vec<[f32; 3]> {
    positions
        .iter()
        .map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
        .collect()
}

/// Builds a state snapshot usable as the engine's starting point from the
/// stream's downloaded documents.
///
/// # Errors
///
/// Propagates document parse failures as [`WorkerError`].
pub fn initial_state(files: &FileMap) -> Result<SimulationState, WorkerError> {
    Ok(crate::engine::parse_document(files, STATE_FILE)?)
}
