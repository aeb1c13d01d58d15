//! Background registration run and its state machine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::image::{IntensityImage, LoadedImage};
use crate::error::RegistrationError;
use crate::events::{Event, EventSender, RegistrationEvent};

use super::optimizer::{GradientDescentOptimizer, IterativeOptimizer, StepOutcome};
use super::progress::{ProgressChannel, ProgressSample};
use super::{AffineTransform, RegistrationConfig, WorkerState};

/// Cooperative stop flag shared with the worker thread
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type OptimizerFactory =
    Box<dyn FnOnce() -> Result<Box<dyn IterativeOptimizer>, RegistrationError> + Send>;

/// State touched by both the worker thread and the foreground.
#[derive(Debug)]
struct RunShared {
    state: Mutex<WorkerState>,
    progress: ProgressChannel,
    cancel: CancellationToken,
    failure: Mutex<Option<RegistrationError>>,
    result: Mutex<Option<AffineTransform>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    /// A progress marker is queued and not yet acknowledged
    marker_pending: AtomicBool,
}

impl RunShared {
    fn state(&self) -> MutexGuard<'_, WorkerState> {
        lock(&self.state)
    }

    /// Move `Running` to a terminal state; any other state is left alone.
    fn finish(&self, terminal: WorkerState) -> bool {
        let mut state = self.state();
        if *state != WorkerState::Running {
            return false;
        }
        *state = terminal;
        *lock(&self.finished_at) = Some(Utc::now());
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Serializable summary of a run
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationReport {
    pub run_id: Uuid,
    pub state: WorkerState,
    pub iterations: u64,
    pub objective: Option<f64>,
    pub transform: Option<AffineTransform>,
    pub failure: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One registration run of an overlay against a reference image.
///
/// The worker owns its progress channel; a finished worker cannot be
/// restarted, so samples from one run never show up in another.
pub struct RegistrationWorker {
    run_id: Uuid,
    reference: Arc<IntensityImage>,
    overlay: Arc<IntensityImage>,
    events: EventSender,
    shared: Arc<RunShared>,
    handle: Option<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl RegistrationWorker {
    pub fn new(
        reference: Arc<IntensityImage>,
        overlay: Arc<IntensityImage>,
        events: EventSender,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            reference,
            overlay,
            events,
            shared: Arc::new(RunShared {
                state: Mutex::new(WorkerState::Idle),
                progress: ProgressChannel::new(),
                cancel: CancellationToken::new(),
                failure: Mutex::new(None),
                result: Mutex::new(None),
                finished_at: Mutex::new(None),
                marker_pending: AtomicBool::new(false),
            }),
            handle: None,
            started_at: None,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// The mailbox the worker publishes into
    pub fn progress(&self) -> &ProgressChannel {
        &self.shared.progress
    }

    /// Why the run failed, once it has
    pub fn failure(&self) -> Option<RegistrationError> {
        lock(&self.shared.failure).clone()
    }

    /// Begin optimizing on a background thread.
    ///
    /// Fails with `InvalidState` unless the worker is idle. An unsupported
    /// mode or an invalid setting is rejected here and leaves the worker idle.
    pub fn start(&mut self, config: RegistrationConfig) -> Result<(), RegistrationError> {
        self.ensure_idle()?;
        if !config.mode.is_supported() {
            return Err(RegistrationError::UnsupportedMode(config.mode));
        }
        config.validate()?;

        info!(
            run_id = %self.run_id,
            mode = %config.mode,
            metric = %config.metric,
            init = %config.init,
            "Starting registration"
        );

        let reference = Arc::clone(&self.reference);
        let overlay = Arc::clone(&self.overlay);
        self.launch(Box::new(move || {
            let optimizer = GradientDescentOptimizer::new(&config, reference, overlay)?;
            Ok(Box::new(optimizer) as Box<dyn IterativeOptimizer>)
        }))
    }

    fn ensure_idle(&self) -> Result<(), RegistrationError> {
        let state = self.state();
        if state != WorkerState::Idle {
            return Err(RegistrationError::InvalidState {
                operation: "start",
                state,
            });
        }
        Ok(())
    }

    fn launch(&mut self, factory: OptimizerFactory) -> Result<(), RegistrationError> {
        {
            let mut state = self.shared.state();
            if *state != WorkerState::Idle {
                return Err(RegistrationError::InvalidState {
                    operation: "start",
                    state: *state,
                });
            }
            *state = WorkerState::Running;
        }
        self.started_at = Some(Utc::now());

        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let run_id = self.run_id;
        self.handle = Some(thread::spawn(move || {
            run_registration(run_id, &shared, &events, factory);
        }));
        Ok(())
    }

    /// Let the run queue another progress marker.
    ///
    /// Call after draining markers; until then further iterations only
    /// update the progress channel.
    pub fn acknowledge_progress(&self) {
        self.shared.marker_pending.store(false, Ordering::SeqCst);
    }

    /// Ask the run to stop at its next iteration boundary.
    ///
    /// Safe in any state. Cancelling an idle worker makes it terminal.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        let mut state = self.shared.state();
        if *state == WorkerState::Idle {
            *state = WorkerState::Cancelled;
        }
    }

    /// Last published objective value
    pub fn objective(&self) -> Result<f64, RegistrationError> {
        self.shared
            .progress
            .latest()
            .map(|sample| sample.value)
            .ok_or(RegistrationError::Unavailable)
    }

    /// Transform of the last published iteration, for live display
    pub fn preview_transform(&self) -> Option<AffineTransform> {
        self.shared.progress.latest().map(|sample| sample.transform)
    }

    /// Final transform; only present once the run converged
    pub fn result_transform(&self) -> Option<AffineTransform> {
        if self.state() != WorkerState::Converged {
            return None;
        }
        *lock(&self.shared.result)
    }

    /// Copy the converged transform into `image`.
    ///
    /// In any other state this fails with `NotReady` and leaves `image`
    /// untouched.
    pub fn apply_result_transform(&self, image: &mut LoadedImage) -> Result<(), RegistrationError> {
        let transform = self
            .result_transform()
            .ok_or(RegistrationError::NotReady)?;
        image.transform = transform;
        Ok(())
    }

    /// Wait for the worker thread to exit and return the final state.
    ///
    /// Returns immediately if the worker was never started.
    pub fn join(&mut self) -> WorkerState {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                *lock(&self.shared.failure) = Some(RegistrationError::NumericalFailure(
                    "registration thread panicked".to_string(),
                ));
                self.shared.finish(WorkerState::Failed);
            }
        }
        self.state()
    }

    pub fn report(&self) -> RegistrationReport {
        let latest = self.shared.progress.latest();
        RegistrationReport {
            run_id: self.run_id,
            state: self.state(),
            iterations: latest.map(|sample| sample.iteration).unwrap_or(0),
            objective: latest.map(|sample| sample.value),
            transform: self.result_transform(),
            failure: self.failure().map(|e| e.to_string()),
            started_at: self.started_at,
            finished_at: *lock(&self.shared.finished_at),
        }
    }
}

impl Drop for RegistrationWorker {
    // Detach rather than join: the thread stops at its next boundary and
    // the foreground is never held up by a teardown.
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

fn run_registration(
    run_id: Uuid,
    shared: &RunShared,
    events: &EventSender,
    factory: OptimizerFactory,
) {
    // A panic ends the run as `Failed` on this thread.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        factory().and_then(|mut optimizer| drive(run_id, optimizer.as_mut(), shared, events))
    }))
    .unwrap_or_else(|_| {
        Err(RegistrationError::NumericalFailure(
            "registration thread panicked".to_string(),
        ))
    });

    let terminal = match outcome {
        Ok(state) => state,
        Err(error) => {
            warn!(run_id = %run_id, error = %error, "Registration failed");
            *lock(&shared.failure) = Some(error);
            WorkerState::Failed
        }
    };

    if shared.finish(terminal) {
        match terminal {
            WorkerState::Cancelled => warn!(run_id = %run_id, "Registration cancelled"),
            WorkerState::Converged => info!(run_id = %run_id, "Registration converged"),
            _ => {}
        }
        events.send(Event::Registration(RegistrationEvent::Finished {
            run_id,
            state: terminal,
        }));
    }
}

/// Step until the optimizer converges, fails, or the run is cancelled.
fn drive(
    run_id: Uuid,
    optimizer: &mut dyn IterativeOptimizer,
    shared: &RunShared,
    events: &EventSender,
) -> Result<WorkerState, RegistrationError> {
    loop {
        if shared.cancel.is_cancelled() {
            return Ok(WorkerState::Cancelled);
        }

        match optimizer.step()? {
            StepOutcome::Stepped => {
                // A result computed after cancellation is not published.
                if shared.cancel.is_cancelled() {
                    return Ok(WorkerState::Cancelled);
                }
                let sample = ProgressSample {
                    value: optimizer.value(),
                    iteration: optimizer.iteration(),
                    transform: optimizer.transform(),
                };
                shared.progress.publish(sample);
                debug!(
                    run_id = %run_id,
                    iteration = sample.iteration,
                    value = sample.value,
                    "Registration iteration"
                );
                // At most one unacknowledged marker per run
                if !shared.marker_pending.swap(true, Ordering::SeqCst) {
                    events.send(Event::Registration(RegistrationEvent::Progress {
                        run_id,
                        iteration: sample.iteration,
                    }));
                }
            }
            StepOutcome::Converged => {
                *lock(&shared.result) = Some(optimizer.transform());
                return Ok(WorkerState::Converged);
            }
        }
    }
}
