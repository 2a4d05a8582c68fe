//! Single-line terminal progress indicator.
//!
//! One status line on stdout is continuously overwritten with the current
//! phase. A background thread animates a spinner while a phase is active; all
//! writes (the thread's redraws and the caller's completion marks) go through
//! one mutex so the line is never half-written by two writers.
//!
//! Lifecycle of the animation thread:
//! - [`ProgressReporter::start_phase`] spawns it when none is running;
//! - [`ProgressReporter::complete_phase`] / [`ProgressReporter::error_phase`]
//!   signal it under the lock and join it *outside* the lock before touching
//!   the line again, so once they return no thread for that phase remains.

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

/// Redraw interval of the animation thread.
pub const TICK: Duration = Duration::from_millis(80);

const SPINNER: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const DEFAULT_WIDTH: usize = 80;

/// Named stage shown on the status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Planning,
    Thinking,
    Executing,
    Optimizing,
    Validating,
    Generating,
    Error,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Planning => "Planning",
            Phase::Thinking => "Thinking",
            Phase::Executing => "Executing",
            Phase::Optimizing => "Optimizing",
            Phase::Validating => "Validating",
            Phase::Generating => "Generating",
            Phase::Error => "Error",
        }
    }
}

/// Identifies one `start_phase` call; only its holder may retire the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseId(u64);

/// Snapshot of the active phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub phase: Phase,
    pub message: String,
    pub details: String,
}

impl ProgressState {
    fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            message: String::new(),
            details: String::new(),
        }
    }
}

struct Inner {
    state: ProgressState,
    generation: u64,
    frame: usize,
    /// Id of the thread allowed to animate; 0 when none is.
    animator: u64,
    spawned: u64,
    animation: Option<JoinHandle<()>>,
    writer: Box<dyn Write + Send>,
    width: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
    enabled: bool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to the status line. Clones share the same line and lock.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
}

impl ProgressReporter {
    /// Reporter drawing on stdout, sized to the current terminal width.
    pub fn new() -> Self {
        let width = crossterm::terminal::size()
            .map(|(cols, _)| cols as usize)
            .unwrap_or(DEFAULT_WIDTH);
        Self::with_writer(Box::new(std::io::stdout()), width)
    }

    /// Reporter drawing on an arbitrary writer with a fixed width.
    pub fn with_writer(writer: Box<dyn Write + Send>, width: usize) -> Self {
        Self::build(writer, width.max(1), true)
    }

    /// Reporter that tracks state but never draws or spawns threads.
    pub fn disabled() -> Self {
        Self::build(Box::new(std::io::sink()), DEFAULT_WIDTH, false)
    }

    fn build(writer: Box<dyn Write + Send>, width: usize, enabled: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ProgressState::idle(),
                    generation: 0,
                    frame: 0,
                    animator: 0,
                    spawned: 0,
                    animation: None,
                    writer,
                    width,
                }),
                wake: Condvar::new(),
                enabled,
            }),
        }
    }

    /// Make `phase` the active phase and ensure the animation thread runs.
    pub fn start_phase(
        &self,
        phase: Phase,
        message: impl Into<String>,
        details: impl Into<String>,
    ) -> PhaseId {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.state = ProgressState {
            phase,
            message: message.into(),
            details: details.into(),
        };
        let id = PhaseId(inner.generation);

        if self.shared.enabled && inner.animation.is_none() {
            inner.spawned += 1;
            let animator = inner.spawned;
            inner.animator = animator;
            let shared = Arc::clone(&self.shared);
            match thread::Builder::new()
                .name("taskloop-progress".to_string())
                .spawn(move || animate(&shared, animator))
            {
                Ok(handle) => inner.animation = Some(handle),
                Err(err) => {
                    inner.animator = 0;
                    warn!(err = %err, "failed to spawn progress thread");
                }
            }
        }
        id
    }

    /// Replace the details of the active phase; shown on the next tick.
    pub fn update_details(&self, details: impl Into<String>) {
        let mut inner = self.shared.lock();
        if inner.state.phase != Phase::Idle {
            inner.state.details = details.into();
        }
    }

    /// Retire phase `id`.
    ///
    /// With `show_completion` a checkmark line with `final_message` and a
    /// newline is left behind; otherwise the line is cleared without a trace.
    /// Returns `false` (and does nothing) when `id` is no longer the active
    /// phase.
    pub fn complete_phase(&self, id: PhaseId, final_message: &str, show_completion: bool) -> bool {
        if !self.stop_animation(id) {
            return false;
        }
        let line = show_completion.then(|| format!("✓ {final_message}\n"));
        self.settle(id, ProgressState::idle(), line.as_deref().unwrap_or(""));
        true
    }

    /// Retire phase `id` with an error marker, optionally ending the line.
    pub fn error_phase(&self, id: PhaseId, message: &str, newline: bool) -> bool {
        if !self.stop_animation(id) {
            return false;
        }
        let state = ProgressState {
            phase: Phase::Error,
            message: message.to_string(),
            details: String::new(),
        };
        let line = format!("✗ {message}{}", if newline { "\n" } else { "" });
        self.settle(id, state, &line);
        true
    }

    /// Stop any animation and clear the line, whoever owns the active phase.
    pub fn close(&self) {
        let handle = {
            let mut inner = self.shared.lock();
            inner.animator = 0;
            inner.animation.take()
        };
        self.shared.wake.notify_all();
        let was_animating = handle.is_some();
        join(handle);
        let mut inner = self.shared.lock();
        if inner.state.phase != Phase::Error {
            inner.state = ProgressState::idle();
        }
        if self.shared.enabled && was_animating {
            write_line(&mut inner, "");
        }
    }

    pub fn state(&self) -> ProgressState {
        self.shared.lock().state.clone()
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().state.phase
    }

    /// Whether an animation thread currently exists.
    pub fn is_animating(&self) -> bool {
        self.shared.lock().animation.is_some()
    }

    /// Signal the thread under the lock, then join it with the lock released
    /// (the thread needs the lock to observe the signal).
    fn stop_animation(&self, id: PhaseId) -> bool {
        let handle = {
            let mut inner = self.shared.lock();
            if inner.generation != id.0 || inner.state.phase == Phase::Idle {
                debug!(phase_id = id.0, "ignoring retire of inactive phase");
                return false;
            }
            inner.animator = 0;
            inner.animation.take()
        };
        self.shared.wake.notify_all();
        join(handle);
        true
    }

    /// Final state and line for a retired phase. Skipped when another caller
    /// started a newer phase while the lock was released for the join.
    fn settle(&self, id: PhaseId, state: ProgressState, line: &str) {
        let mut inner = self.shared.lock();
        if inner.generation != id.0 {
            debug!(phase_id = id.0, "phase superseded while stopping");
            return;
        }
        inner.state = state;
        if self.shared.enabled {
            write_line(&mut inner, line);
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn join(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle
        && handle.join().is_err()
    {
        warn!("progress thread panicked");
    }
}

fn animate(shared: &Shared, animator: u64) {
    let mut inner = shared.lock();
    while inner.animator == animator {
        let line = render(&inner);
        write_line(&mut inner, &line);
        inner.frame = (inner.frame + 1) % SPINNER.len();
        inner = match shared.wake.wait_timeout(inner, TICK) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

fn render(inner: &Inner) -> String {
    let state = &inner.state;
    let mut line = format!(
        "{} {}: {}",
        SPINNER[inner.frame],
        state.phase.label(),
        state.message
    );
    if !state.details.is_empty() {
        line.push_str(" · ");
        line.push_str(&state.details);
    }
    // Keep one column free so the cursor never wraps onto a new line.
    line.chars().take(inner.width.saturating_sub(1)).collect()
}

/// Clear the full width with spaces, return to column 0 and write `text`.
fn write_line(inner: &mut Inner, text: &str) {
    let clear = " ".repeat(inner.width);
    let result = write!(inner.writer, "\r{clear}\r{text}").and_then(|()| inner.writer.flush());
    if let Err(err) = result {
        debug!(err = %err, "progress write failed");
    }
}
