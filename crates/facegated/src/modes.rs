//! Mutually exclusive capture modes.
//!
//! Enrollment and identification share the camera, so at most one of them is
//! active. Every start, stop and stream attach bumps a generation counter; a
//! streaming loop holds a [`StopSignal`] for the generation it was started
//! under and ends as soon as that generation is no longer current.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Idle,
    Enrolling,
    Identifying,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("camera is busy: {active:?} is active")]
pub struct ModeBusy {
    pub active: Mode,
}

struct ModeState {
    mode: Mode,
    generation: u64,
}

pub struct ModeController {
    state: Mutex<ModeState>,
}

impl ModeController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ModeState {
                mode: Mode::Idle,
                generation: 0,
            }),
        })
    }

    pub fn current(&self) -> Mode {
        self.lock().mode
    }

    /// Enter `mode`. Re-entering the active mode is allowed and stops any
    /// stream attached to it; entering the other mode is refused.
    pub fn begin(&self, mode: Mode) -> Result<(), ModeBusy> {
        let mut state = self.lock();
        if state.mode != Mode::Idle && state.mode != mode {
            return Err(ModeBusy { active: state.mode });
        }
        state.mode = mode;
        state.generation += 1;
        tracing::info!(?mode, generation = state.generation, "mode started");
        Ok(())
    }

    /// Leave `mode` if it is active. Returns false when it was not.
    pub fn end(&self, mode: Mode) -> bool {
        let mut state = self.lock();
        if state.mode != mode || mode == Mode::Idle {
            return false;
        }
        state.mode = Mode::Idle;
        state.generation += 1;
        tracing::info!(?mode, generation = state.generation, "mode stopped");
        true
    }

    /// Stop signal for a new stream of `mode`, replacing any stream already
    /// attached. `None` when `mode` is not active.
    pub fn attach(self: &Arc<Self>, mode: Mode) -> Option<StopSignal> {
        let mut state = self.lock();
        if state.mode != mode || mode == Mode::Idle {
            return None;
        }
        state.generation += 1;
        Some(StopSignal {
            controller: Arc::clone(self),
            mode,
            generation: state.generation,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ModeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Polled by a streaming loop once per frame.
#[derive(Clone)]
pub struct StopSignal {
    controller: Arc<ModeController>,
    mode: Mode,
    generation: u64,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        let state = self.controller.lock();
        state.mode != self.mode || state.generation != self.generation
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }
}
