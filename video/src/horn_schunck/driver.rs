use super::gradient::Gradients;
use super::relax::VelocityState;
use super::HornSchunck;
use crate::{FlowField, Result, VideoError};
use cv_core::Field;
use cv_imgproc::BorderMode;
use tracing::{debug, trace, warn};

/// Where a [`FlowIteration`] stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Gradients computed, `u = v = 0`, no sweep applied yet.
    Initialized,
    /// At least one sweep applied, more remain.
    Iterating,
    /// The last sweep changed no sample by `epsilon` or more.
    Converged,
    /// The iteration budget is spent.
    Exhausted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Converged | Phase::Exhausted)
    }
}

/// Why a solve stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exhausted,
    Converged,
    /// Finished by the caller before reaching a terminal phase.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct FlowSolution {
    pub flow: FlowField,
    /// Number of full-field sweeps applied.
    pub iterations: usize,
    pub termination: Termination,
    /// `max(|u' - u|, |v' - v|)` of the last sweep; `None` if no sweep ran.
    pub last_delta: Option<f32>,
}

/// A single solve advanced one full-field sweep at a time.
///
/// Created by [`HornSchunck::begin`]. Callers that need to stop early (for
/// example on user cancellation) drive [`step`](Self::step) themselves and
/// call [`finish`](Self::finish) whenever they like; the field is always
/// consistent at a step boundary.
#[derive(Debug, Clone)]
pub struct FlowIteration {
    alpha: f32,
    max_iterations: usize,
    epsilon: Option<f32>,
    border: BorderMode,
    gradients: Gradients,
    state: VelocityState,
    phase: Phase,
    iteration: usize,
    last_delta: Option<f32>,
}

impl FlowIteration {
    pub(crate) fn new(config: &HornSchunck, gradients: Gradients) -> Self {
        let (width, height) = gradients.dimensions();
        Self {
            alpha: config.alpha,
            max_iterations: config.iterations,
            epsilon: config.epsilon,
            border: config.border,
            gradients,
            state: VelocityState::zeros(width, height),
            phase: Phase::Initialized,
            iteration: 0,
            last_delta: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn last_delta(&self) -> Option<f32> {
        self.last_delta
    }

    pub fn gradients(&self) -> &Gradients {
        &self.gradients
    }

    /// Current horizontal estimate.
    pub fn u(&self) -> &Field {
        self.state.u()
    }

    /// Current vertical estimate.
    pub fn v(&self) -> &Field {
        self.state.v()
    }

    /// Apply one sweep to the entire field. No-op once terminal.
    pub fn step(&mut self) -> Phase {
        if self.phase.is_terminal() {
            return self.phase;
        }

        let delta = self.state.step(&self.gradients, self.alpha, self.border);
        self.iteration += 1;
        self.last_delta = Some(delta);
        trace!(iteration = self.iteration, delta, "horn-schunck sweep");

        self.phase = if self.epsilon.is_some_and(|eps| delta < eps) {
            Phase::Converged
        } else if self.iteration >= self.max_iterations {
            Phase::Exhausted
        } else {
            Phase::Iterating
        };
        self.phase
    }

    /// Step until terminal, then [`finish`](Self::finish).
    pub fn run(mut self) -> Result<FlowSolution> {
        while !self.phase.is_terminal() {
            self.step();
        }
        self.finish()
    }

    /// Hand the current field to the caller.
    ///
    /// Fails with [`VideoError::NonFinite`] if any velocity sample is NaN or
    /// infinite.
    pub fn finish(self) -> Result<FlowSolution> {
        let termination = match self.phase {
            Phase::Converged => Termination::Converged,
            Phase::Exhausted => Termination::Exhausted,
            Phase::Initialized | Phase::Iterating => Termination::Interrupted,
        };
        let iterations = self.iteration;
        let last_delta = self.last_delta;
        let flow = self.state.into_flow();

        if let Some((what, x, y)) = flow.first_non_finite() {
            warn!(what, x, y, iterations, "horn-schunck produced a non-finite velocity");
            return Err(VideoError::NonFinite { what, x, y });
        }

        debug!(
            iterations,
            ?termination,
            last_delta,
            "horn-schunck finished"
        );
        Ok(FlowSolution {
            flow,
            iterations,
            termination,
            last_delta,
        })
    }
}
