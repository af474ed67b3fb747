//! Step history shared by the recurrent cells.
//!
//! A cell records one entry per forward call. Backward calls then consume
//! those entries newest first; once a backward sweep has started no new
//! steps may be recorded until the history is reset.

use ndarray::{stack, Array2, Axis};

use crate::error::{LayerError, Result};
use crate::utils::tensor::Tensor;

/// Where a recurrent cell is within its forward/backward sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    /// Recording forward steps.
    Forward,
    /// Backpropagating; `remaining` steps have not been visited yet.
    Backward { remaining: usize },
    /// Every recorded step has been backpropagated.
    Finished,
}

#[derive(Debug, Clone)]
pub(crate) struct StepHistory<T> {
    steps: Vec<T>,
    phase: SequencePhase,
}

impl<T> StepHistory<T> {
    pub(crate) fn new() -> Self {
        Self {
            steps: Vec::new(),
            phase: SequencePhase::Forward,
        }
    }

    pub(crate) fn phase(&self) -> SequencePhase {
        self.phase
    }

    pub(crate) fn len(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn last(&self) -> Option<&T> {
        self.steps.last()
    }

    pub(crate) fn steps(&self) -> &[T] {
        &self.steps
    }

    pub(crate) fn record(&mut self, layer: &str, step: T) -> Result<()> {
        if self.phase != SequencePhase::Forward {
            return Err(LayerError::order(
                layer,
                "forward called after the backward sweep started; reset the state first",
            ));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Index of the step the next backward call differentiates.
    pub(crate) fn pending(&self, layer: &str) -> Result<usize> {
        match self.phase {
            SequencePhase::Forward if self.steps.is_empty() => {
                Err(LayerError::NoForwardCache(layer.to_string()))
            }
            SequencePhase::Forward => Ok(self.steps.len() - 1),
            SequencePhase::Backward { remaining } => Ok(remaining - 1),
            SequencePhase::Finished => Err(LayerError::order(
                layer,
                "every recorded step has already been backpropagated",
            )),
        }
    }

    /// Mark step `t` (as returned by `pending`) as backpropagated.
    pub(crate) fn consume(&mut self, t: usize) {
        self.phase = if t == 0 {
            SequencePhase::Finished
        } else {
            SequencePhase::Backward { remaining: t }
        };
    }

    pub(crate) fn get(&self, t: usize) -> &T {
        &self.steps[t]
    }

    pub(crate) fn clear(&mut self) {
        self.steps.clear();
        self.phase = SequencePhase::Forward;
    }
}

/// Stack per-step `(n_ex, n_out)` matrices into `(n_ex, n_out, n_t)`.
pub(crate) fn stack_steps<'a, I>(per_step: I) -> Option<Tensor>
where
    I: IntoIterator<Item = &'a Array2<f64>>,
{
    let views: Vec<_> = per_step.into_iter().map(|a| a.view()).collect();
    if views.is_empty() {
        return None;
    }
    stack(Axis(2), &views).ok().map(|t| t.into_dyn())
}
