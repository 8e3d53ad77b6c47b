//! End-of-run accounting.

use serde::Serialize;
use std::path::PathBuf;

use crate::evaluation::EvaluationReport;

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// `current_epoch` reached `max_epochs`.
    EpochLimit,
    /// `global_iteration` exceeded `max_iterations`.
    IterationCap,
}

/// What a call to `run()` did. Timings are cumulative across resumed
/// sessions; iteration and epoch counts cover this session only.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub termination: Termination,
    pub epochs_completed: u32,
    pub final_epoch: u32,
    pub start_iteration: u64,
    pub global_iteration: u64,
    pub iterations_run: u64,
    pub train_seconds: f64,
    /// Optimizer steps covered by `train_seconds`.
    pub timed_iterations: u64,
    /// Completed epochs covered by `epoch_seconds`.
    pub timed_epochs: u32,
    /// Training time of completed epochs; excludes a truncated final epoch.
    pub epoch_seconds: f64,
    pub checkpoints: Vec<PathBuf>,
    pub reports: Vec<EvaluationReport>,
}

impl TrainingSummary {
    /// Mean training wall time per timed optimizer step.
    pub fn seconds_per_iteration(&self) -> Option<f64> {
        (self.timed_iterations > 0).then(|| self.train_seconds / self.timed_iterations as f64)
    }

    /// Mean training wall time per completed epoch.
    pub fn seconds_per_epoch(&self) -> Option<f64> {
        (self.timed_epochs > 0).then(|| self.epoch_seconds / f64::from(self.timed_epochs))
    }

    /// Report with the lowest validation loss.
    pub fn best_report(&self) -> Option<&EvaluationReport> {
        self.reports
            .iter()
            .min_by(|a, b| a.mean_loss.total_cmp(&b.mean_loss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::ScoreSummary;

    fn report(epoch: u32, mean_loss: f64) -> EvaluationReport {
        EvaluationReport {
            epoch,
            global_iteration: u64::from(epoch) * 10 + 1,
            samples: 4,
            mean_loss,
            scores: ScoreSummary::default(),
        }
    }

    fn summary() -> TrainingSummary {
        TrainingSummary {
            termination: Termination::EpochLimit,
            epochs_completed: 3,
            final_epoch: 4,
            start_iteration: 11,
            global_iteration: 41,
            iterations_run: 30,
            train_seconds: 20.0,
            timed_iterations: 40,
            timed_epochs: 4,
            epoch_seconds: 20.0,
            checkpoints: Vec::new(),
            reports: vec![report(1, 0.9), report(2, 0.4), report(3, 0.6)],
        }
    }

    #[test]
    fn test_rates() {
        let s = summary();
        assert_eq!(s.seconds_per_iteration(), Some(0.5));
        assert_eq!(s.seconds_per_epoch(), Some(5.0));
    }

    #[test]
    fn test_rates_without_progress() {
        let mut s = summary();
        s.timed_iterations = 0;
        s.timed_epochs = 0;
        assert_eq!(s.seconds_per_iteration(), None);
        assert_eq!(s.seconds_per_epoch(), None);
    }

    #[test]
    fn test_truncated_epoch_time_kept_out_of_epoch_rate() {
        let mut s = summary();
        s.termination = Termination::IterationCap;
        s.train_seconds = 23.0;
        s.timed_iterations = 46;
        assert_eq!(s.seconds_per_iteration(), Some(0.5));
        assert_eq!(s.seconds_per_epoch(), Some(5.0));
    }

    #[test]
    fn test_untimed_history_excluded() {
        // Resumed at iteration 11 from a checkpoint without stored time.
        let mut s = summary();
        s.train_seconds = 15.0;
        s.timed_iterations = 30;
        s.timed_epochs = 3;
        s.epoch_seconds = 15.0;
        assert_eq!(s.seconds_per_iteration(), Some(0.5));
        assert_eq!(s.seconds_per_epoch(), Some(5.0));
    }

    #[test]
    fn test_best_report() {
        assert_eq!(summary().best_report().map(|r| r.epoch), Some(2));
    }
}
