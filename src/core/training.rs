use faer::Mat;
use log::{debug, info, warn};
use std::time::Instant;

use crate::core::assignment::AssignmentParams;
use crate::core::diagnostics::{mapping_entropy, GeneScore};
use crate::core::errors::{LossTerm, MappingError};
use crate::core::objective::{LossBreakdown, Objective};
use crate::core::optimiser::{Adam, AdamConfig};
use crate::core::params::MapperParams;

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Phase of a training run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingPhase {
    /// Parameters seeded, no epoch run yet
    Initialized,
    /// At least one epoch done, no stop condition reached
    Training,
    /// Loss plateau detected
    Converged,
    /// Epoch budget used up or the caller asked to stop
    EpochBudgetExhausted,
    /// Final assignment computed
    Finalized,
}

/// How a finished run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalState {
    Converged,
    EpochBudgetExhausted,
}

/// Diagnostics of one training run
///
/// ### Fields
///
/// * `loss_history` - Composite loss per epoch, evaluated before that
///   epoch's update (with the annealed weights of that epoch)
/// * `terminal_state` - Whether a plateau was detected
/// * `final_terms` - Every term at the final parameters, full weights
/// * `final_loss` - Composite loss at the final parameters, full weights
/// * `epochs_run` - Number of parameter updates applied
/// * `stopped_by_caller` - The cancellation flag or deadline ended the run
/// * `gene_scores` - Per-gene agreement of prediction and spatial data.
///   Needs the unprepared matrices, so it is filled in by `SpatialMapper`
///   and left empty for partition runs.
/// * `mapping_entropy` - Entropy of every row of the final assignment
#[derive(Clone, Debug)]
pub struct TrainingDiagnostics {
    pub loss_history: Vec<f64>,
    pub terminal_state: TerminalState,
    pub final_terms: LossBreakdown,
    pub final_loss: f64,
    pub epochs_run: usize,
    pub stopped_by_caller: bool,
    pub gene_scores: Vec<GeneScore>,
    pub mapping_entropy: Vec<f64>,
}

/// Output of a finished training run
///
/// ### Fields
///
/// * `assignment` - Final rows × voxels assignment matrix
/// * `filter` - Final cell filter in constrained mode
/// * `prediction` - Predicted spatial profiles under the final assignment
/// * `diagnostics` - The `TrainingDiagnostics`
#[derive(Clone, Debug)]
pub struct TrainingOutcome {
    pub assignment: Mat<f64>,
    pub filter: Option<Vec<f64>>,
    pub prediction: Mat<f64>,
    pub diagnostics: TrainingDiagnostics,
}

/// State owned by one run and dropped with it
struct TrainingState {
    assignment: AssignmentParams,
    optimiser: Adam,
    loss_history: Vec<f64>,
    best_loss: f64,
    stale_epochs: usize,
    epoch: usize,
    stopped_by_caller: bool,
}

///////////////////
// Training loop //
///////////////////

/// Gradient based optimisation of the assignment matrix
///
/// Runs Adam on the assignment logits (and filter logits in constrained
/// mode). Every epoch evaluates the composite loss with the annealed
/// weights, back-propagates and updates. Stops on a loss plateau, when the
/// epoch budget is used up, or when the caller's stop signal fires between
/// epochs. A non-finite loss or gradient aborts the run.
///
/// ### Fields
///
/// * `objective` - The prepared objective, read-only
/// * `params` - The run parameters
/// * `state` - Parameters, optimiser moments and bookkeeping
/// * `phase` - Current `TrainingPhase`
pub struct TrainingLoop<'a> {
    objective: &'a Objective,
    params: &'a MapperParams,
    state: TrainingState,
    phase: TrainingPhase,
}

impl<'a> TrainingLoop<'a> {
    /// Create a new training loop and seed the parameters
    ///
    /// ### Params
    ///
    /// * `objective` - The prepared objective
    /// * `params` - The run parameters
    ///
    /// ### Returns
    ///
    /// The `TrainingLoop` in `TrainingPhase::Initialized`.
    pub fn new(objective: &'a Objective, params: &'a MapperParams) -> Result<Self, MappingError> {
        params.validate()?;

        let (n_rows, n_voxels) = objective.shape();
        let with_filter = objective.uses_filter();
        let assignment =
            AssignmentParams::new(n_rows, n_voxels, with_filter, params.init, params.seed);
        let optimiser = Adam::new(
            n_rows * n_voxels,
            with_filter.then_some(n_rows),
            AdamConfig::default(),
        );

        Ok(Self {
            objective,
            params,
            state: TrainingState {
                assignment,
                optimiser,
                loss_history: Vec::with_capacity(params.n_epochs),
                best_loss: f64::INFINITY,
                stale_epochs: 0,
                epoch: 0,
                stopped_by_caller: false,
            },
            phase: TrainingPhase::Initialized,
        })
    }

    /// Current phase
    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    /// Loss per completed epoch
    pub fn loss_history(&self) -> &[f64] {
        &self.state.loss_history
    }

    /// Is the run in a terminal phase
    pub fn is_finished(&self) -> bool {
        matches!(
            self.phase,
            TrainingPhase::Converged | TrainingPhase::EpochBudgetExhausted | TrainingPhase::Finalized
        )
    }

    /// Run one epoch
    ///
    /// Does nothing once the run reached a terminal phase.
    ///
    /// ### Returns
    ///
    /// The phase after the epoch.
    pub fn step(&mut self) -> Result<TrainingPhase, MappingError> {
        if self.is_finished() {
            return Ok(self.phase);
        }

        let epoch = self.state.epoch;
        if epoch >= self.params.n_epochs {
            self.phase = TrainingPhase::EpochBudgetExhausted;
            return Ok(self.phase);
        }
        if self.params.stop.should_stop() {
            self.state.stopped_by_caller = true;
            self.phase = TrainingPhase::EpochBudgetExhausted;
            info!("Stop requested by caller before epoch {}", epoch);
            return Ok(self.phase);
        }

        let anneal_factor = self
            .params
            .annealing
            .map(|a| a.factor(epoch))
            .unwrap_or(1.0);
        let weights = self.params.weights.annealed(anneal_factor);

        let (m, log_m) = self.state.assignment.probabilities();
        let filter = self.state.assignment.filter();
        let (breakdown, grad) = {
            let eval = self
                .objective
                .evaluate(m.as_ref(), log_m.as_ref(), filter.as_deref(), &weights)
                .map_err(|e| e.at_epoch(epoch))?;
            if let Some(term) = eval.breakdown.first_non_finite() {
                return Err(MappingError::Divergence { epoch, term });
            }
            let grad = eval.gradient();
            (eval.breakdown, grad)
        };
        if !grad.is_finite() {
            return Err(MappingError::Divergence {
                epoch,
                term: LossTerm::Total,
            });
        }

        let loss = breakdown.total;
        self.state.loss_history.push(loss);

        let (logits, filter_logits) = self.state.assignment.buffers_mut();
        self.state.optimiser.step(
            logits,
            &grad.logits,
            filter_logits,
            grad.filter.as_deref(),
            self.params.learning_rate,
        );
        self.state.epoch += 1;

        if self.params.verbose
            && self.params.print_every > 0
            && epoch % self.params.print_every == 0
        {
            info!(
                "Epoch {}: loss = {:.6} (voxel similarity = {:.6}, density = {:.6})",
                epoch, loss, breakdown.voxel_similarity, breakdown.density
            );
        } else {
            debug!("Epoch {}: loss = {:.6}", epoch, loss);
        }

        self.phase = TrainingPhase::Training;

        if let Some(es) = &self.params.early_stopping {
            let warm = self
                .params
                .annealing
                .map(|a| a.is_warm(epoch))
                .unwrap_or(true);
            if warm {
                if loss < self.state.best_loss - es.min_delta {
                    self.state.best_loss = loss;
                    self.state.stale_epochs = 0;
                } else {
                    self.state.stale_epochs += 1;
                }
                if self.state.stale_epochs >= es.patience {
                    if self.params.verbose {
                        info!("Converged after {} epochs", self.state.epoch);
                    }
                    self.phase = TrainingPhase::Converged;
                }
            }
        }

        Ok(self.phase)
    }

    /// Run until a terminal phase is reached and finalise
    ///
    /// ### Returns
    ///
    /// The `TrainingOutcome`.
    pub fn run(mut self) -> Result<TrainingOutcome, MappingError> {
        let start = Instant::now();
        while !self.is_finished() {
            self.step()?;
        }

        if self.phase == TrainingPhase::EpochBudgetExhausted
            && !self.state.stopped_by_caller
            && self.params.early_stopping.is_some()
        {
            warn!("Mapping did not converge after {} epochs", self.state.epoch);
        }
        if self.params.verbose {
            info!(
                "Training finished after {} epochs in {:.2}s",
                self.state.epoch,
                start.elapsed().as_secs_f64()
            );
        }

        self.finalise()
    }

    /// Compute the final assignment from the last parameters
    fn finalise(mut self) -> Result<TrainingOutcome, MappingError> {
        let terminal_state = match self.phase {
            TrainingPhase::Converged => TerminalState::Converged,
            _ => TerminalState::EpochBudgetExhausted,
        };
        let epoch = self.state.epoch;

        let (m, log_m) = self.state.assignment.probabilities();
        let filter = self.state.assignment.filter();
        let (final_terms, prediction) = {
            let eval = self
                .objective
                .evaluate(
                    m.as_ref(),
                    log_m.as_ref(),
                    filter.as_deref(),
                    &self.params.weights,
                )
                .map_err(|e| e.at_epoch(epoch))?;
            if let Some(term) = eval.breakdown.first_non_finite() {
                return Err(MappingError::Divergence { epoch, term });
            }
            (eval.breakdown.clone(), eval.prediction().to_owned())
        };

        let mapping_entropy = mapping_entropy(m.as_ref());

        self.phase = TrainingPhase::Finalized;

        Ok(TrainingOutcome {
            assignment: m,
            filter,
            prediction,
            diagnostics: TrainingDiagnostics {
                loss_history: self.state.loss_history,
                terminal_state,
                final_loss: final_terms.total,
                final_terms,
                epochs_run: epoch,
                stopped_by_caller: self.state.stopped_by_caller,
                gene_scores: Vec::new(),
                mapping_entropy,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::objective::*;
    use crate::core::params::*;
    use faer::{mat, MatRef};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn toy_objective(source: MatRef<f64>, target: MatRef<f64>, kind: ObjectiveKind) -> Objective {
        let priors = SpatialPriors::default();
        let src = prepare_source(source, vec![1.0; source.nrows()], None).unwrap();
        let tgt = prepare_target(source, target, &priors).unwrap();
        Objective::new(Arc::new(src), tgt, kind).unwrap()
    }

    fn scenario() -> Objective {
        let source = mat![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 0.0, 1.0]
        ];
        let target = mat![[1.0, 0.5, 0.0], [0.0, 0.5, 1.0]];
        toy_objective(source.as_ref(), target.as_ref(), ObjectiveKind::Cells)
    }

    #[test]
    fn test_end_to_end_scenario() {
        let obj = scenario();
        let params = MapperParams {
            n_epochs: 200,
            seed: 7,
            ..Default::default()
        };
        let outcome = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        let hist = &outcome.diagnostics.loss_history;

        assert!(!hist.is_empty());
        assert!(hist.last().unwrap() < &hist[0]);
        assert!(outcome.diagnostics.final_loss < hist[0]);
        assert!(
            outcome.assignment[(3, 1)] > 0.6,
            "Cell 4 mapped to voxel 2 with {}",
            outcome.assignment[(3, 1)]
        );
        assert!(outcome.assignment[(0, 0)] > 0.5);
        assert!(outcome.diagnostics.gene_scores.is_empty());
        assert_eq!(outcome.prediction.nrows(), 2);
        assert_eq!(outcome.diagnostics.mapping_entropy.len(), 4);

        for i in 0..4 {
            let sum: f64 = outcome.assignment.row(i).iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            for j in 0..2 {
                assert!((0.0..=1.0).contains(&outcome.assignment[(i, j)]));
            }
        }
    }

    #[test]
    fn test_determinism() {
        let obj = scenario();
        let params = MapperParams {
            n_epochs: 50,
            seed: 99,
            init: InitStrategy::Normal,
            ..Default::default()
        };
        let a = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        let b = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        assert_eq!(a.diagnostics.loss_history, b.diagnostics.loss_history);
        assert_eq!(a.assignment, b.assignment);
    }

    #[test]
    fn test_expression_only_history_matches_voxel_term() {
        let obj = scenario();
        let params = MapperParams {
            n_epochs: 20,
            weights: LossWeights::expression_only(),
            early_stopping: None,
            ..Default::default()
        };
        let mut tl = TrainingLoop::new(&obj, &params).unwrap();
        let mut shadow = AssignmentParams::new(4, 2, false, params.init, params.seed);
        let mut adam = Adam::new(8, None, AdamConfig::default());

        for _ in 0..20 {
            let (m, log_m) = shadow.probabilities();
            let eval = obj
                .evaluate(m.as_ref(), log_m.as_ref(), None, &params.weights)
                .unwrap();
            let voxel = eval.breakdown.voxel_similarity;
            let grad = eval.gradient();
            drop(eval);

            tl.step().unwrap();
            assert!((tl.loss_history().last().unwrap() - voxel).abs() < 1e-12);

            let (logits, _) = shadow.buffers_mut();
            adam.step(logits, &grad.logits, None, None, params.learning_rate);
        }
    }

    #[test]
    fn test_phases_and_budget() {
        let obj = scenario();
        let params = MapperParams {
            n_epochs: 3,
            early_stopping: None,
            ..Default::default()
        };
        let mut tl = TrainingLoop::new(&obj, &params).unwrap();
        assert_eq!(tl.phase(), TrainingPhase::Initialized);
        assert_eq!(tl.step().unwrap(), TrainingPhase::Training);
        tl.step().unwrap();
        tl.step().unwrap();
        assert_eq!(tl.step().unwrap(), TrainingPhase::EpochBudgetExhausted);
        // terminal phases are sticky
        assert_eq!(tl.step().unwrap(), TrainingPhase::EpochBudgetExhausted);

        let outcome = tl.run().unwrap();
        assert_eq!(
            outcome.diagnostics.terminal_state,
            TerminalState::EpochBudgetExhausted
        );
        assert_eq!(outcome.diagnostics.epochs_run, 3);
        assert_eq!(outcome.diagnostics.loss_history.len(), 3);
        assert!(!outcome.diagnostics.stopped_by_caller);
    }

    #[test]
    fn test_early_stopping_converges() {
        // one voxel: the voxel loss is constant, so no epoch improves
        let source = mat![[1.0, 0.0], [0.0, 1.0]];
        let target = mat![[1.0, 1.0]];
        let obj = toy_objective(source.as_ref(), target.as_ref(), ObjectiveKind::Cells);
        let params = MapperParams {
            n_epochs: 500,
            early_stopping: Some(EarlyStopping {
                patience: 5,
                min_delta: 1e-9,
            }),
            ..Default::default()
        };
        let outcome = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        assert_eq!(outcome.diagnostics.terminal_state, TerminalState::Converged);
        assert_eq!(outcome.diagnostics.epochs_run, 6);
    }

    #[test]
    fn test_annealing_delays_early_stopping() {
        let source = mat![[1.0, 0.0], [0.0, 1.0]];
        let target = mat![[1.0, 1.0]];
        let obj = toy_objective(source.as_ref(), target.as_ref(), ObjectiveKind::Cells);
        let params = MapperParams {
            n_epochs: 500,
            annealing: Some(Annealing { warmup_epochs: 20 }),
            early_stopping: Some(EarlyStopping {
                patience: 5,
                min_delta: 1e-9,
            }),
            ..Default::default()
        };
        let outcome = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        assert_eq!(outcome.diagnostics.terminal_state, TerminalState::Converged);
        assert!(outcome.diagnostics.epochs_run >= 20);
    }

    #[test]
    fn test_cancellation_is_checked_between_epochs() {
        let obj = scenario();
        let flag = Arc::new(AtomicBool::new(false));
        let params = MapperParams {
            n_epochs: 100,
            early_stopping: None,
            stop: StopSignal::with_flag(flag.clone()),
            ..Default::default()
        };
        let mut tl = TrainingLoop::new(&obj, &params).unwrap();
        for _ in 0..4 {
            tl.step().unwrap();
        }
        flag.store(true, std::sync::atomic::Ordering::Relaxed);
        let outcome = tl.run().unwrap();

        assert_eq!(outcome.diagnostics.epochs_run, 4);
        assert!(outcome.diagnostics.stopped_by_caller);
        assert_eq!(
            outcome.diagnostics.terminal_state,
            TerminalState::EpochBudgetExhausted
        );
    }

    #[test]
    fn test_divergence_is_fatal() {
        let obj = scenario();
        let params = MapperParams {
            n_epochs: 5,
            learning_rate: 1e308,
            init: InitStrategy::Normal,
            early_stopping: None,
            ..Default::default()
        };
        match TrainingLoop::new(&obj, &params).unwrap().run() {
            Err(MappingError::Divergence { epoch, .. }) => assert!(epoch >= 1),
            Err(MappingError::NumericalInstability { epoch, .. }) => assert!(epoch.is_some()),
            other => panic!("Expected the run to abort, got {:?}", other.map(|o| o.assignment)),
        }
    }

    #[test]
    fn test_constrained_mode_moves_filter_towards_target() {
        let source = mat![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [0.5, 0.0, 0.5],
            [0.0, 0.3, 1.0]
        ];
        let target = mat![[1.0, 0.5, 0.0], [0.0, 0.5, 1.0]];
        let obj = toy_objective(
            source.as_ref(),
            target.as_ref(),
            ObjectiveKind::Constrained { target_count: 2.0 },
        );
        let params = MapperParams {
            n_epochs: 300,
            early_stopping: None,
            ..Default::default()
        };
        let outcome = TrainingLoop::new(&obj, &params).unwrap().run().unwrap();
        let filter = outcome.filter.unwrap();
        let selected: f64 = filter.iter().sum();

        assert_eq!(filter.len(), 6);
        assert!(filter.iter().all(|f| (0.0..=1.0).contains(f)));
        assert!((selected - 2.0).abs() < 0.75, "Selected {} cells", selected);
    }
}
