use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::core::errors::MappingError;

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Initialisation strategy for the assignment logits
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InitStrategy {
    /// All logits zero, i.e., a uniform initial assignment
    Zeros,
    /// Logits drawn uniformly from `[0, 1)`
    Uniform,
    /// Logits drawn from a standard normal
    Normal,
}

/// Weights of the individual loss terms
///
/// The voxel expression similarity term is always active with weight `1`.
/// Every other term is disabled by setting its weight to `0`.
///
/// ### Fields
///
/// * `gene_similarity` - Weight of the gene-wise cosine similarity term.
///   Default `0.0`.
/// * `density` - Weight of the KL divergence between the voxel density prior
///   and the mapped cell density. Default `1.0`.
/// * `count` - Weight of the per-voxel cell count term. Only active when
///   expected counts are supplied. Default `1.0`.
/// * `cluster_entropy` - Weight of the size-scaled cluster entropy term. Only
///   active in cluster mode. Default `0.1`.
/// * `filter_count` - Weight of the selected-cell-count term. Only active in
///   constrained mode. Default `1.0`.
/// * `filter_regulariser` - Weight of the term pushing the cell filter to
///   binary values. Only active in constrained mode. Default `1.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct LossWeights {
    pub gene_similarity: f64,
    pub density: f64,
    pub count: f64,
    pub cluster_entropy: f64,
    pub filter_count: f64,
    pub filter_regulariser: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            gene_similarity: 0.0,
            density: 1.0,
            count: 1.0,
            cluster_entropy: 0.1,
            filter_count: 1.0,
            filter_regulariser: 1.0,
        }
    }
}

impl LossWeights {
    /// Only the voxel similarity term
    pub fn expression_only() -> Self {
        Self {
            gene_similarity: 0.0,
            density: 0.0,
            count: 0.0,
            cluster_entropy: 0.0,
            filter_count: 0.0,
            filter_regulariser: 0.0,
        }
    }

    /// Scale the regularisation weights by an annealing factor
    ///
    /// The gene similarity term compares expression and is not annealed.
    pub fn annealed(&self, factor: f64) -> Self {
        Self {
            gene_similarity: self.gene_similarity,
            density: self.density * factor,
            count: self.count * factor,
            cluster_entropy: self.cluster_entropy * factor,
            filter_count: self.filter_count * factor,
            filter_regulariser: self.filter_regulariser * factor,
        }
    }

    fn validate(&self) -> Result<(), MappingError> {
        let all = [
            ("gene_similarity", self.gene_similarity),
            ("density", self.density),
            ("count", self.count),
            ("cluster_entropy", self.cluster_entropy),
            ("filter_count", self.filter_count),
            ("filter_regulariser", self.filter_regulariser),
        ];
        for (name, w) in all {
            if !(w.is_finite() && w >= 0.0) {
                return Err(MappingError::InvalidConfig(format!(
                    "loss weight '{}' must be a non-negative finite number, got {}",
                    name, w
                )));
            }
        }
        Ok(())
    }
}

/// Linear warm-up of the regularisation weights
///
/// ### Fields
///
/// * `warmup_epochs` - Number of epochs over which the regularisation weights
///   ramp from `1 / warmup_epochs` of their value to the full value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Annealing {
    pub warmup_epochs: usize,
}

impl Annealing {
    /// Factor applied to the regularisation weights at a given epoch
    pub fn factor(&self, epoch: usize) -> f64 {
        if self.warmup_epochs == 0 {
            return 1.0;
        }
        ((epoch + 1) as f64 / self.warmup_epochs as f64).min(1.0)
    }

    /// Whether the ramp is finished at the given epoch
    pub fn is_warm(&self, epoch: usize) -> bool {
        epoch + 1 >= self.warmup_epochs
    }
}

/// Early stopping on a loss plateau
///
/// ### Fields
///
/// * `patience` - Number of consecutive epochs without improvement after
///   which training stops.
/// * `min_delta` - Minimum decrease of the loss that counts as improvement.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EarlyStopping {
    pub patience: usize,
    pub min_delta: f64,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self {
            patience: 50,
            min_delta: 1e-6,
        }
    }
}

/// Caller controlled stop conditions, checked between epochs
///
/// ### Fields
///
/// * `cancel` - Optional flag; once set to `true` the run stops before the
///   next epoch.
/// * `deadline` - Optional point in time after which no new epoch starts.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    pub cancel: Option<Arc<AtomicBool>>,
    pub deadline: Option<Instant>,
}

impl StopSignal {
    /// Stop signal driven by a shared cancellation flag
    pub fn with_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            cancel: Some(flag),
            deadline: None,
        }
    }

    /// Stop signal driven by a deadline
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancel: None,
            deadline: Some(deadline),
        }
    }

    /// Returns `true` if the caller asked the run to stop
    pub fn should_stop(&self) -> bool {
        let cancelled = self
            .cancel
            .as_ref()
            .map(|f| f.load(Ordering::Relaxed))
            .unwrap_or(false);
        let expired = self
            .deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(false);
        cancelled || expired
    }
}

/// Structure for the mapper parameters
///
/// ### Fields
///
/// **Optimisation**
///
/// * `n_epochs` - Maximum number of epochs. Default `1000`.
/// * `learning_rate` - Adam learning rate. Default `0.1`.
/// * `init` - How to initialise the logits. Default `Uniform`.
/// * `seed` - Seed for reproducibility. Default `42`.
///
/// **Loss**
///
/// * `weights` - The loss term weights, see `LossWeights`.
/// * `annealing` - Optional warm-up of the regularisation weights. Default
///   `None`.
/// * `early_stopping` - Optional plateau detection. Default patience `50`,
///   minimum delta `1e-6`.
///
/// **Run control**
///
/// * `stop` - Caller cancellation flag and/or deadline.
/// * `verbose` - Report progress at `info` level.
/// * `print_every` - Epoch interval of the progress reports.
#[derive(Clone, Debug)]
pub struct MapperParams {
    // optimisation
    pub n_epochs: usize,
    pub learning_rate: f64,
    pub init: InitStrategy,
    pub seed: u64,
    // loss
    pub weights: LossWeights,
    pub annealing: Option<Annealing>,
    pub early_stopping: Option<EarlyStopping>,
    // run control
    pub stop: StopSignal,
    pub verbose: bool,
    pub print_every: usize,
}

impl Default for MapperParams {
    fn default() -> Self {
        Self {
            n_epochs: 1000,
            learning_rate: 0.1,
            init: InitStrategy::Uniform,
            seed: 42,
            weights: LossWeights::default(),
            annealing: None,
            early_stopping: Some(EarlyStopping::default()),
            stop: StopSignal::default(),
            verbose: false,
            print_every: 100,
        }
    }
}

impl MapperParams {
    /// Check the parameters for consistency
    ///
    /// ### Returns
    ///
    /// `Ok(())` or an `InvalidConfig` error naming the offending parameter.
    pub fn validate(&self) -> Result<(), MappingError> {
        if self.n_epochs == 0 {
            return Err(MappingError::InvalidConfig(
                "n_epochs must be a positive integer".to_string(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(MappingError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if let Some(es) = &self.early_stopping {
            if es.patience == 0 {
                return Err(MappingError::InvalidConfig(
                    "early stopping patience must be at least 1".to_string(),
                ));
            }
            if !(es.min_delta.is_finite() && es.min_delta >= 0.0) {
                return Err(MappingError::InvalidConfig(format!(
                    "early stopping min_delta must be non-negative, got {}",
                    es.min_delta
                )));
            }
        }
        self.weights.validate()
    }
}
