use std::fmt;
use thiserror::Error;

////////////////
// Loss terms //
////////////////

/// Identifies one term of the composite mapping objective
///
/// Used in error reporting and in the per-term loss breakdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LossTerm {
    /// Cosine similarity between predicted and observed voxel profiles
    VoxelSimilarity,
    /// Cosine similarity between predicted and observed gene profiles
    GeneSimilarity,
    /// KL divergence between the voxel density prior and the mapped density
    Density,
    /// Squared deviation of mapped cell counts from expected counts
    Count,
    /// Size-weighted negative entropy of cluster assignments
    ClusterEntropy,
    /// Deviation of the number of selected cells from the target count
    FilterCount,
    /// Pushes the cell filter towards binary values
    FilterRegulariser,
    /// Weighted sum of all active terms
    Total,
}

impl LossTerm {
    /// Name of the term as used in logs and error messages
    pub fn name(&self) -> &'static str {
        match self {
            LossTerm::VoxelSimilarity => "voxel_similarity",
            LossTerm::GeneSimilarity => "gene_similarity",
            LossTerm::Density => "density",
            LossTerm::Count => "count",
            LossTerm::ClusterEntropy => "cluster_entropy",
            LossTerm::FilterCount => "filter_count",
            LossTerm::FilterRegulariser => "filter_regulariser",
            LossTerm::Total => "total",
        }
    }
}

impl fmt::Display for LossTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

////////////
// Errors //
////////////

/// Errors raised while preparing or running a cell-to-space mapping
///
/// All variants are fatal for the run in which they occur. Failing to reach
/// a plateau within the epoch budget is not an error; see
/// `TerminalState::EpochBudgetExhausted`.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Two inputs that must agree along an axis do not
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    /// A cell carries a label that is not one of the declared clusters
    #[error("unknown cluster label '{label}'")]
    UnknownLabel { label: String },

    /// A declared cluster has no member cells
    #[error("cluster '{label}' has no member cells")]
    EmptyCluster { label: String },

    /// A denominator of a loss term is zero or not finite
    #[error(
        "numerical instability in {term}: zero or non-finite norm for {axis} {index}{}",
        epoch_suffix(.epoch)
    )]
    NumericalInstability {
        term: LossTerm,
        axis: &'static str,
        index: usize,
        epoch: Option<usize>,
    },

    /// The loss or its gradient became non-finite during training
    #[error("training diverged at epoch {epoch}: {term} is not finite")]
    Divergence { epoch: usize, term: LossTerm },

    /// Expression data or side information violates the input contract
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Parameters failed validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Chunk definitions are malformed
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
}

fn epoch_suffix(epoch: &Option<usize>) -> String {
    match epoch {
        Some(e) => format!(" (epoch {})", e),
        None => String::new(),
    }
}

impl MappingError {
    /// Attach the epoch at which a numerical instability surfaced
    ///
    /// Other variants are returned unchanged.
    pub fn at_epoch(self, epoch: usize) -> Self {
        match self {
            MappingError::NumericalInstability {
                term, axis, index, ..
            } => MappingError::NumericalInstability {
                term,
                axis,
                index,
                epoch: Some(epoch),
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_at_epoch_only_touches_instability() {
        let err = MappingError::NumericalInstability {
            term: LossTerm::VoxelSimilarity,
            axis: "voxel",
            index: 3,
            epoch: None,
        }
        .at_epoch(7);

        match err {
            MappingError::NumericalInstability { epoch, index, .. } => {
                assert_eq!(epoch, Some(7));
                assert_eq!(index, 3);
            }
            _ => panic!("Wrong variant"),
        }

        let err = MappingError::EmptyCluster {
            label: "T cells".to_string(),
        }
        .at_epoch(2);
        assert!(matches!(err, MappingError::EmptyCluster { .. }));
    }

    #[test]
    fn test_error_messages_carry_context() {
        let err = MappingError::NumericalInstability {
            term: LossTerm::GeneSimilarity,
            axis: "gene",
            index: 1,
            epoch: Some(12),
        };
        let msg = err.to_string();
        assert!(msg.contains("gene_similarity"));
        assert!(msg.contains("gene 1"));
        assert!(msg.contains("epoch 12"));

        let err = MappingError::Divergence {
            epoch: 4,
            term: LossTerm::Total,
        };
        assert_eq!(err.to_string(), "training diverged at epoch 4: total is not finite");
    }
}
