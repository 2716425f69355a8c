use faer::{Mat, MatRef};
use log::info;
use std::sync::Arc;
use std::time::Instant;

use crate::core::chunking::{run_chunked, ChunkParams, PartitionReport};
use crate::core::diagnostics::{gene_training_scores, mapping_entropy, GeneScore};
use crate::core::errors::MappingError;
use crate::core::objective::{
    prepare_source, prepare_target, Objective, ObjectiveKind, PreparedTarget, SpatialPriors,
};
use crate::core::params::MapperParams;
use crate::core::training::{TrainingDiagnostics, TrainingLoop};
use crate::ensure_ncols;
use crate::single_cell::cluster_aggregations::*;

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// What is mapped onto the voxels
#[derive(Clone, Debug)]
pub enum MappingMode {
    /// Every cell is mapped on its own
    Cells,
    /// Cluster mean profiles are mapped
    ///
    /// ### Fields
    ///
    /// * `labels` - Cluster label per cell
    /// * `expand_to_cells` - Return a cell level assignment as well
    /// * `member_weights` - Optional positive weight per cell for the
    ///   expansion
    Clusters {
        labels: ClusterLabels,
        expand_to_cells: bool,
        member_weights: Option<Vec<f64>>,
    },
    /// Cells are mapped and a soft filter selects `target_count` of them
    Constrained { target_count: usize },
}

impl MappingMode {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            MappingMode::Cells => "cells",
            MappingMode::Clusters { .. } => "clusters",
            MappingMode::Constrained { .. } => "constrained",
        }
    }

    fn objective_kind(&self) -> ObjectiveKind {
        match self {
            MappingMode::Cells => ObjectiveKind::Cells,
            MappingMode::Clusters { .. } => ObjectiveKind::Clusters,
            MappingMode::Constrained { target_count } => ObjectiveKind::Constrained {
                target_count: *target_count as f64,
            },
        }
    }
}

/// Result of a mapping run
///
/// ### Fields
///
/// * `assignment` - Cells × voxels; clusters × voxels in cluster mode
///   without expansion. Rows sum to one.
/// * `cluster_assignment` - Clusters × voxels, cluster mode only
/// * `cluster_names` - Cluster names in row order, cluster mode only
/// * `cell_mass` - Mass per cell after expansion
/// * `filter` - Per-cell filter values in `[0, 1]`, constrained mode only
/// * `diagnostics` - The `TrainingDiagnostics`
#[derive(Clone, Debug)]
pub struct MappingResult {
    pub assignment: Mat<f64>,
    pub cluster_assignment: Option<Mat<f64>>,
    pub cluster_names: Option<Vec<String>>,
    pub cell_mass: Option<Vec<f64>>,
    pub filter: Option<Vec<f64>>,
    pub diagnostics: TrainingDiagnostics,
}

/// Result of a chunked mapping run
///
/// ### Fields
///
/// * `assignment` - See `MappingResult`
/// * `cluster_assignment` - See `MappingResult`
/// * `cluster_names` - See `MappingResult`
/// * `cell_mass` - See `MappingResult`
/// * `gene_scores` - Gene scores of the reassembled assignment
/// * `mapping_entropy` - Row entropies of the reassembled assignment
/// * `partitions` - Per partition reports
#[derive(Clone, Debug)]
pub struct ChunkedMappingResult {
    pub assignment: Mat<f64>,
    pub cluster_assignment: Option<Mat<f64>>,
    pub cluster_names: Option<Vec<String>>,
    pub cell_mass: Option<Vec<f64>>,
    pub gene_scores: Vec<GeneScore>,
    pub mapping_entropy: Vec<f64>,
    pub partitions: Vec<PartitionReport>,
}

/// Row level assignment turned into the requested output level
struct ExpandedAssignment {
    assignment: Mat<f64>,
    cluster_assignment: Option<Mat<f64>>,
    cell_mass: Option<Vec<f64>>,
}

////////////
// Mapper //
////////////

/// Maps single cell profiles onto spatial voxels
///
/// Borrows both expression matrices; nothing is mutated. The mode is
/// resolved once into a `SourceAggregator` at construction.
///
/// ### Fields
///
/// * `source` - Cells × genes expression
/// * `target` - Voxels × genes expression on the same gene axis
/// * `mode` - The `MappingMode`
/// * `aggregator` - Row builder for the mode
/// * `priors` - Optional spatial side information
/// * `params` - Run parameters
pub struct SpatialMapper<'a> {
    source: MatRef<'a, f64>,
    target: MatRef<'a, f64>,
    mode: MappingMode,
    aggregator: Box<dyn SourceAggregator>,
    priors: SpatialPriors,
    params: MapperParams,
}

impl<'a> SpatialMapper<'a> {
    /// Generate a new mapper
    ///
    /// ### Params
    ///
    /// * `source` - Cells × genes expression
    /// * `target` - Voxels × genes expression
    /// * `mode` - The `MappingMode`
    /// * `priors` - Spatial side information
    /// * `params` - Run parameters
    ///
    /// ### Returns
    ///
    /// The `SpatialMapper`, or an error for inconsistent inputs.
    pub fn new(
        source: MatRef<'a, f64>,
        target: MatRef<'a, f64>,
        mode: MappingMode,
        priors: SpatialPriors,
        params: MapperParams,
    ) -> Result<Self, MappingError> {
        params.validate()?;
        ensure_ncols!(source, target, "gene axis of spatial data");
        if source.nrows() == 0 || target.nrows() == 0 || source.ncols() == 0 {
            return Err(MappingError::InvalidInput(
                "expression matrices must not be empty".to_string(),
            ));
        }

        let aggregator: Box<dyn SourceAggregator> = match &mode {
            MappingMode::Cells => Box::new(IdentityAggregator),
            MappingMode::Constrained { target_count } => {
                if *target_count == 0 || *target_count > source.nrows() {
                    return Err(MappingError::InvalidConfig(format!(
                        "target cell count must be between 1 and {}, got {}",
                        source.nrows(),
                        target_count
                    )));
                }
                Box::new(IdentityAggregator)
            }
            MappingMode::Clusters { labels, .. } => {
                labels.memberships(source.nrows())?;
                Box::new(ClusterAggregator {
                    labels: labels.clone(),
                })
            }
        };

        Ok(Self {
            source,
            target,
            mode,
            aggregator,
            priors,
            params,
        })
    }

    /// Aggregate the source and build the objective inputs
    fn prepare(&self) -> Result<(Objective, Option<Vec<String>>), MappingError> {
        let aggregated = self.aggregator.aggregate(self.source)?;
        let source = prepare_source(
            aggregated.profiles.as_ref(),
            aggregated.sizes,
            self.priors.gene_weights.as_deref(),
        )?;
        let target = prepare_target(self.source, self.target, &self.priors)?;
        let objective = Objective::new(Arc::new(source), target, self.mode.objective_kind())?;

        Ok((objective, aggregated.names))
    }

    /// Turn the row level assignment into the requested output
    fn expand(&self, rows: Mat<f64>) -> Result<ExpandedAssignment, MappingError> {
        match &self.mode {
            MappingMode::Clusters {
                expand_to_cells: true,
                member_weights,
                ..
            } => {
                let expansion = self
                    .aggregator
                    .expand(rows.as_ref(), member_weights.as_deref())?;
                Ok(ExpandedAssignment {
                    assignment: expansion.assignment,
                    cluster_assignment: Some(rows),
                    cell_mass: Some(expansion.mass),
                })
            }
            MappingMode::Clusters { .. } => Ok(ExpandedAssignment {
                assignment: rows.clone(),
                cluster_assignment: Some(rows),
                cell_mass: None,
            }),
            _ => Ok(ExpandedAssignment {
                assignment: rows,
                cluster_assignment: None,
                cell_mass: None,
            }),
        }
    }

    /// Gene scores against the supplied matrices
    fn gene_scores(&self, prediction: MatRef<f64>, target: &PreparedTarget) -> Vec<GeneScore> {
        gene_training_scores(
            prediction,
            target.profiles.as_ref(),
            self.source,
            self.target,
        )
    }

    /// Run the mapping
    ///
    /// ### Returns
    ///
    /// The `MappingResult`.
    pub fn fit(&self) -> Result<MappingResult, MappingError> {
        let start = Instant::now();
        if self.params.verbose {
            info!(
                "Mapping {} cells onto {} voxels ({} mode)",
                self.source.nrows(),
                self.target.nrows(),
                self.mode.name()
            );
        }

        let (objective, cluster_names) = self.prepare()?;
        let outcome = TrainingLoop::new(&objective, &self.params)?.run()?;

        let mut diagnostics = outcome.diagnostics;
        diagnostics.gene_scores = self.gene_scores(outcome.prediction.as_ref(), objective.target());
        let expanded = self.expand(outcome.assignment)?;

        if self.params.verbose {
            info!(
                "Mapping done in {:.2}s, final loss = {:.6}",
                start.elapsed().as_secs_f64(),
                diagnostics.final_loss
            );
        }

        Ok(MappingResult {
            assignment: expanded.assignment,
            cluster_assignment: expanded.cluster_assignment,
            cluster_names,
            cell_mass: expanded.cell_mass,
            filter: outcome.filter,
            diagnostics,
        })
    }

    /// Run the mapping in voxel partitions
    ///
    /// Each partition is trained on its own and the results are stitched
    /// together; see `core::chunking`. Not available in constrained mode.
    ///
    /// ### Params
    ///
    /// * `chunking` - The `ChunkParams`
    ///
    /// ### Returns
    ///
    /// The `ChunkedMappingResult`.
    pub fn fit_chunked(&self, chunking: &ChunkParams) -> Result<ChunkedMappingResult, MappingError> {
        if self.params.verbose {
            info!(
                "Mapping {} cells onto {} voxels in chunks ({} mode)",
                self.source.nrows(),
                self.target.nrows(),
                self.mode.name()
            );
        }

        let aggregated = self.aggregator.aggregate(self.source)?;
        let source = Arc::new(prepare_source(
            aggregated.profiles.as_ref(),
            aggregated.sizes,
            self.priors.gene_weights.as_deref(),
        )?);
        let target = prepare_target(self.source, self.target, &self.priors)?;

        let chunked = run_chunked(
            source,
            &target,
            &self.mode.objective_kind(),
            &self.params,
            chunking,
        )?;

        let gene_scores = self.gene_scores(chunked.prediction.as_ref(), &target);
        let entropy = mapping_entropy(chunked.assignment.as_ref());
        let expanded = self.expand(chunked.assignment)?;

        Ok(ChunkedMappingResult {
            assignment: expanded.assignment,
            cluster_assignment: expanded.cluster_assignment,
            cluster_names: aggregated.names,
            cell_mass: expanded.cell_mass,
            gene_scores,
            mapping_entropy: entropy,
            partitions: chunked.partitions,
        })
    }
}
