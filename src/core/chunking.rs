//! Chunked execution: the voxels are split into disjoint partitions, every
//! partition is mapped independently and the partial assignments are
//! stitched back together with affinity based partition weights. This is an
//! approximation of the joint problem, not an exact decomposition.

use faer::Mat;
use log::info;
use rayon::prelude::*;
use std::sync::Arc;

use crate::core::errors::MappingError;
use crate::core::objective::{Objective, ObjectiveKind, PreparedSource, PreparedTarget};
use crate::core::params::MapperParams;
use crate::core::training::{TrainingDiagnostics, TrainingLoop};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// One group of voxels mapped on its own
///
/// ### Fields
///
/// * `voxels` - Voxel indices of the partition
/// * `rows` - Optional subset of source rows mapped onto this partition.
///   Only allowed in cell mode. `None` maps every row.
#[derive(Clone, Debug, PartialEq)]
pub struct VoxelPartition {
    pub voxels: Vec<usize>,
    pub rows: Option<Vec<usize>>,
}

/// How to split the voxels
#[derive(Clone, Debug, PartialEq)]
pub enum ChunkStrategy {
    /// Number of contiguous partitions of near equal size
    Count(usize),
    /// Maximum number of voxels per contiguous partition
    Size(usize),
    /// Caller defined partitions
    Explicit(Vec<VoxelPartition>),
}

/// Chunked execution parameters
///
/// ### Fields
///
/// * `strategy` - The `ChunkStrategy`
/// * `parallel` - Run the partitions on the rayon pool
#[derive(Clone, Debug)]
pub struct ChunkParams {
    pub strategy: ChunkStrategy,
    pub parallel: bool,
}

/// Outcome of one partition
///
/// ### Fields
///
/// * `partition` - The resolved partition (rows always filled in)
/// * `seed` - Seed used for this partition
/// * `diagnostics` - Training diagnostics of the partition run
#[derive(Clone, Debug)]
pub struct PartitionReport {
    pub partition: VoxelPartition,
    pub seed: u64,
    pub diagnostics: TrainingDiagnostics,
}

/// Reassembled result of a chunked run
///
/// ### Fields
///
/// * `assignment` - Full width rows × voxels assignment; rows sum to one
/// * `prediction` - Predicted profiles from the reassembled assignment
/// * `partitions` - One report per partition, in partition order
#[derive(Clone, Debug)]
pub struct ChunkedAssignment {
    pub assignment: Mat<f64>,
    pub prediction: Mat<f64>,
    pub partitions: Vec<PartitionReport>,
}

/// Partial result of a single partition before reassembly
struct PartitionRun {
    rows: Vec<usize>,
    voxels: Vec<usize>,
    assignment: Mat<f64>,
    affinity: Vec<f64>,
    report: PartitionReport,
}

////////////////
// Partitions //
////////////////

/// Resolve and validate the partitions
///
/// ### Params
///
/// * `strategy` - The `ChunkStrategy`
/// * `n_voxels` - Number of voxels
/// * `n_rows` - Number of source rows
/// * `rows_allowed` - Whether partitions may restrict the source rows
///
/// ### Returns
///
/// The partitions with their rows filled in, or `InvalidPartition`.
pub fn resolve_partitions(
    strategy: &ChunkStrategy,
    n_voxels: usize,
    n_rows: usize,
    rows_allowed: bool,
) -> Result<Vec<VoxelPartition>, MappingError> {
    let contiguous = |size: usize| -> Vec<VoxelPartition> {
        (0..n_voxels)
            .step_by(size)
            .map(|start| VoxelPartition {
                voxels: (start..(start + size).min(n_voxels)).collect(),
                rows: Some((0..n_rows).collect()),
            })
            .collect()
    };

    let partitions = match strategy {
        ChunkStrategy::Count(n) => {
            if *n == 0 || *n > n_voxels {
                return Err(MappingError::InvalidPartition(format!(
                    "cannot split {} voxels into {} partitions",
                    n_voxels, n
                )));
            }
            let base = n_voxels / n;
            let extra = n_voxels % n;
            let mut start = 0;
            (0..*n)
                .map(|k| {
                    let len = base + usize::from(k < extra);
                    let part = VoxelPartition {
                        voxels: (start..start + len).collect(),
                        rows: Some((0..n_rows).collect()),
                    };
                    start += len;
                    part
                })
                .collect()
        }
        ChunkStrategy::Size(s) => {
            if *s == 0 {
                return Err(MappingError::InvalidPartition(
                    "partition size must be positive".to_string(),
                ));
            }
            contiguous(*s)
        }
        ChunkStrategy::Explicit(parts) => {
            if parts.is_empty() {
                return Err(MappingError::InvalidPartition(
                    "no partitions supplied".to_string(),
                ));
            }
            let mut resolved = Vec::with_capacity(parts.len());
            for p in parts {
                if p.rows.is_some() && !rows_allowed {
                    return Err(MappingError::InvalidConfig(
                        "partitions can only restrict cells in cell mode".to_string(),
                    ));
                }
                resolved.push(VoxelPartition {
                    voxels: p.voxels.clone(),
                    rows: Some(p.rows.clone().unwrap_or_else(|| (0..n_rows).collect())),
                });
            }
            resolved
        }
    };

    validate_partitions(&partitions, n_voxels, n_rows)?;
    Ok(partitions)
}

/// Check that partitions are disjoint, in range and cover every voxel and
/// every row
fn validate_partitions(
    partitions: &[VoxelPartition],
    n_voxels: usize,
    n_rows: usize,
) -> Result<(), MappingError> {
    let mut voxel_owner: Vec<Option<usize>> = vec![None; n_voxels];
    let mut row_covered = vec![false; n_rows];

    for (k, p) in partitions.iter().enumerate() {
        if p.voxels.is_empty() {
            return Err(MappingError::InvalidPartition(format!(
                "partition {} has no voxels",
                k
            )));
        }
        for &v in &p.voxels {
            if v >= n_voxels {
                return Err(MappingError::InvalidPartition(format!(
                    "voxel {} of partition {} is out of range ({} voxels)",
                    v, k, n_voxels
                )));
            }
            if let Some(other) = voxel_owner[v] {
                return Err(MappingError::InvalidPartition(format!(
                    "voxel {} is in partitions {} and {}",
                    v, other, k
                )));
            }
            voxel_owner[v] = Some(k);
        }

        let rows = p.rows.as_deref().unwrap_or(&[]);
        if rows.is_empty() {
            return Err(MappingError::InvalidPartition(format!(
                "partition {} has no cells",
                k
            )));
        }
        let mut seen = vec![false; n_rows];
        for &i in rows {
            if i >= n_rows {
                return Err(MappingError::InvalidPartition(format!(
                    "cell {} of partition {} is out of range ({} cells)",
                    i, k, n_rows
                )));
            }
            if seen[i] {
                return Err(MappingError::InvalidPartition(format!(
                    "cell {} appears twice in partition {}",
                    i, k
                )));
            }
            seen[i] = true;
            row_covered[i] = true;
        }
    }

    if let Some(v) = voxel_owner.iter().position(|o| o.is_none()) {
        return Err(MappingError::InvalidPartition(format!(
            "voxel {} is not covered by any partition",
            v
        )));
    }
    if let Some(i) = row_covered.iter().position(|c| !c) {
        return Err(MappingError::InvalidPartition(format!(
            "cell {} is not covered by any partition",
            i
        )));
    }

    Ok(())
}

/////////////
// Running //
/////////////

/// Map every partition independently and reassemble
///
/// ### Params
///
/// * `source` - Shared prepared source
/// * `target` - Prepared spatial data over all voxels
/// * `kind` - Mode specific terms; constrained mode is rejected
/// * `params` - Run parameters; partition `k` uses `seed + k`
/// * `chunking` - The `ChunkParams`
///
/// ### Returns
///
/// The `ChunkedAssignment`.
pub fn run_chunked(
    source: Arc<PreparedSource>,
    target: &PreparedTarget,
    kind: &ObjectiveKind,
    params: &MapperParams,
    chunking: &ChunkParams,
) -> Result<ChunkedAssignment, MappingError> {
    if matches!(kind, ObjectiveKind::Constrained { .. }) {
        return Err(MappingError::InvalidConfig(
            "constrained mode cannot be run in chunks".to_string(),
        ));
    }
    params.validate()?;

    let n_rows = source.nrows();
    let n_voxels = target.nrows();
    let partitions = resolve_partitions(
        &chunking.strategy,
        n_voxels,
        n_rows,
        *kind == ObjectiveKind::Cells,
    )?;

    if params.verbose {
        info!(
            "Mapping {} voxels in {} partitions ({})",
            n_voxels,
            partitions.len(),
            if chunking.parallel {
                "parallel"
            } else {
                "sequential"
            }
        );
    }

    let run = |(k, p): (usize, &VoxelPartition)| {
        run_partition(k, p, source.clone(), target, kind, params)
    };
    let runs: Vec<PartitionRun> = if chunking.parallel {
        partitions
            .par_iter()
            .enumerate()
            .map(run)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        partitions
            .iter()
            .enumerate()
            .map(run)
            .collect::<Result<Vec<_>, _>>()?
    };

    let assignment = reassemble(&runs, n_rows, n_voxels);
    let prediction = Objective::new(source, target.clone(), kind.clone())?
        .predict(assignment.as_ref(), None);

    Ok(ChunkedAssignment {
        assignment,
        prediction,
        partitions: runs.into_iter().map(|r| r.report).collect(),
    })
}

/// Train a single partition and compute its row affinities
fn run_partition(
    k: usize,
    partition: &VoxelPartition,
    source: Arc<PreparedSource>,
    target: &PreparedTarget,
    kind: &ObjectiveKind,
    params: &MapperParams,
) -> Result<PartitionRun, MappingError> {
    let rows: Vec<usize> = partition
        .rows
        .clone()
        .unwrap_or_else(|| (0..source.nrows()).collect());
    let sub_source = if rows.len() == source.nrows() && rows.iter().enumerate().all(|(a, &b)| a == b)
    {
        source
    } else {
        Arc::new(source.subset(&rows))
    };
    let sub_target = target.subset(&partition.voxels, sub_source.total_mass())?;
    let objective = Objective::new(sub_source, sub_target, kind.clone())?;

    let seed = params.seed.wrapping_add(k as u64);
    let part_params = MapperParams {
        seed,
        ..params.clone()
    };
    let outcome = TrainingLoop::new(&objective, &part_params)?.run()?;

    // cos(S_i, G_v) of the unit rows
    let cosine = objective.source().profiles.as_ref()
        * objective.target().profiles.as_ref().transpose();
    let size = partition.voxels.len() as f64;
    let affinity: Vec<f64> = (0..rows.len())
        .map(|i| {
            let a: f64 = (0..partition.voxels.len())
                .map(|j| outcome.assignment[(i, j)] * cosine[(i, j)])
                .sum();
            size * a.max(0.0)
        })
        .collect();

    if params.verbose {
        info!(
            "Partition {}: {} voxels, {} cells, final loss = {:.6}",
            k,
            partition.voxels.len(),
            rows.len(),
            outcome.diagnostics.final_loss
        );
    }

    Ok(PartitionRun {
        rows,
        voxels: partition.voxels.clone(),
        assignment: outcome.assignment,
        affinity,
        report: PartitionReport {
            partition: partition.clone(),
            seed,
            diagnostics: outcome.diagnostics,
        },
    })
}

/// Combine the partial assignments into one full width matrix
///
/// The weight of partition `k` for row `i` is its affinity normalised over
/// all partitions holding `i`. Rows with zero affinity everywhere fall back
/// to partition size proportions.
fn reassemble(runs: &[PartitionRun], n_rows: usize, n_voxels: usize) -> Mat<f64> {
    // per row: (run index, local row, affinity, partition size)
    let mut membership: Vec<Vec<(usize, usize, f64, f64)>> = vec![Vec::new(); n_rows];
    for (k, run) in runs.iter().enumerate() {
        for (local, &i) in run.rows.iter().enumerate() {
            membership[i].push((k, local, run.affinity[local], run.voxels.len() as f64));
        }
    }

    let mut assignment = Mat::<f64>::zeros(n_rows, n_voxels);
    for (i, parts) in membership.iter().enumerate() {
        let total_affinity: f64 = parts.iter().map(|p| p.2).sum();
        let total_size: f64 = parts.iter().map(|p| p.3).sum();
        for &(k, local, affinity, size) in parts {
            let weight = if total_affinity > 0.0 {
                affinity / total_affinity
            } else {
                size / total_size
            };
            let run = &runs[k];
            for (j, &v) in run.voxels.iter().enumerate() {
                assignment[(i, v)] = weight * run.assignment[(local, j)];
            }
        }
    }

    assignment
}
