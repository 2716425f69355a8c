use faer::{Mat, MatRef};
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::core::errors::MappingError;
use crate::{ensure_len, ensure_nrows};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Cluster label per cell
///
/// ### Fields
///
/// * `cell_labels` - One label per row of the single cell matrix
/// * `categories` - Optional declared cluster order. If supplied, every
///   declared cluster must have members and every cell label must be
///   declared. Otherwise clusters are ordered by first appearance.
#[derive(Clone, Debug)]
pub struct ClusterLabels {
    pub cell_labels: Vec<String>,
    pub categories: Option<Vec<String>>,
}

/// Resolved cluster memberships
///
/// ### Fields
///
/// * `names` - Cluster names, in cluster index order
/// * `members` - Cell indices per cluster
/// * `assignments` - Cluster index per cell
#[derive(Clone, Debug)]
pub struct ClusterMemberships {
    pub names: Vec<String>,
    pub members: Vec<Vec<usize>>,
    pub assignments: Vec<usize>,
}

/// Source profiles after aggregation
///
/// ### Fields
///
/// * `profiles` - Rows × genes; mean profiles in cluster mode
/// * `sizes` - Number of cells represented per row
/// * `names` - Optional row names (cluster names in cluster mode)
#[derive(Clone, Debug)]
pub struct AggregatedSource {
    pub profiles: Mat<f64>,
    pub sizes: Vec<f64>,
    pub names: Option<Vec<String>>,
}

/// Cell level assignment obtained from a cluster level one
///
/// ### Fields
///
/// * `assignment` - Cells × voxels, every row sums to one
/// * `mass` - Mass carried by every cell. Uniform member weights give `1`
///   per cell; the members of a cluster of size `k` carry `k` in total.
#[derive(Clone, Debug)]
pub struct CellExpansion {
    pub assignment: Mat<f64>,
    pub mass: Vec<f64>,
}

impl ClusterLabels {
    /// Labels with clusters ordered by first appearance
    pub fn new(cell_labels: Vec<String>) -> Self {
        Self {
            cell_labels,
            categories: None,
        }
    }

    /// Labels with a declared cluster order
    pub fn with_categories(cell_labels: Vec<String>, categories: Vec<String>) -> Self {
        Self {
            cell_labels,
            categories: Some(categories),
        }
    }

    /// Resolve the memberships
    ///
    /// ### Params
    ///
    /// * `n_cells` - Number of cells in the single cell matrix
    ///
    /// ### Returns
    ///
    /// The `ClusterMemberships`, or `UnknownLabel` / `EmptyCluster` /
    /// `ShapeMismatch` on inconsistent metadata.
    pub fn memberships(&self, n_cells: usize) -> Result<ClusterMemberships, MappingError> {
        ensure_len!(self.cell_labels, n_cells, "cluster labels");

        let mut index: FxHashMap<&str, usize> = FxHashMap::default();
        let mut names: Vec<String> = Vec::new();

        if let Some(categories) = &self.categories {
            for cat in categories {
                if index.insert(cat.as_str(), names.len()).is_some() {
                    return Err(MappingError::InvalidInput(format!(
                        "cluster '{}' is declared twice",
                        cat
                    )));
                }
                names.push(cat.clone());
            }
        }

        let mut assignments = Vec::with_capacity(n_cells);
        for label in &self.cell_labels {
            let idx = match index.get(label.as_str()) {
                Some(&idx) => idx,
                None if self.categories.is_some() => {
                    return Err(MappingError::UnknownLabel {
                        label: label.clone(),
                    })
                }
                None => {
                    let idx = names.len();
                    index.insert(label.as_str(), idx);
                    names.push(label.clone());
                    idx
                }
            };
            assignments.push(idx);
        }

        let mut members = vec![Vec::new(); names.len()];
        for (cell, &cluster) in assignments.iter().enumerate() {
            members[cluster].push(cell);
        }

        if let Some(empty) = members.iter().position(|m| m.is_empty()) {
            return Err(MappingError::EmptyCluster {
                label: names[empty].clone(),
            });
        }

        Ok(ClusterMemberships {
            names,
            members,
            assignments,
        })
    }
}

/////////////////
// Aggregation //
/////////////////

/// Aggregate cells into mean cluster profiles
///
/// ### Params
///
/// * `source` - Cells × genes
/// * `labels` - Cluster label per cell
///
/// ### Returns
///
/// `AggregatedSource` with one mean profile per cluster and the cluster
/// sizes.
pub fn aggregate(
    source: MatRef<f64>,
    labels: &ClusterLabels,
) -> Result<AggregatedSource, MappingError> {
    let memberships = labels.memberships(source.nrows())?;
    let n_genes = source.ncols();

    let means: Vec<Vec<f64>> = memberships
        .members
        .par_iter()
        .map(|cells| {
            let mut profile = vec![0.0; n_genes];
            for &cell in cells {
                for (g, acc) in profile.iter_mut().enumerate() {
                    *acc += source[(cell, g)];
                }
            }
            let k = cells.len() as f64;
            profile.iter_mut().for_each(|x| *x /= k);
            profile
        })
        .collect();

    let profiles = Mat::from_fn(means.len(), n_genes, |i, j| means[i][j]);
    let sizes = memberships
        .members
        .iter()
        .map(|m| m.len() as f64)
        .collect();

    Ok(AggregatedSource {
        profiles,
        sizes,
        names: Some(memberships.names),
    })
}

/// Expand a cluster level assignment to the member cells
///
/// Each cell receives its cluster's row. With member weights, the row is
/// scaled by `k * w_i / sum_{j in cluster} w_j` before renormalisation; the
/// scale is returned as the cell's mass.
///
/// ### Params
///
/// * `assignment` - Clusters × voxels
/// * `labels` - Cluster label per cell
/// * `member_weights` - Optional positive weight per cell (e.g. size
///   factors)
///
/// ### Returns
///
/// The `CellExpansion`.
pub fn expand(
    assignment: MatRef<f64>,
    labels: &ClusterLabels,
    member_weights: Option<&[f64]>,
) -> Result<CellExpansion, MappingError> {
    let n_cells = labels.cell_labels.len();
    let memberships = labels.memberships(n_cells)?;
    ensure_nrows!(assignment, memberships.names.len(), "cluster assignment");

    let mass: Vec<f64> = match member_weights {
        None => vec![1.0; n_cells],
        Some(w) => {
            ensure_len!(w, n_cells, "member weights");
            if let Some(bad) = w.iter().find(|x| !(x.is_finite() && **x > 0.0)) {
                return Err(MappingError::InvalidInput(format!(
                    "member weights must be positive and finite, found {}",
                    bad
                )));
            }
            let mut mass = vec![0.0; n_cells];
            for cells in &memberships.members {
                let total: f64 = cells.iter().map(|&c| w[c]).sum();
                let k = cells.len() as f64;
                for &c in cells {
                    mass[c] = k * w[c] / total;
                }
            }
            mass
        }
    };

    let n_voxels = assignment.ncols();
    let rows: Vec<Vec<f64>> = (0..n_cells)
        .into_par_iter()
        .map(|cell| {
            let cluster = memberships.assignments[cell];
            let scaled: Vec<f64> = (0..n_voxels)
                .map(|v| mass[cell] * assignment[(cluster, v)])
                .collect();
            let total: f64 = scaled.iter().sum();
            scaled.iter().map(|x| x / total).collect()
        })
        .collect();

    if let Some(bad) = rows
        .iter()
        .position(|r| r.iter().any(|x| !x.is_finite()))
    {
        return Err(MappingError::InvalidInput(format!(
            "cluster row of cell {} has no assignment mass",
            bad
        )));
    }

    Ok(CellExpansion {
        assignment: Mat::from_fn(n_cells, n_voxels, |i, j| rows[i][j]),
        mass,
    })
}

/////////////////////////
// Aggregator variants //
/////////////////////////

/// Capability shared by the cell and the cluster mode
///
/// `aggregate` turns the single cell matrix into the rows that are mapped;
/// `expand` turns an assignment over those rows back into cell level.
pub trait SourceAggregator: Send + Sync {
    /// Produce the rows to map
    fn aggregate(&self, source: MatRef<f64>) -> Result<AggregatedSource, MappingError>;

    /// Expand a row level assignment to cells
    fn expand(
        &self,
        assignment: MatRef<f64>,
        member_weights: Option<&[f64]>,
    ) -> Result<CellExpansion, MappingError>;
}

/// Cell mode: every cell is its own row
#[derive(Clone, Debug, Default)]
pub struct IdentityAggregator;

impl SourceAggregator for IdentityAggregator {
    fn aggregate(&self, source: MatRef<f64>) -> Result<AggregatedSource, MappingError> {
        Ok(AggregatedSource {
            profiles: source.to_owned(),
            sizes: vec![1.0; source.nrows()],
            names: None,
        })
    }

    fn expand(
        &self,
        assignment: MatRef<f64>,
        member_weights: Option<&[f64]>,
    ) -> Result<CellExpansion, MappingError> {
        if let Some(w) = member_weights {
            ensure_len!(w, assignment.nrows(), "member weights");
        }
        Ok(CellExpansion {
            assignment: assignment.to_owned(),
            mass: vec![1.0; assignment.nrows()],
        })
    }
}

/// Cluster mode: rows are mean profiles of labelled cell groups
#[derive(Clone, Debug)]
pub struct ClusterAggregator {
    pub labels: ClusterLabels,
}

impl SourceAggregator for ClusterAggregator {
    fn aggregate(&self, source: MatRef<f64>) -> Result<AggregatedSource, MappingError> {
        aggregate(source, &self.labels)
    }

    fn expand(
        &self,
        assignment: MatRef<f64>,
        member_weights: Option<&[f64]>,
    ) -> Result<CellExpansion, MappingError> {
        expand(assignment, &self.labels, member_weights)
    }
}
