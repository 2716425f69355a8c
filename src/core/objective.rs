//! The mapping objective: preparation of the expression data, evaluation of
//! every loss term and the analytic gradient w.r.t. the assignment logits.
//!
//! Notation used throughout: `S` are the source profiles (cells or clusters
//! × genes), `G` the spatial profiles (voxels × genes), `M` the row-stochastic
//! assignment (rows × voxels), `r` the per-row mass (cluster sizes times the
//! optional cell filter) and `E = diag(r) M` the effective mapping. The
//! predicted spatial profiles are `P = E^T S`.

use faer::{Mat, MatRef};
use rayon::prelude::*;
use std::sync::Arc;

use crate::core::assignment::{sigmoid_backward, softmax_backward};
use crate::core::errors::{LossTerm, MappingError};
use crate::core::params::LossWeights;
use crate::utils::general::*;
use crate::{ensure_len, ensure_ncols};

//////////////////////////////
// ENUMS, TYPES, STRUCTURES //
//////////////////////////////

/// Prior expectation of the share of cells per voxel
#[derive(Clone, Debug, PartialEq, Default)]
pub enum DensityPrior {
    /// Every voxel is expected to hold the same number of cells
    #[default]
    Uniform,
    /// Proportional to the total expression (row sum) of each voxel
    RnaCountBased,
    /// Caller supplied, one non-negative value per voxel
    Custom(Vec<f64>),
}

/// Optional side information about the spatial data
///
/// ### Fields
///
/// * `density_prior` - Prior for the density term.
/// * `expected_counts` - Expected number of cells per voxel. Enables the
///   count term.
/// * `gene_weights` - Per-gene weights for the cosine similarities.
#[derive(Clone, Debug, Default)]
pub struct SpatialPriors {
    pub density_prior: DensityPrior,
    pub expected_counts: Option<Vec<f64>>,
    pub gene_weights: Option<Vec<f64>>,
}

/// Source profiles ready for optimisation
///
/// ### Fields
///
/// * `profiles` - Gene-weighted, row L2-normalised profiles (rows × genes)
/// * `row_weights` - Mass per row; `1` for cells, member count for clusters
#[derive(Clone, Debug)]
pub struct PreparedSource {
    pub profiles: Mat<f64>,
    pub row_weights: Vec<f64>,
}

/// Spatial profiles and side information ready for optimisation
///
/// ### Fields
///
/// * `profiles` - Gene-weighted, row L2-normalised profiles (voxels × genes)
/// * `density_prior` - Normalised density prior (sums to 1)
/// * `expected_counts` - Optional expected cells per voxel
#[derive(Clone, Debug)]
pub struct PreparedTarget {
    pub profiles: Mat<f64>,
    pub density_prior: Vec<f64>,
    pub expected_counts: Option<Vec<f64>>,
}

/// Mode specific terms of the objective
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectiveKind {
    /// Plain cell mode
    Cells,
    /// Cluster mode; enables the size-scaled entropy term
    Clusters,
    /// Constrained mode; enables the filter terms
    Constrained { target_count: f64 },
}

/// Unweighted values of every loss term plus the weighted total
///
/// Inactive terms are reported as `0`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LossBreakdown {
    pub voxel_similarity: f64,
    pub gene_similarity: f64,
    pub density: f64,
    pub count: f64,
    pub cluster_entropy: f64,
    pub filter_count: f64,
    pub filter_regulariser: f64,
    pub total: f64,
}

impl LossBreakdown {
    /// All terms, in a fixed order, with the total last
    pub fn terms(&self) -> [(LossTerm, f64); 8] {
        [
            (LossTerm::VoxelSimilarity, self.voxel_similarity),
            (LossTerm::GeneSimilarity, self.gene_similarity),
            (LossTerm::Density, self.density),
            (LossTerm::Count, self.count),
            (LossTerm::ClusterEntropy, self.cluster_entropy),
            (LossTerm::FilterCount, self.filter_count),
            (LossTerm::FilterRegulariser, self.filter_regulariser),
            (LossTerm::Total, self.total),
        ]
    }

    /// First term whose value is not finite
    pub fn first_non_finite(&self) -> Option<LossTerm> {
        self.terms()
            .iter()
            .find(|(_, v)| !v.is_finite())
            .map(|(t, _)| *t)
    }
}

/// Gradient w.r.t. the raw parameters
///
/// ### Fields
///
/// * `logits` - Row-major gradient w.r.t. the assignment logits
/// * `filter` - Gradient w.r.t. the filter logits (constrained mode)
#[derive(Clone, Debug)]
pub struct Gradient {
    pub logits: Vec<f64>,
    pub filter: Option<Vec<f64>>,
}

impl Gradient {
    /// Are all entries finite
    pub fn is_finite(&self) -> bool {
        self.logits.iter().all(|x| x.is_finite())
            && self
                .filter
                .as_ref()
                .map(|f| f.iter().all(|x| x.is_finite()))
                .unwrap_or(true)
    }
}

/////////////////
// Preparation //
/////////////////

/// Check that an expression matrix is finite and non-negative
fn validate_expression(mat: MatRef<f64>, what: &str) -> Result<(), MappingError> {
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            let x = mat[(i, j)];
            if !(x.is_finite() && x >= 0.0) {
                return Err(MappingError::InvalidInput(format!(
                    "{} contains an invalid entry {} at ({}, {})",
                    what, x, i, j
                )));
            }
        }
    }
    Ok(())
}

/// Square roots of validated gene weights
fn gene_weight_factors(
    gene_weights: Option<&[f64]>,
    n_genes: usize,
) -> Result<Vec<f64>, MappingError> {
    match gene_weights {
        None => Ok(vec![1.0; n_genes]),
        Some(w) => {
            ensure_len!(w, n_genes, "gene weights");
            if let Some(bad) = w.iter().find(|x| !(x.is_finite() && **x >= 0.0)) {
                return Err(MappingError::InvalidInput(format!(
                    "gene weights must be non-negative and finite, found {}",
                    bad
                )));
            }
            Ok(w.iter().map(|x| x.sqrt()).collect())
        }
    }
}

/// Prepare the source profiles
///
/// Applies the gene weights and L2-normalises every row.
///
/// ### Params
///
/// * `source` - Cells (or cluster means) × genes
/// * `row_weights` - Mass per row
/// * `gene_weights` - Optional per-gene weights
///
/// ### Returns
///
/// The `PreparedSource`; a zero-norm row yields `NumericalInstability`.
pub fn prepare_source(
    source: MatRef<f64>,
    row_weights: Vec<f64>,
    gene_weights: Option<&[f64]>,
) -> Result<PreparedSource, MappingError> {
    validate_expression(source, "source expression")?;
    ensure_len!(row_weights, source.nrows(), "source row weights");

    let factors = gene_weight_factors(gene_weights, source.ncols())?;
    let weighted = scale_matrix_cols(source, &factors);
    let profiles = normalise_matrix_row_l2(weighted.as_ref()).map_err(|index| {
        MappingError::NumericalInstability {
            term: LossTerm::VoxelSimilarity,
            axis: "source row",
            index,
            epoch: None,
        }
    })?;

    Ok(PreparedSource {
        profiles,
        row_weights,
    })
}

/// Prepare the spatial profiles and side information
///
/// ### Params
///
/// * `source` - The raw source matrix, only used for the gene axis check
/// * `target` - Voxels × genes
/// * `priors` - Side information
///
/// ### Returns
///
/// The `PreparedTarget`.
pub fn prepare_target(
    source: MatRef<f64>,
    target: MatRef<f64>,
    priors: &SpatialPriors,
) -> Result<PreparedTarget, MappingError> {
    ensure_ncols!(source, target, "gene axis of spatial data");
    validate_expression(target, "spatial expression")?;

    let n_voxels = target.nrows();
    let factors = gene_weight_factors(priors.gene_weights.as_deref(), target.ncols())?;
    let weighted = scale_matrix_cols(target, &factors);
    let profiles = normalise_matrix_row_l2(weighted.as_ref()).map_err(|index| {
        MappingError::NumericalInstability {
            term: LossTerm::VoxelSimilarity,
            axis: "voxel",
            index,
            epoch: None,
        }
    })?;

    let raw_prior = match &priors.density_prior {
        DensityPrior::Uniform => vec![1.0; n_voxels],
        DensityPrior::RnaCountBased => row_sums(target),
        DensityPrior::Custom(d) => {
            ensure_len!(d, n_voxels, "density prior");
            d.clone()
        }
    };
    let density_prior = normalise_distribution(&raw_prior, "density prior")?;

    let expected_counts = match &priors.expected_counts {
        None => None,
        Some(t) => {
            ensure_len!(t, n_voxels, "expected cell counts");
            if t.iter().any(|x| !(x.is_finite() && *x >= 0.0)) {
                return Err(MappingError::InvalidInput(
                    "expected cell counts must be non-negative and finite".to_string(),
                ));
            }
            if t.iter().all(|x| *x == 0.0) {
                return Err(MappingError::InvalidInput(
                    "expected cell counts are all zero".to_string(),
                ));
            }
            Some(t.clone())
        }
    };

    Ok(PreparedTarget {
        profiles,
        density_prior,
        expected_counts,
    })
}

/// Normalise a non-negative vector to sum to one
fn normalise_distribution(x: &[f64], what: &str) -> Result<Vec<f64>, MappingError> {
    if x.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
        return Err(MappingError::InvalidInput(format!(
            "{} must be non-negative and finite",
            what
        )));
    }
    let total: f64 = x.iter().sum();
    if total <= 0.0 {
        return Err(MappingError::InvalidInput(format!("{} sums to zero", what)));
    }
    Ok(x.iter().map(|v| v / total).collect())
}

impl PreparedSource {
    /// Number of source rows
    pub fn nrows(&self) -> usize {
        self.profiles.nrows()
    }

    /// Restrict to a subset of rows
    pub fn subset(&self, rows: &[usize]) -> PreparedSource {
        PreparedSource {
            profiles: mat_select_rows(self.profiles.as_ref(), rows),
            row_weights: rows.iter().map(|&i| self.row_weights[i]).collect(),
        }
    }

    /// Total mass of all rows
    pub fn total_mass(&self) -> f64 {
        self.row_weights.iter().sum()
    }
}

impl PreparedTarget {
    /// Number of voxels
    pub fn nrows(&self) -> usize {
        self.profiles.nrows()
    }

    /// Restrict to a subset of voxels
    ///
    /// The density prior is renormalised over the subset and expected counts
    /// are rescaled so that they add up to `source_mass`, the mass that will
    /// be distributed over this subset.
    ///
    /// ### Params
    ///
    /// * `voxels` - Voxel indices to keep
    /// * `source_mass` - Total source mass mapped onto the subset
    ///
    /// ### Returns
    ///
    /// The restricted `PreparedTarget`.
    pub fn subset(
        &self,
        voxels: &[usize],
        source_mass: f64,
    ) -> Result<PreparedTarget, MappingError> {
        let prior: Vec<f64> = voxels.iter().map(|&v| self.density_prior[v]).collect();
        let density_prior = normalise_distribution(&prior, "density prior of partition")?;

        let expected_counts = match &self.expected_counts {
            None => None,
            Some(t) => {
                let part: Vec<f64> = voxels.iter().map(|&v| t[v]).collect();
                let total: f64 = part.iter().sum();
                if total <= 0.0 {
                    return Err(MappingError::InvalidInput(
                        "expected cell counts of partition sum to zero".to_string(),
                    ));
                }
                Some(part.iter().map(|x| x * source_mass / total).collect())
            }
        };

        Ok(PreparedTarget {
            profiles: mat_select_rows(self.profiles.as_ref(), voxels),
            density_prior,
            expected_counts,
        })
    }
}

///////////////
// Objective //
///////////////

/// The composite mapping objective
///
/// Holds the prepared, read-only data of one run. The source is shared
/// behind an `Arc` so that independent chunked runs do not copy it.
///
/// ### Fields
///
/// * `source` - Prepared source profiles
/// * `target` - Prepared spatial profiles and side information
/// * `kind` - Mode specific terms
/// * `entropy_scale` - Per-row scale of the entropy term, `r_i / max(r)`
#[derive(Clone, Debug)]
pub struct Objective {
    source: Arc<PreparedSource>,
    target: PreparedTarget,
    kind: ObjectiveKind,
    entropy_scale: Vec<f64>,
}

/// Intermediate state of one evaluation, from which the gradient follows
struct EvalCache {
    row_mass: Vec<f64>,
    pred: Mat<f64>,
    pred_norms: Vec<f64>,
    voxel_cos: Vec<f64>,
    gene_cache: Option<GeneCache>,
    col_mass: Vec<f64>,
    total_mass: f64,
    density_active: bool,
    count_active: bool,
    entropy_active: bool,
    filter_active: bool,
}

struct GeneCache {
    pred_norms: Vec<f64>,
    target_norms: Vec<f64>,
    cos: Vec<f64>,
}

/// Result of evaluating the objective at one point
pub struct Evaluation<'a> {
    objective: &'a Objective,
    m: MatRef<'a, f64>,
    log_m: MatRef<'a, f64>,
    filter: Option<&'a [f64]>,
    weights: LossWeights,
    pub breakdown: LossBreakdown,
    cache: EvalCache,
}

impl Objective {
    /// Generate a new objective
    ///
    /// ### Params
    ///
    /// * `source` - Prepared source profiles
    /// * `target` - Prepared spatial profiles; must share the gene axis
    /// * `kind` - Which mode specific terms to enable
    ///
    /// ### Returns
    ///
    /// The `Objective`.
    pub fn new(
        source: Arc<PreparedSource>,
        target: PreparedTarget,
        kind: ObjectiveKind,
    ) -> Result<Self, MappingError> {
        ensure_ncols!(source.profiles, target.profiles, "gene axis of spatial data");
        if let ObjectiveKind::Constrained { target_count } = kind {
            if !(target_count.is_finite() && target_count > 0.0) {
                return Err(MappingError::InvalidConfig(format!(
                    "target cell count must be positive, got {}",
                    target_count
                )));
            }
        }

        let max_mass = source
            .row_weights
            .iter()
            .copied()
            .fold(0.0_f64, f64::max);
        let entropy_scale = if max_mass > 0.0 {
            source.row_weights.iter().map(|w| w / max_mass).collect()
        } else {
            vec![0.0; source.nrows()]
        };

        Ok(Self {
            source,
            target,
            kind,
            entropy_scale,
        })
    }

    /// The prepared source
    pub fn source(&self) -> &PreparedSource {
        &self.source
    }

    /// The prepared target
    pub fn target(&self) -> &PreparedTarget {
        &self.target
    }

    /// Does this objective optimise a cell filter
    pub fn uses_filter(&self) -> bool {
        matches!(self.kind, ObjectiveKind::Constrained { .. })
    }

    /// Number of rows and voxels of the assignment matrix
    pub fn shape(&self) -> (usize, usize) {
        (self.source.nrows(), self.target.nrows())
    }

    /// Mass per row, including the filter if present
    fn row_mass(&self, filter: Option<&[f64]>) -> Vec<f64> {
        match filter {
            Some(f) => self
                .source
                .row_weights
                .iter()
                .zip(f)
                .map(|(w, f)| w * f)
                .collect(),
            None => self.source.row_weights.clone(),
        }
    }

    /// Predicted spatial profiles `P = (diag(r) M)^T S`
    ///
    /// ### Params
    ///
    /// * `m` - The assignment matrix
    /// * `filter` - Optional cell filter
    ///
    /// ### Returns
    ///
    /// Voxels × genes matrix of predicted profiles.
    pub fn predict(&self, m: MatRef<f64>, filter: Option<&[f64]>) -> Mat<f64> {
        let row_mass = self.row_mass(filter);
        let weighted = scale_matrix_rows(self.source.profiles.as_ref(), &row_mass);
        m.transpose() * weighted.as_ref()
    }

    /// Evaluate every active loss term
    ///
    /// ### Params
    ///
    /// * `m` - The assignment matrix (rows × voxels)
    /// * `log_m` - Element-wise log of `m`
    /// * `filter` - Cell filter; required in constrained mode
    /// * `weights` - The (possibly annealed) loss weights
    ///
    /// ### Returns
    ///
    /// The `Evaluation` holding the loss breakdown and the cached
    /// intermediates for the gradient.
    pub fn evaluate<'a>(
        &'a self,
        m: MatRef<'a, f64>,
        log_m: MatRef<'a, f64>,
        filter: Option<&'a [f64]>,
        weights: &LossWeights,
    ) -> Result<Evaluation<'a>, MappingError> {
        let (n_rows, n_voxels) = self.shape();
        if m.nrows() != n_rows || m.ncols() != n_voxels {
            return Err(MappingError::ShapeMismatch {
                what: "assignment matrix".to_string(),
                expected: n_rows * n_voxels,
                found: m.nrows() * m.ncols(),
            });
        }
        if let Some(f) = filter {
            ensure_len!(f, n_rows, "cell filter");
        }
        let filter = if self.uses_filter() { filter } else { None };
        if self.uses_filter() && filter.is_none() {
            return Err(MappingError::InvalidInput(
                "constrained mode requires a cell filter".to_string(),
            ));
        }

        let g_hat = self.target.profiles.as_ref();
        let row_mass = self.row_mass(filter);
        let pred = self.predict(m, filter);

        // voxel similarity
        let voxel_stats: Vec<(f64, f64)> = (0..n_voxels)
            .into_par_iter()
            .map(|v| {
                let p = row_to_vec(pred.as_ref(), v);
                let g = row_to_vec(g_hat, v);
                let norm = l2_norm(&p);
                (norm, dot(&p, &g) / norm)
            })
            .collect();
        if let Some(v) = voxel_stats
            .iter()
            .position(|(n, _)| !(n.is_finite() && *n > 0.0))
        {
            return Err(MappingError::NumericalInstability {
                term: LossTerm::VoxelSimilarity,
                axis: "voxel",
                index: v,
                epoch: None,
            });
        }
        let (pred_norms, voxel_cos): (Vec<f64>, Vec<f64>) = voxel_stats.into_iter().unzip();
        let voxel_similarity = 1.0 - voxel_cos.iter().sum::<f64>() / n_voxels as f64;

        // gene similarity
        let mut breakdown = LossBreakdown {
            voxel_similarity,
            ..Default::default()
        };
        let gene_cache = if weights.gene_similarity > 0.0 {
            let cache = gene_similarity_cache(pred.as_ref(), g_hat)?;
            breakdown.gene_similarity =
                1.0 - cache.cos.iter().sum::<f64>() / cache.cos.len() as f64;
            Some(cache)
        } else {
            None
        };

        // column mass
        let col_mass = col_sums(scale_matrix_rows(m, &row_mass).as_ref());
        let total_mass: f64 = col_mass.iter().sum();

        let density_active = weights.density > 0.0;
        if density_active {
            if !(total_mass.is_finite() && total_mass > 0.0) {
                return Err(MappingError::NumericalInstability {
                    term: LossTerm::Density,
                    axis: "total mass",
                    index: 0,
                    epoch: None,
                });
            }
            let mut kl = 0.0;
            for (v, &d) in self.target.density_prior.iter().enumerate() {
                if d > 0.0 {
                    if col_mass[v] <= 0.0 {
                        return Err(MappingError::NumericalInstability {
                            term: LossTerm::Density,
                            axis: "voxel",
                            index: v,
                            epoch: None,
                        });
                    }
                    kl += d * (d.ln() - (col_mass[v] / total_mass).ln());
                }
            }
            breakdown.density = kl;
        }

        let count_active = weights.count > 0.0 && self.target.expected_counts.is_some();
        if let (true, Some(t)) = (count_active, &self.target.expected_counts) {
            let denom: f64 = t.iter().map(|x| x * x).sum();
            let num: f64 = col_mass
                .iter()
                .zip(t)
                .map(|(c, t)| (c - t) * (c - t))
                .sum();
            breakdown.count = num / denom;
        }

        let entropy_active =
            weights.cluster_entropy > 0.0 && self.kind == ObjectiveKind::Clusters;
        if entropy_active {
            let per_row: Vec<f64> = (0..n_rows)
                .into_par_iter()
                .map(|i| {
                    let s = self.entropy_scale[i];
                    s * (0..n_voxels)
                        .map(|v| m[(i, v)] * log_m[(i, v)])
                        .sum::<f64>()
                })
                .collect();
            // ordered sum keeps runs reproducible
            let neg_entropy: f64 = per_row.iter().sum();
            breakdown.cluster_entropy = neg_entropy / n_rows as f64;
        }

        let filter_active = filter.is_some();
        if let (Some(f), ObjectiveKind::Constrained { target_count }) = (filter, &self.kind) {
            let selected: f64 = f.iter().sum();
            let rel = (selected - target_count) / target_count;
            breakdown.filter_count = rel * rel;
            breakdown.filter_regulariser =
                f.iter().map(|x| x - x * x).sum::<f64>() / n_rows as f64;
        }

        let mut total = breakdown.voxel_similarity;
        if gene_cache.is_some() {
            total += weights.gene_similarity * breakdown.gene_similarity;
        }
        if density_active {
            total += weights.density * breakdown.density;
        }
        if count_active {
            total += weights.count * breakdown.count;
        }
        if entropy_active {
            total += weights.cluster_entropy * breakdown.cluster_entropy;
        }
        if filter_active {
            total += weights.filter_count * breakdown.filter_count
                + weights.filter_regulariser * breakdown.filter_regulariser;
        }
        breakdown.total = total;

        Ok(Evaluation {
            objective: self,
            m,
            log_m,
            filter,
            weights: weights.clone(),
            breakdown,
            cache: EvalCache {
                row_mass,
                pred,
                pred_norms,
                voxel_cos,
                gene_cache,
                col_mass,
                total_mass,
                density_active,
                count_active,
                entropy_active,
                filter_active,
            },
        })
    }
}

/// Norms and cosine similarities of the gene columns
fn gene_similarity_cache(pred: MatRef<f64>, g_hat: MatRef<f64>) -> Result<GeneCache, MappingError> {
    let stats: Vec<(f64, f64, f64)> = (0..pred.ncols())
        .into_par_iter()
        .map(|g| {
            let a = col_to_vec(pred, g);
            let b = col_to_vec(g_hat, g);
            let na = l2_norm(&a);
            let nb = l2_norm(&b);
            (na, nb, dot(&a, &b) / (na * nb))
        })
        .collect();

    if let Some(g) = stats
        .iter()
        .position(|(na, nb, _)| !(na.is_finite() && *na > 0.0 && nb.is_finite() && *nb > 0.0))
    {
        return Err(MappingError::NumericalInstability {
            term: LossTerm::GeneSimilarity,
            axis: "gene",
            index: g,
            epoch: None,
        });
    }

    let mut pred_norms = Vec::with_capacity(stats.len());
    let mut target_norms = Vec::with_capacity(stats.len());
    let mut cos = Vec::with_capacity(stats.len());
    for (na, nb, c) in stats {
        pred_norms.push(na);
        target_norms.push(nb);
        cos.push(c);
    }

    Ok(GeneCache {
        pred_norms,
        target_norms,
        cos,
    })
}

impl<'a> Evaluation<'a> {
    /// The weighted total loss
    pub fn total(&self) -> f64 {
        self.breakdown.total
    }

    /// Predicted spatial profiles at the evaluated point
    pub fn prediction(&self) -> MatRef<'_, f64> {
        self.cache.pred.as_ref()
    }

    /// Gradient of the weighted total w.r.t. the raw parameters
    ///
    /// Back-propagates every active term to the effective mapping `E`, then
    /// through `E = diag(r) M` to `M` (and the filter), and finally through
    /// the softmax and sigmoid parameterisations.
    ///
    /// ### Returns
    ///
    /// The `Gradient` w.r.t. the logits (and filter logits).
    pub fn gradient(&self) -> Gradient {
        let obj = self.objective;
        let c = &self.cache;
        let w = &self.weights;
        let (n_rows, n_voxels) = obj.shape();
        let n_genes = obj.source.profiles.ncols();
        let g_hat = obj.target.profiles.as_ref();
        let pred = c.pred.as_ref();

        // dL/dP
        let inv_v = 1.0 / n_voxels as f64;
        let mut d_pred = Mat::from_fn(n_voxels, n_genes, |v, g| {
            let norm = c.pred_norms[v];
            -inv_v * (g_hat[(v, g)] / norm - c.voxel_cos[v] * pred[(v, g)] / (norm * norm))
        });
        if let Some(gc) = &c.gene_cache {
            let scale = w.gene_similarity / n_genes as f64;
            for g in 0..n_genes {
                let na = gc.pred_norms[g];
                let nb = gc.target_norms[g];
                for v in 0..n_voxels {
                    d_pred[(v, g)] -= scale
                        * (g_hat[(v, g)] / (na * nb) - gc.cos[g] * pred[(v, g)] / (na * na));
                }
            }
        }

        // dL/dE = S dP^T plus the column mass terms
        let mut d_eff = obj.source.profiles.as_ref() * d_pred.transpose();
        let mut d_col = vec![0.0; n_voxels];
        if c.density_active {
            for (v, &d) in obj.target.density_prior.iter().enumerate() {
                let mut grad = 1.0 / c.total_mass;
                if d > 0.0 {
                    grad -= d / c.col_mass[v];
                }
                d_col[v] += w.density * grad;
            }
        }
        if let (true, Some(t)) = (c.count_active, &obj.target.expected_counts) {
            let denom: f64 = t.iter().map(|x| x * x).sum();
            for v in 0..n_voxels {
                d_col[v] += w.count * 2.0 * (c.col_mass[v] - t[v]) / denom;
            }
        }
        for i in 0..n_rows {
            for v in 0..n_voxels {
                d_eff[(i, v)] += d_col[v];
            }
        }

        // dL/dM
        let entropy_factor = if c.entropy_active {
            w.cluster_entropy / n_rows as f64
        } else {
            0.0
        };
        let d_m = Mat::from_fn(n_rows, n_voxels, |i, v| {
            let mut grad = c.row_mass[i] * d_eff[(i, v)];
            if c.entropy_active {
                grad += entropy_factor * obj.entropy_scale[i] * (self.log_m[(i, v)] + 1.0);
            }
            grad
        });
        let logits = softmax_backward(self.m, d_m.as_ref());

        // dL/dF
        let filter = match (self.filter, &obj.kind) {
            (Some(f), ObjectiveKind::Constrained { target_count }) if c.filter_active => {
                let selected: f64 = f.iter().sum();
                let count_grad =
                    w.filter_count * 2.0 * (selected - target_count) / (target_count * target_count);
                let d_f: Vec<f64> = (0..n_rows)
                    .map(|i| {
                        let through_mapping: f64 = (0..n_voxels)
                            .map(|v| self.m[(i, v)] * d_eff[(i, v)])
                            .sum();
                        obj.source.row_weights[i] * through_mapping
                            + count_grad
                            + w.filter_regulariser * (1.0 - 2.0 * f[i]) / n_rows as f64
                    })
                    .collect();
                Some(sigmoid_backward(f, &d_f))
            }
            _ => None,
        };

        Gradient { logits, filter }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::assignment::AssignmentParams;
    use crate::core::params::InitStrategy;
    use faer::mat;

    fn toy_source() -> Mat<f64> {
        mat![
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 0.0, 1.0]
        ]
    }

    fn toy_target() -> Mat<f64> {
        mat![[1.0, 0.5, 0.0], [0.0, 0.5, 1.0]]
    }

    fn objective_from(
        source: MatRef<f64>,
        target: MatRef<f64>,
        row_weights: Vec<f64>,
        priors: &SpatialPriors,
        kind: ObjectiveKind,
    ) -> Objective {
        let src = prepare_source(source, row_weights, priors.gene_weights.as_deref()).unwrap();
        let tgt = prepare_target(source, target, priors).unwrap();
        Objective::new(Arc::new(src), tgt, kind).unwrap()
    }

    fn loss_at(obj: &Objective, params: &AssignmentParams, weights: &LossWeights) -> f64 {
        let (m, log_m) = params.probabilities();
        let filter = params.filter();
        obj.evaluate(m.as_ref(), log_m.as_ref(), filter.as_deref(), weights)
            .unwrap()
            .total()
    }

    /// Compare the analytic gradient against central differences
    fn check_gradient(obj: &Objective, params: &mut AssignmentParams, weights: &LossWeights) {
        let (m, log_m) = params.probabilities();
        let filter = params.filter();
        let grad = obj
            .evaluate(m.as_ref(), log_m.as_ref(), filter.as_deref(), weights)
            .unwrap()
            .gradient();

        let h = 1e-6;
        for k in 0..grad.logits.len() {
            let orig = params.buffers_mut().0[k];
            params.buffers_mut().0[k] = orig + h;
            let up = loss_at(obj, params, weights);
            params.buffers_mut().0[k] = orig - h;
            let down = loss_at(obj, params, weights);
            params.buffers_mut().0[k] = orig;
            let numeric = (up - down) / (2.0 * h);
            assert!(
                (numeric - grad.logits[k]).abs() < 1e-5,
                "Logit {}: numeric {} vs analytic {}",
                k,
                numeric,
                grad.logits[k]
            );
        }

        if let Some(fg) = &grad.filter {
            for k in 0..fg.len() {
                let orig = params.buffers_mut().1.unwrap()[k];
                params.buffers_mut().1.unwrap()[k] = orig + h;
                let up = loss_at(obj, params, weights);
                params.buffers_mut().1.unwrap()[k] = orig - h;
                let down = loss_at(obj, params, weights);
                params.buffers_mut().1.unwrap()[k] = orig;
                let numeric = (up - down) / (2.0 * h);
                assert!(
                    (numeric - fg[k]).abs() < 1e-5,
                    "Filter logit {}: numeric {} vs analytic {}",
                    k,
                    numeric,
                    fg[k]
                );
            }
        }
    }

    #[test]
    fn test_voxel_term_is_scale_invariant() {
        let source = toy_source();
        let target = toy_target();
        let priors = SpatialPriors::default();
        let weights = LossWeights::expression_only();
        let params = AssignmentParams::new(4, 2, false, InitStrategy::Normal, 3);
        let (m, log_m) = params.probabilities();

        let base = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 4],
            &priors,
            ObjectiveKind::Cells,
        );
        let base_loss = base
            .evaluate(m.as_ref(), log_m.as_ref(), None, &weights)
            .unwrap()
            .breakdown
            .voxel_similarity;

        let mut scaled_source = source.clone();
        for j in 0..3 {
            scaled_source[(2, j)] *= 2.0;
        }
        let mut scaled_target = target.clone();
        for j in 0..3 {
            scaled_target[(1, j)] *= 7.5;
        }
        let scaled = objective_from(
            scaled_source.as_ref(),
            scaled_target.as_ref(),
            vec![1.0; 4],
            &priors,
            ObjectiveKind::Cells,
        );
        let scaled_loss = scaled
            .evaluate(m.as_ref(), log_m.as_ref(), None, &weights)
            .unwrap()
            .breakdown
            .voxel_similarity;

        assert!((base_loss - scaled_loss).abs() < 1e-12);
    }

    #[test]
    fn test_expression_only_total_equals_voxel_term() {
        let source = toy_source();
        let target = toy_target();
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 4],
            &SpatialPriors::default(),
            ObjectiveKind::Cells,
        );
        let params = AssignmentParams::new(4, 2, false, InitStrategy::Uniform, 11);
        let (m, log_m) = params.probabilities();
        let eval = obj
            .evaluate(m.as_ref(), log_m.as_ref(), None, &LossWeights::expression_only())
            .unwrap();
        assert_eq!(eval.breakdown.total, eval.breakdown.voxel_similarity);
        assert_eq!(eval.breakdown.density, 0.0);
    }

    #[test]
    fn test_perfect_prediction_has_zero_voxel_loss() {
        let source = mat![[1.0, 0.0], [0.0, 1.0]];
        let target = mat![[2.0, 0.0], [0.0, 3.0]];
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 2],
            &SpatialPriors::default(),
            ObjectiveKind::Cells,
        );
        let m = mat![[1.0, 0.0], [0.0, 1.0]];
        let log_m = mat![[0.0, -1e3], [-1e3, 0.0]];
        let eval = obj
            .evaluate(m.as_ref(), log_m.as_ref(), None, &LossWeights::default())
            .unwrap();
        assert!(eval.breakdown.voxel_similarity.abs() < 1e-12);
        // uniform prior and one cell per voxel
        assert!(eval.breakdown.density.abs() < 1e-12);
    }

    #[test]
    fn test_zero_norm_source_row_is_rejected() {
        let source = mat![[1.0, 0.0], [0.0, 0.0]];
        let res = prepare_source(source.as_ref(), vec![1.0; 2], None);
        match res {
            Err(MappingError::NumericalInstability { index, axis, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(axis, "source row");
            }
            _ => panic!("Expected a numerical instability"),
        }

        // gene weights can zero out a row as well
        let source = mat![[1.0, 0.0], [1.0, 1.0]];
        let res = prepare_source(source.as_ref(), vec![1.0; 2], Some(&[0.0, 1.0]));
        assert!(matches!(
            res,
            Err(MappingError::NumericalInstability { index: 0, .. })
        ));
    }

    #[test]
    fn test_zero_norm_voxel_row_is_rejected() {
        let source = toy_source();
        let target = mat![[1.0, 0.5, 0.0], [0.0, 0.0, 0.0]];
        let res = prepare_target(source.as_ref(), target.as_ref(), &SpatialPriors::default());
        match res {
            Err(MappingError::NumericalInstability {
                term, axis, index, epoch,
            }) => {
                assert_eq!(term, LossTerm::VoxelSimilarity);
                assert_eq!(axis, "voxel");
                assert_eq!(index, 1);
                assert_eq!(epoch, None);
            }
            _ => panic!("Expected a numerical instability"),
        }

        // voxel 1 only expresses a gene with zero weight
        let target = mat![[1.0, 0.5, 0.0], [0.0, 0.5, 0.0]];
        let priors = SpatialPriors {
            gene_weights: Some(vec![1.0, 0.0, 1.0]),
            ..Default::default()
        };
        assert!(matches!(
            prepare_target(source.as_ref(), target.as_ref(), &priors),
            Err(MappingError::NumericalInstability {
                axis: "voxel",
                index: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        let source = toy_source();
        let wrong_genes = mat![[1.0, 0.0], [0.0, 1.0]];
        assert!(matches!(
            prepare_target(source.as_ref(), wrong_genes.as_ref(), &SpatialPriors::default()),
            Err(MappingError::ShapeMismatch { .. })
        ));

        let negative = mat![[1.0, -0.5, 0.0]];
        assert!(matches!(
            prepare_target(source.as_ref(), negative.as_ref(), &SpatialPriors::default()),
            Err(MappingError::InvalidInput(_))
        ));

        let priors = SpatialPriors {
            density_prior: DensityPrior::Custom(vec![1.0]),
            ..Default::default()
        };
        assert!(matches!(
            prepare_target(source.as_ref(), toy_target().as_ref(), &priors),
            Err(MappingError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_rna_count_prior() {
        let source = toy_source();
        let target = mat![[1.0, 1.0, 0.0], [0.0, 1.0, 2.0]];
        let priors = SpatialPriors {
            density_prior: DensityPrior::RnaCountBased,
            ..Default::default()
        };
        let tgt = prepare_target(source.as_ref(), target.as_ref(), &priors).unwrap();
        assert!((tgt.density_prior[0] - 0.4).abs() < 1e-12);
        assert!((tgt.density_prior[1] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_target_subset_rescales_side_information() {
        let source = toy_source();
        let target = mat![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let priors = SpatialPriors {
            density_prior: DensityPrior::Custom(vec![1.0, 1.0, 2.0]),
            expected_counts: Some(vec![1.0, 1.0, 2.0]),
            gene_weights: None,
        };
        let tgt = prepare_target(source.as_ref(), target.as_ref(), &priors).unwrap();
        let sub = tgt.subset(&[1, 2], 6.0).unwrap();
        assert_eq!(sub.nrows(), 2);
        assert!((sub.density_prior[0] - 1.0 / 3.0).abs() < 1e-12);
        assert!((sub.density_prior[1] - 2.0 / 3.0).abs() < 1e-12);
        let counts = sub.expected_counts.unwrap();
        assert!((counts[0] - 2.0).abs() < 1e-12);
        assert!((counts[1] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_cell_mode_all_terms() {
        let source = toy_source();
        let target = mat![[1.0, 0.5, 0.2], [0.1, 0.5, 1.0], [0.3, 0.3, 0.3]];
        let priors = SpatialPriors {
            density_prior: DensityPrior::Custom(vec![0.5, 0.3, 0.2]),
            expected_counts: Some(vec![2.0, 1.0, 1.0]),
            gene_weights: Some(vec![1.0, 2.0, 0.5]),
        };
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 4],
            &priors,
            ObjectiveKind::Cells,
        );
        let weights = LossWeights {
            gene_similarity: 0.7,
            density: 1.3,
            count: 0.9,
            ..Default::default()
        };
        let mut params = AssignmentParams::new(4, 3, false, InitStrategy::Normal, 5);
        check_gradient(&obj, &mut params, &weights);
    }

    #[test]
    fn test_gradient_cluster_mode_with_entropy() {
        let source = mat![[1.0, 0.2, 0.0], [0.0, 1.0, 0.4], [0.3, 0.0, 1.0]];
        let target = toy_target();
        let priors = SpatialPriors {
            expected_counts: Some(vec![5.0, 4.0]),
            ..Default::default()
        };
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![5.0, 1.0, 3.0],
            &priors,
            ObjectiveKind::Clusters,
        );
        let weights = LossWeights {
            cluster_entropy: 0.5,
            ..Default::default()
        };
        let mut params = AssignmentParams::new(3, 2, false, InitStrategy::Normal, 9);
        check_gradient(&obj, &mut params, &weights);

        let (m, log_m) = params.probabilities();
        let eval = obj
            .evaluate(m.as_ref(), log_m.as_ref(), None, &weights)
            .unwrap();
        // negative entropy is never positive
        assert!(eval.breakdown.cluster_entropy <= 0.0);
    }

    #[test]
    fn test_gradient_constrained_mode() {
        let source = toy_source();
        let target = toy_target();
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 4],
            &SpatialPriors::default(),
            ObjectiveKind::Constrained { target_count: 2.0 },
        );
        let weights = LossWeights::default();
        let mut params = AssignmentParams::new(4, 2, true, InitStrategy::Normal, 21);
        check_gradient(&obj, &mut params, &weights);
    }

    #[test]
    fn test_constrained_mode_requires_filter() {
        let source = toy_source();
        let target = toy_target();
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 4],
            &SpatialPriors::default(),
            ObjectiveKind::Constrained { target_count: 2.0 },
        );
        let params = AssignmentParams::new(4, 2, false, InitStrategy::Zeros, 0);
        let (m, log_m) = params.probabilities();
        assert!(obj
            .evaluate(m.as_ref(), log_m.as_ref(), None, &LossWeights::default())
            .is_err());
    }

    #[test]
    fn test_gene_term_rejects_absent_gene() {
        // third gene absent from every source row
        let source = mat![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let target = toy_target();
        let obj = objective_from(
            source.as_ref(),
            target.as_ref(),
            vec![1.0; 2],
            &SpatialPriors::default(),
            ObjectiveKind::Cells,
        );
        let params = AssignmentParams::new(2, 2, false, InitStrategy::Zeros, 0);
        let (m, log_m) = params.probabilities();
        let weights = LossWeights {
            gene_similarity: 1.0,
            ..Default::default()
        };
        match obj.evaluate(m.as_ref(), log_m.as_ref(), None, &weights) {
            Err(MappingError::NumericalInstability { term, index, .. }) => {
                assert_eq!(term, LossTerm::GeneSimilarity);
                assert_eq!(index, 2);
            }
            _ => panic!("Expected a numerical instability"),
        }
        // without the gene term the same data is fine
        assert!(obj
            .evaluate(m.as_ref(), log_m.as_ref(), None, &LossWeights::default())
            .is_ok());
    }
}
