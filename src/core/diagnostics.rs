use faer::MatRef;
use rayon::prelude::*;

use crate::utils::general::*;

/// Training score of one gene
///
/// ### Fields
///
/// * `gene` - Column index in the shared gene axis
/// * `score` - Cosine similarity between the predicted and observed spatial
///   profile of the gene across voxels. `None` if either profile is all zero.
/// * `sparsity_source` - Fraction of cells with zero expression
/// * `sparsity_target` - Fraction of voxels with zero expression
/// * `sparsity_diff` - `sparsity_target - sparsity_source`
#[derive(Clone, Debug, PartialEq)]
pub struct GeneScore {
    pub gene: usize,
    pub score: Option<f64>,
    pub sparsity_source: f64,
    pub sparsity_target: f64,
    pub sparsity_diff: f64,
}

/// Per-gene agreement between prediction and spatial data
///
/// Genes with a low score despite low sparsity usually point at a mismatch
/// in the harmonisation of the two data sets.
///
/// ### Params
///
/// * `pred` - Predicted spatial profiles (voxels × genes)
/// * `target` - Observed spatial profiles on the same scale (voxels × genes)
/// * `source_raw` - The single cell matrix as supplied (cells × genes)
/// * `target_raw` - The spatial matrix as supplied (voxels × genes)
///
/// ### Returns
///
/// One `GeneScore` per gene, in gene order.
pub fn gene_training_scores(
    pred: MatRef<f64>,
    target: MatRef<f64>,
    source_raw: MatRef<f64>,
    target_raw: MatRef<f64>,
) -> Vec<GeneScore> {
    let sparsity_source = col_sparsity(source_raw);
    let sparsity_target = col_sparsity(target_raw);

    (0..pred.ncols())
        .into_par_iter()
        .map(|g| {
            let a = col_to_vec(pred, g);
            let b = col_to_vec(target, g);
            let denom = l2_norm(&a) * l2_norm(&b);
            let score = if denom > 0.0 {
                Some(dot(&a, &b) / denom)
            } else {
                None
            };
            GeneScore {
                gene: g,
                score,
                sparsity_source: sparsity_source[g],
                sparsity_target: sparsity_target[g],
                sparsity_diff: sparsity_target[g] - sparsity_source[g],
            }
        })
        .collect()
}

/// Entropy of every row of an assignment matrix
///
/// The entropy is taken in base `n_voxels`, so `0` means a row concentrated
/// on a single voxel and `1` a row spread evenly over all voxels.
///
/// ### Params
///
/// * `assignment` - Row-stochastic assignment matrix
///
/// ### Returns
///
/// Normalised entropy per row; all zero with a single voxel.
pub fn mapping_entropy(assignment: MatRef<f64>) -> Vec<f64> {
    let n_voxels = assignment.ncols();
    let log_base = if n_voxels > 1 {
        (n_voxels as f64).ln()
    } else {
        1.0
    };
    (0..assignment.nrows())
        .into_par_iter()
        .map(|i| entropy(&row_to_vec(assignment, i)) / log_base)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_gene_scores() {
        let pred = mat![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let target = mat![[2.0, 0.0, 1.0], [0.0, 3.0, 1.0]];
        let source_raw = mat![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0], [1.0, 0.0, 0.0]];

        let scores = gene_training_scores(
            pred.as_ref(),
            target.as_ref(),
            source_raw.as_ref(),
            target.as_ref(),
        );
        assert_eq!(scores.len(), 3);
        assert!((scores[0].score.unwrap() - 1.0).abs() < 1e-12);
        assert!((scores[1].score.unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(scores[2].score, None);
        assert!((scores[1].sparsity_source - 0.75).abs() < 1e-12);
        assert!((scores[1].sparsity_target - 0.5).abs() < 1e-12);
        assert!((scores[1].sparsity_diff + 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_mapping_entropy() {
        let m = mat![[0.5, 0.5], [1.0, 0.0]];
        let h = mapping_entropy(m.as_ref());
        assert!((h[0] - 1.0).abs() < 1e-12);
        assert_eq!(h[1], 0.0);

        let m = mat![[0.25, 0.25, 0.25, 0.25], [0.5, 0.5, 0.0, 0.0]];
        let h = mapping_entropy(m.as_ref());
        assert!((h[0] - 1.0).abs() < 1e-12);
        assert!((h[1] - 0.5).abs() < 1e-12);

        let single = mat![[1.0], [1.0]];
        assert_eq!(mapping_entropy(single.as_ref()), vec![0.0, 0.0]);
    }
}
