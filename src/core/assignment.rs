use faer::{Mat, MatRef};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

use crate::core::params::InitStrategy;
use crate::utils::general::*;

/// Unconstrained parameters behind the assignment matrix
///
/// The logits are stored row-major (rows = cells or clusters, columns =
/// voxels). The assignment matrix is produced by a row-wise softmax, so every
/// row is a probability distribution over voxels irrespective of the logit
/// values. In constrained mode an additional logit per row parameterises the
/// cell filter through a sigmoid.
///
/// ### Fields
///
/// * `n_rows` - Number of cells or clusters
/// * `n_cols` - Number of voxels
/// * `logits` - Row-major assignment logits
/// * `filter_logits` - Optional filter logits, one per row
#[derive(Clone, Debug)]
pub struct AssignmentParams {
    n_rows: usize,
    n_cols: usize,
    logits: Vec<f64>,
    filter_logits: Option<Vec<f64>>,
}

impl AssignmentParams {
    /// Initialise the parameters
    ///
    /// ### Params
    ///
    /// * `n_rows` - Number of cells or clusters
    /// * `n_cols` - Number of voxels
    /// * `with_filter` - Shall filter logits be allocated (constrained mode)
    /// * `init` - Initialisation strategy
    /// * `seed` - Seed for reproducibility
    ///
    /// ### Returns
    ///
    /// Initialised `AssignmentParams`.
    pub fn new(
        n_rows: usize,
        n_cols: usize,
        with_filter: bool,
        init: InitStrategy,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let logits = draw_logits(n_rows * n_cols, init, &mut rng);
        let filter_logits = if with_filter {
            Some(draw_logits(n_rows, init, &mut rng))
        } else {
            None
        };

        Self {
            n_rows,
            n_cols,
            logits,
            filter_logits,
        }
    }

    /// Mutable access to the assignment logits and the optional filter logits
    pub fn buffers_mut(&mut self) -> (&mut [f64], Option<&mut [f64]>) {
        (
            self.logits.as_mut_slice(),
            self.filter_logits.as_deref_mut(),
        )
    }

    /// Produce the assignment matrix and its element-wise logarithm
    ///
    /// Uses a max-shifted row softmax; the log-probabilities are computed
    /// directly as `logit - logsumexp(row)`. They stay finite where the
    /// probability underflows, unless the logit spread within a row
    /// overflows.
    ///
    /// ### Returns
    ///
    /// Tuple of `(M, log M)`, both rows × voxels.
    pub fn probabilities(&self) -> (Mat<f64>, Mat<f64>) {
        let n_cols = self.n_cols;
        let log_probs: Vec<f64> = self
            .logits
            .par_chunks(n_cols.max(1))
            .flat_map_iter(|row| {
                let lse = log_sum_exp(row);
                row.iter().map(move |x| x - lse).collect::<Vec<f64>>()
            })
            .collect();

        let log_m = row_major_to_faer_mat(&log_probs, self.n_rows, n_cols);
        let m = Mat::from_fn(self.n_rows, n_cols, |i, j| log_m[(i, j)].exp());

        (m, log_m)
    }

    /// Produce the cell filter probabilities
    ///
    /// ### Returns
    ///
    /// `Some(sigmoid(f))` in constrained mode, `None` otherwise.
    pub fn filter(&self) -> Option<Vec<f64>> {
        self.filter_logits
            .as_ref()
            .map(|f| f.iter().map(|&x| sigmoid(x)).collect())
    }
}

/// Draw initial logits
fn draw_logits(n: usize, init: InitStrategy, rng: &mut StdRng) -> Vec<f64> {
    match init {
        InitStrategy::Zeros => vec![0.0; n],
        InitStrategy::Uniform => (0..n).map(|_| rng.random::<f64>()).collect(),
        InitStrategy::Normal => (0..n).map(|_| rng.sample(StandardNormal)).collect(),
    }
}

/// Back-propagate through the row softmax
///
/// For `M = softmax(W)` row-wise and an upstream gradient `g = dL/dM`:
///
/// ```dL/dW_iv = M_iv * (g_iv - sum_u M_iu * g_iu)```
///
/// ### Params
///
/// * `probs` - The assignment matrix `M`
/// * `grad` - The upstream gradient w.r.t. `M`
///
/// ### Returns
///
/// Row-major gradient w.r.t. the logits.
pub fn softmax_backward(probs: MatRef<f64>, grad: MatRef<f64>) -> Vec<f64> {
    let n_cols = probs.ncols();
    let rows: Vec<Vec<f64>> = (0..probs.nrows())
        .into_par_iter()
        .map(|i| {
            let inner: f64 = (0..n_cols).map(|j| probs[(i, j)] * grad[(i, j)]).sum();
            (0..n_cols)
                .map(|j| probs[(i, j)] * (grad[(i, j)] - inner))
                .collect()
        })
        .collect();

    flatten_vector(rows)
}

/// Back-propagate through the element-wise sigmoid
///
/// ### Params
///
/// * `filter` - `sigmoid(f)`
/// * `grad` - The upstream gradient w.r.t. the filter
///
/// ### Returns
///
/// Gradient w.r.t. the filter logits.
pub fn sigmoid_backward(filter: &[f64], grad: &[f64]) -> Vec<f64> {
    filter
        .iter()
        .zip(grad)
        .map(|(&f, &g)| g * f * (1.0 - f))
        .collect()
}
