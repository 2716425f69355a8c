use faer::{Mat, MatRef};
use rayon::prelude::*;

//////////////////
// VECTOR STUFF //
//////////////////

/// Flatten a nested vector
///
/// ### Params
///
/// * `vec` - The vector to flatten
///
/// ### Returns
///
/// The flattened vector
pub fn flatten_vector<I, T>(vec: I) -> Vec<T>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = T>,
{
    vec.into_iter().flatten().collect()
}

/// Dot product of two slices of the same length
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2 norm of a slice
pub fn l2_norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Numerically stable log-sum-exp
///
/// ### Params
///
/// * `x` - The values
///
/// ### Returns
///
/// `ln(sum(exp(x)))`. Returns negative infinity for an empty slice.
pub fn log_sum_exp(x: &[f64]) -> f64 {
    let max_val = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max_val.is_finite() {
        return max_val;
    }
    let sum: f64 = x.iter().map(|v| (v - max_val).exp()).sum();
    max_val + sum.ln()
}

/// Logistic sigmoid
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Shannon entropy (natural log) of a probability vector
///
/// Zero entries contribute nothing.
pub fn entropy(p: &[f64]) -> f64 {
    -p.iter()
        .filter(|&&x| x > 0.0)
        .map(|&x| x * x.ln())
        .sum::<f64>()
}

//////////////////
// MATRIX STUFF //
//////////////////

/// Copy a matrix row into a vector
pub fn row_to_vec(mat: MatRef<f64>, i: usize) -> Vec<f64> {
    mat.row(i).iter().copied().collect()
}

/// Copy a matrix column into a vector
pub fn col_to_vec(mat: MatRef<f64>, j: usize) -> Vec<f64> {
    mat.col(j).iter().copied().collect()
}

/// Calculates the column sums of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise sums
///
/// ### Returns
///
/// Vector of the column sums.
pub fn col_sums(mat: MatRef<f64>) -> Vec<f64> {
    let n_rows = mat.nrows();
    let ones = Mat::from_fn(n_rows, 1, |_, _| 1.0);
    let col_sums = ones.transpose() * mat;

    col_sums.row(0).iter().cloned().collect()
}

/// Calculates the row sums of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the row-wise sums
///
/// ### Returns
///
/// Vector of the row sums.
pub fn row_sums(mat: MatRef<f64>) -> Vec<f64> {
    (0..mat.nrows())
        .into_par_iter()
        .map(|i| mat.row(i).iter().sum())
        .collect()
}

/// Row-wise L2 normalisation
///
/// ### Params
///
/// * `mat` - The matrix whose rows to normalise
///
/// ### Returns
///
/// The row-normalised matrix, or `Err(i)` with the index of the first row
/// whose norm is zero or not finite.
pub fn normalise_matrix_row_l2(mat: MatRef<f64>) -> Result<Mat<f64>, usize> {
    let norms: Vec<f64> = (0..mat.nrows())
        .into_par_iter()
        .map(|i| mat.row(i).iter().map(|x| x * x).sum::<f64>().sqrt())
        .collect();

    if let Some(bad) = norms.iter().position(|n| !(n.is_finite() && *n > 0.0)) {
        return Err(bad);
    }

    Ok(Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| {
        mat[(i, j)] / norms[i]
    }))
}

/// Scale the columns of a matrix by per-column factors
///
/// ### Params
///
/// * `mat` - The matrix
/// * `factors` - One factor per column
///
/// ### Returns
///
/// The scaled matrix.
pub fn scale_matrix_cols(mat: MatRef<f64>, factors: &[f64]) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| mat[(i, j)] * factors[j])
}

/// Scale the rows of a matrix by per-row factors
///
/// ### Params
///
/// * `mat` - The matrix
/// * `factors` - One factor per row
///
/// ### Returns
///
/// The scaled matrix.
pub fn scale_matrix_rows(mat: MatRef<f64>, factors: &[f64]) -> Mat<f64> {
    Mat::from_fn(mat.nrows(), mat.ncols(), |i, j| mat[(i, j)] * factors[i])
}

/// Select a subset of rows into an owned matrix
///
/// This function will panic if you try to select indices larger than the
/// underlying matrix.
///
/// ### Params
///
/// * `mat` - The original matrix
/// * `row_indices` - The row indices you want to slice out.
///
/// ### Returns
///
/// Owned matrix with the selected rows in the given order.
pub fn mat_select_rows(mat: MatRef<f64>, row_indices: &[usize]) -> Mat<f64> {
    Mat::from_fn(row_indices.len(), mat.ncols(), |i, j| {
        mat[(row_indices[i], j)]
    })
}

/// Build a matrix from a row-major buffer
///
/// ### Params
///
/// * `data` - Row-major values of length `nrow * ncol`
/// * `nrow` - Number of rows
/// * `ncol` - Number of columns
///
/// ### Returns
///
/// The faer matrix.
pub fn row_major_to_faer_mat(data: &[f64], nrow: usize, ncol: usize) -> Mat<f64> {
    Mat::from_fn(nrow, ncol, |i, j| data[j + i * ncol])
}

/// Fraction of zero entries per column
///
/// ### Params
///
/// * `mat` - The matrix
///
/// ### Returns
///
/// Per column, the proportion of rows with an exact zero.
pub fn col_sparsity(mat: MatRef<f64>) -> Vec<f64> {
    let n_rows = mat.nrows().max(1) as f64;
    (0..mat.ncols())
        .into_par_iter()
        .map(|j| mat.col(j).iter().filter(|&&x| x == 0.0).count() as f64 / n_rows)
        .collect()
}
