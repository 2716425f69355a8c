///////////////////
// Matrix macros //
///////////////////

/// Early return a `ShapeMismatch` if two matrices have a different number
/// of columns.
#[macro_export]
macro_rules! ensure_ncols {
    ($matrix1:expr, $matrix2:expr, $what:expr) => {
        if $matrix1.ncols() != $matrix2.ncols() {
            return Err($crate::core::errors::MappingError::ShapeMismatch {
                what: $what.to_string(),
                expected: $matrix1.ncols(),
                found: $matrix2.ncols(),
            });
        }
    };
}

/// Early return a `ShapeMismatch` if a matrix does not have the expected
/// number of rows.
#[macro_export]
macro_rules! ensure_nrows {
    ($matrix:expr, $expected:expr, $what:expr) => {
        if $matrix.nrows() != $expected {
            return Err($crate::core::errors::MappingError::ShapeMismatch {
                what: $what.to_string(),
                expected: $expected,
                found: $matrix.nrows(),
            });
        }
    };
}

///////////////////
// Vector macros //
///////////////////

/// Early return a `ShapeMismatch` if a slice does not have the expected
/// length.
#[macro_export]
macro_rules! ensure_len {
    ($vec:expr, $expected:expr, $what:expr) => {
        if $vec.len() != $expected {
            return Err($crate::core::errors::MappingError::ShapeMismatch {
                what: $what.to_string(),
                expected: $expected,
                found: $vec.len(),
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use crate::core::errors::MappingError;
    use faer::Mat;

    fn check_cols(a: &Mat<f64>, b: &Mat<f64>) -> Result<(), MappingError> {
        ensure_ncols!(a, b, "genes");
        Ok(())
    }

    fn check_len(v: &[f64], n: usize) -> Result<(), MappingError> {
        ensure_len!(v, n, "gene weights");
        Ok(())
    }

    #[test]
    fn test_ensure_ncols() {
        let a: Mat<f64> = Mat::zeros(2, 3);
        let b: Mat<f64> = Mat::zeros(4, 3);
        let c: Mat<f64> = Mat::zeros(4, 5);

        assert!(check_cols(&a, &b).is_ok());
        match check_cols(&a, &c) {
            Err(MappingError::ShapeMismatch {
                expected, found, ..
            }) => {
                assert_eq!(expected, 3);
                assert_eq!(found, 5);
            }
            _ => panic!("Expected a shape mismatch"),
        }
    }

    #[test]
    fn test_ensure_len() {
        assert!(check_len(&[1.0, 2.0], 2).is_ok());
        assert!(matches!(
            check_len(&[1.0], 2),
            Err(MappingError::ShapeMismatch { .. })
        ));
    }
}
