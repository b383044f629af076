/// Vector-like inputs accepted by [`Model::eval`](crate::model::Model::eval).
///
/// Compiled kernels read their inputs from one contiguous `f64` slice. This trait lets
/// standard vectors, fixed-size arrays and, behind features, `ndarray` and `nalgebra`
/// vectors hand over that slice without copying.
///
/// # Examples
///
/// ```rust
/// use lambdify_jit::prelude::Vector;
///
/// let vec: Vec<f64> = Vector::zeros(5);
/// assert_eq!(Vector::len(&vec), 5);
///
/// let arr = [1.0, 2.0, 3.0];
/// assert_eq!(Vector::as_slice(&arr)[0], 1.0);
/// ```
pub trait Vector {
    /// Returns the vector's data as a slice.
    fn as_slice(&self) -> &[f64];

    /// Returns the vector's data as a mutable slice.
    fn as_mut_slice(&mut self) -> &mut [f64];

    /// Creates a vector of length `len` filled with zeros.
    fn zeros(len: usize) -> Self;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Vector for Vec<f64> {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    fn zeros(len: usize) -> Self {
        vec![0.0; len]
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// `ndarray` vectors must be in standard layout; views with a stride other than one
/// are rejected with a panic.
#[cfg(feature = "ndarray")]
impl Vector for ndarray::Array1<f64> {
    fn as_slice(&self) -> &[f64] {
        ndarray::Array1::as_slice(self).expect("Array1 input must be contiguous")
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self.as_slice_mut().expect("Array1 input must be contiguous")
    }

    fn zeros(len: usize) -> Self {
        ndarray::Array1::zeros(len)
    }

    fn len(&self) -> usize {
        ndarray::Array1::len(self)
    }
}

#[cfg(feature = "nalgebra")]
impl Vector for nalgebra::DVector<f64> {
    fn as_slice(&self) -> &[f64] {
        nalgebra::DVector::as_slice(self)
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        nalgebra::DVector::as_mut_slice(self)
    }

    fn zeros(len: usize) -> Self {
        nalgebra::DVector::zeros(len)
    }

    fn len(&self) -> usize {
        nalgebra::DVector::len(self)
    }
}

impl<const N: usize> Vector for [f64; N] {
    fn as_slice(&self) -> &[f64] {
        self
    }

    fn as_mut_slice(&mut self) -> &mut [f64] {
        self
    }

    /// # Panics
    /// Panics if `len` differs from `N`.
    fn zeros(len: usize) -> Self {
        assert_eq!(len, N, "Array length must match const generic size");
        [0.0; N]
    }

    fn len(&self) -> usize {
        N
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;

    #[test]
    fn test_std_vectors() {
        let mut vec = <Vec<f64> as Vector>::zeros(3);
        vec.as_mut_slice()[1] = 2.0;
        assert_eq!(Vector::as_slice(&vec), &[0.0, 2.0, 0.0]);

        let arr = <[f64; 2] as Vector>::zeros(2);
        assert!(!Vector::is_empty(&arr));
    }

    #[test]
    #[should_panic(expected = "Array length must match")]
    fn test_array_zeros_wrong_length() {
        let _ = <[f64; 2] as Vector>::zeros(3);
    }

    #[cfg(feature = "ndarray")]
    #[test]
    fn test_ndarray_input() {
        let model = Model::new("x * y").unwrap();
        let input = ndarray::Array1::from(vec![2.0, 4.0]);
        assert_eq!(model.eval(&input).unwrap(), 8.0);
    }

    #[cfg(feature = "nalgebra")]
    #[test]
    fn test_nalgebra_input() {
        let model = Model::new("x - y").unwrap();
        let input = nalgebra::DVector::from_vec(vec![2.0, 4.0]);
        assert_eq!(model.eval(&input).unwrap(), -2.0);
    }

    #[test]
    fn test_model_accepts_arrays_and_vecs() {
        let model = Model::new("x + y").unwrap();
        assert_eq!(model.eval(&[1.0, 2.0]).unwrap(), 3.0);
        assert_eq!(model.eval(&vec![1.0, 2.0]).unwrap(), 3.0);
    }
}
