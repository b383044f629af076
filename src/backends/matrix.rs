/// Matrix-like outputs filled by
/// [`ModelSystem::jacobian_into`](crate::system::ModelSystem::jacobian_into).
///
/// The flat slices expose the storage order of the implementing type. Row-major is
/// assumed by the default [`Matrix::set`]: element `(i, j)` of an `(m, n)` matrix sits
/// at index `i * n + j`.
pub trait Matrix {
    /// Returns the matrix data as a flat slice in storage order.
    fn flat_slice(&self) -> &[f64];

    /// Returns the matrix data as a flat, mutable slice in storage order.
    fn flat_mut_slice(&mut self) -> &mut [f64];

    /// Creates a `rows` x `cols` matrix filled with zeros.
    fn zeros(rows: usize, cols: usize) -> Self;

    /// Returns `(rows, columns)`.
    fn dims(&self) -> (usize, usize);

    /// Writes element `(row, col)`.
    fn set(&mut self, row: usize, col: usize, value: f64) {
        let (_, cols) = self.dims();
        self.flat_mut_slice()[row * cols + col] = value;
    }
}

/// Row-major `Vec<Vec<f64>>` cannot hand out one flat slice, so a plain `Vec<f64>` with
/// explicit dimensions is used instead.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl DenseMatrix {
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Splits the data into one vector per row.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.data
            .chunks(self.cols.max(1))
            .take(self.rows)
            .map(<[f64]>::to_vec)
            .collect()
    }
}

impl Matrix for DenseMatrix {
    fn flat_slice(&self) -> &[f64] {
        &self.data
    }

    fn flat_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![0.0; rows * cols],
            rows,
            cols,
        }
    }

    fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }
}

/// `ndarray` matrices must be in standard (row-major) layout.
#[cfg(feature = "ndarray")]
impl Matrix for ndarray::Array2<f64> {
    fn flat_slice(&self) -> &[f64] {
        self.as_slice().expect("Array2 output must be in standard layout")
    }

    fn flat_mut_slice(&mut self) -> &mut [f64] {
        self.as_slice_mut()
            .expect("Array2 output must be in standard layout")
    }

    fn zeros(rows: usize, cols: usize) -> Self {
        ndarray::Array2::zeros((rows, cols))
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }
}

/// `nalgebra` stores matrices column-major, so the flat slice of a `DMatrix` is its
/// columns one after the other; [`Matrix::set`] accounts for that.
#[cfg(feature = "nalgebra")]
impl Matrix for nalgebra::DMatrix<f64> {
    fn flat_slice(&self) -> &[f64] {
        self.as_slice()
    }

    fn flat_mut_slice(&mut self) -> &mut [f64] {
        self.as_mut_slice()
    }

    fn zeros(rows: usize, cols: usize) -> Self {
        nalgebra::DMatrix::zeros(rows, cols)
    }

    fn dims(&self) -> (usize, usize) {
        (self.nrows(), self.ncols())
    }

    fn set(&mut self, row: usize, col: usize, value: f64) {
        self[(row, col)] = value;
    }
}
