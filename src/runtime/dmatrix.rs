//! Feature matrices consumed by the predictor.
//!
//! Two concrete layouts behind one trait seam: [`DenseMatrix`] (row-major,
//! NaN = missing) and [`CsrMatrix`] (compressed sparse rows, absence =
//! missing). Matrices are immutable once constructed and only ever borrowed
//! by the predictor.

use super::entry::Entry;

/// Read-only batch of feature rows.
///
/// `fill_row` must overwrite every slot of `buf`; the predictor reuses one
/// buffer across rows.
pub trait DataMatrix {
    /// Number of rows.
    fn num_rows(&self) -> usize;

    /// Number of feature columns.
    fn num_features(&self) -> usize;

    /// Write row `row` into `buf` as entry-union slots.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds or `buf` is shorter than
    /// `num_features()`.
    fn fill_row(&self, row: usize, buf: &mut [Entry]);
}

// =============================================================================
// DenseMatrix
// =============================================================================

/// Dense row-major matrix of `f64` features.
///
/// Missing values are represented as NaN.
///
/// # Example
///
/// ```
/// use lumber::runtime::DenseMatrix;
///
/// let m = DenseMatrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
/// assert_eq!(m.row_slice(1), &[4.0, 5.0, 6.0]);
/// ```
#[derive(Debug, Clone)]
pub struct DenseMatrix {
    data: Box<[f64]>,
    num_rows: usize,
    num_cols: usize,
}

impl DenseMatrix {
    /// Create a dense matrix from a row-major Vec, taking ownership.
    ///
    /// # Panics
    ///
    /// Panics if `data.len() != num_rows * num_cols`.
    pub fn from_vec(data: Vec<f64>, num_rows: usize, num_cols: usize) -> Self {
        assert_eq!(
            data.len(),
            num_rows * num_cols,
            "data length {} does not match dimensions {}x{}",
            data.len(),
            num_rows,
            num_cols
        );
        Self {
            data: data.into_boxed_slice(),
            num_rows,
            num_cols,
        }
    }

    /// Single-row matrix.
    pub fn from_row(row: &[f64]) -> Self {
        Self::from_vec(row.to_vec(), 1, row.len())
    }

    /// One row as a contiguous slice.
    ///
    /// # Panics
    ///
    /// Panics if `row` is out of bounds.
    #[inline]
    pub fn row_slice(&self, row: usize) -> &[f64] {
        assert!(row < self.num_rows, "row index {row} out of bounds");
        let start = row * self.num_cols;
        &self.data[start..start + self.num_cols]
    }

    /// Whether any element is NaN.
    pub fn has_missing(&self) -> bool {
        self.data.iter().any(|v| v.is_nan())
    }
}

impl DataMatrix for DenseMatrix {
    #[inline]
    fn num_rows(&self) -> usize {
        self.num_rows
    }

    #[inline]
    fn num_features(&self) -> usize {
        self.num_cols
    }

    fn fill_row(&self, row: usize, buf: &mut [Entry]) {
        let slice = self.row_slice(row);
        for (slot, &value) in buf[..self.num_cols].iter_mut().zip(slice) {
            *slot = Entry::from_value(value);
        }
    }
}

// =============================================================================
// CsrMatrix
// =============================================================================

/// Compressed sparse row matrix of `f64` features.
///
/// Row `i` holds `(col_indices[k], values[k])` for
/// `k in row_ptr[i]..row_ptr[i + 1]`, with column indices strictly increasing
/// within a row. Absent entries are missing (not zero).
#[derive(Debug, Clone)]
pub struct CsrMatrix {
    values: Box<[f64]>,
    col_indices: Box<[u32]>,
    row_ptr: Box<[u32]>,
    num_cols: usize,
}

impl CsrMatrix {
    /// Create a CSR matrix from raw arrays.
    ///
    /// # Panics
    ///
    /// Panics when the arrays are inconsistent: `row_ptr` not monotonically
    /// non-decreasing or not ending at `values.len()`, `values` and
    /// `col_indices` of different lengths, or a column index out of range
    /// or out of order within its row.
    pub fn new(values: Vec<f64>, col_indices: Vec<u32>, row_ptr: Vec<u32>, num_cols: usize) -> Self {
        assert_eq!(
            values.len(),
            col_indices.len(),
            "values and col_indices lengths differ"
        );
        assert!(!row_ptr.is_empty(), "row_ptr must have at least one entry");
        assert_eq!(
            *row_ptr.last().expect("row_ptr is non-empty") as usize,
            values.len(),
            "row_ptr must end at nnz"
        );
        for window in row_ptr.windows(2) {
            assert!(window[0] <= window[1], "row_ptr must be non-decreasing");
            let row = &col_indices[window[0] as usize..window[1] as usize];
            for pair in row.windows(2) {
                assert!(pair[0] < pair[1], "column indices must increase within a row");
            }
            if let Some(&last) = row.last() {
                assert!((last as usize) < num_cols, "column index {last} out of range");
            }
        }
        Self {
            values: values.into_boxed_slice(),
            col_indices: col_indices.into_boxed_slice(),
            row_ptr: row_ptr.into_boxed_slice(),
            num_cols,
        }
    }

    /// Build a CSR matrix from a dense one, omitting zeros and NaNs.
    pub fn from_dense(dense: &DenseMatrix) -> Self {
        let mut values = Vec::new();
        let mut col_indices = Vec::new();
        let mut row_ptr = vec![0u32];
        for row in 0..dense.num_rows() {
            for (col, &value) in dense.row_slice(row).iter().enumerate() {
                if value != 0.0 && !value.is_nan() {
                    values.push(value);
                    col_indices.push(col as u32);
                }
            }
            row_ptr.push(values.len() as u32);
        }
        Self::new(values, col_indices, row_ptr, dense.num_features())
    }

    /// Number of stored entries.
    #[inline]
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Iterate over `(column, value)` pairs of one row.
    pub fn row_iter(&self, row: usize) -> impl Iterator<Item = (u32, f64)> + '_ {
        let start = self.row_ptr[row] as usize;
        let end = self.row_ptr[row + 1] as usize;
        self.col_indices[start..end]
            .iter()
            .copied()
            .zip(self.values[start..end].iter().copied())
    }
}

impl DataMatrix for CsrMatrix {
    #[inline]
    fn num_rows(&self) -> usize {
        self.row_ptr.len() - 1
    }

    #[inline]
    fn num_features(&self) -> usize {
        self.num_cols
    }

    fn fill_row(&self, row: usize, buf: &mut [Entry]) {
        assert!(row < self.num_rows(), "row index {row} out of bounds");
        for slot in buf[..self.num_cols].iter_mut() {
            *slot = Entry::MISSING;
        }
        for (col, value) in self.row_iter(row) {
            buf[col as usize] = Entry::from_value(value);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_shape_and_rows() {
        let m = DenseMatrix::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        assert_eq!(m.num_rows(), 2);
        assert_eq!(m.num_features(), 3);
        assert_eq!(m.row_slice(0), &[1.0, 2.0, 3.0]);
        assert_eq!(m.row_slice(1), &[4.0, 5.0, 6.0]);
    }

    #[test]
    #[should_panic(expected = "does not match dimensions")]
    fn dense_wrong_size_panics() {
        DenseMatrix::from_vec(vec![1.0, 2.0, 3.0], 2, 2);
    }

    #[test]
    fn dense_fill_row_marks_nan_missing() {
        let m = DenseMatrix::from_vec(vec![1.5, f64::NAN], 1, 2);
        assert!(m.has_missing());
        let mut buf = [Entry::MISSING; 2];
        m.fill_row(0, &mut buf);
        assert!(!buf[0].is_missing());
        assert_eq!(buf[0].value(), 1.5);
        assert!(buf[1].is_missing());
    }

    #[test]
    fn csr_from_dense_omits_zeros_and_nans() {
        let dense = DenseMatrix::from_vec(
            vec![
                1.0, 0.0, 2.0, //
                0.0, f64::NAN, 3.0,
            ],
            2,
            3,
        );
        let csr = CsrMatrix::from_dense(&dense);
        assert_eq!(csr.num_rows(), 2);
        assert_eq!(csr.num_features(), 3);
        assert_eq!(csr.nnz(), 3);
        let row0: Vec<_> = csr.row_iter(0).collect();
        assert_eq!(row0, vec![(0, 1.0), (2, 2.0)]);
        let row1: Vec<_> = csr.row_iter(1).collect();
        assert_eq!(row1, vec![(2, 3.0)]);
    }

    #[test]
    fn csr_fill_row_defaults_to_missing() {
        let csr = CsrMatrix::new(vec![7.0], vec![1], vec![0, 1, 1], 3);
        let mut buf = [Entry::MISSING; 3];
        csr.fill_row(0, &mut buf);
        assert!(buf[0].is_missing());
        assert_eq!(buf[1].value(), 7.0);
        assert!(buf[2].is_missing());

        // Row 1 is entirely empty.
        buf[1] = Entry::from_value(9.0);
        csr.fill_row(1, &mut buf);
        assert!(buf.iter().all(|e| e.is_missing()));
    }

    #[test]
    #[should_panic(expected = "row_ptr must end at nnz")]
    fn csr_bad_row_ptr_panics() {
        CsrMatrix::new(vec![1.0], vec![0], vec![0, 2], 2);
    }

    #[test]
    #[should_panic(expected = "column indices must increase")]
    fn csr_unsorted_columns_panic() {
        CsrMatrix::new(vec![1.0, 2.0], vec![1, 0], vec![0, 2], 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn csr_column_out_of_range_panics() {
        CsrMatrix::new(vec![1.0], vec![5], vec![0, 1], 2);
    }
}
