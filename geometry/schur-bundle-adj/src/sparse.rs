//! Compressed sparse column matrices assembled from triplets, with the block
//! operations needed for the Schur complement.
//!
//! Entries within a column are kept sorted by row. Assembly sums duplicate
//! triplets in input order, so the result only depends on the order of the
//! triplet list, never on how it was produced.

use nalgebra as na;
use num_traits::Float;

use crate::{Error, Result};

/// A single `(row, col, value)` entry used to assemble a [SparseMatrix].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triplet<F> {
    pub row: usize,
    pub col: usize,
    pub value: F,
}

impl<F> Triplet<F> {
    pub fn new(row: usize, col: usize, value: F) -> Self {
        Self { row, col, value }
    }
}

/// Sparse matrix in compressed sparse column layout.
///
/// Stored entries may be zero. The structure (which entries are stored) is
/// what the block operations check, not the values.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseMatrix<F> {
    nrows: usize,
    ncols: usize,
    /// Start of each column in `row_idx` and `values`. Length `ncols + 1`.
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<F>,
}

impl<F: na::RealField + Float> SparseMatrix<F> {
    /// An `nrows x ncols` matrix without stored entries.
    pub fn allocate(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            col_ptr: vec![0; ncols + 1],
            row_idx: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Build an `nrows x ncols` matrix from triplets, see
    /// [SparseMatrix::set_from_triplets].
    pub fn from_triplets(nrows: usize, ncols: usize, triplets: Vec<Triplet<F>>) -> Result<Self> {
        let mut m = Self::allocate(nrows, ncols);
        m.set_from_triplets(triplets)?;
        Ok(m)
    }

    /// Replace the contents of this matrix with the given triplets.
    ///
    /// Triplets with the same position are summed. A triplet outside the
    /// matrix is a [Error::Structural] error and leaves the matrix unchanged.
    pub fn set_from_triplets(&mut self, mut triplets: Vec<Triplet<F>>) -> Result<()> {
        if let Some(t) = triplets
            .iter()
            .find(|t| t.row >= self.nrows || t.col >= self.ncols)
        {
            return Err(Error::Structural(format!(
                "triplet ({}, {}) outside {}x{} matrix",
                t.row, t.col, self.nrows, self.ncols
            )));
        }

        // stable, so duplicates are summed in input order
        triplets.sort_by_key(|t| (t.col, t.row));

        let mut col_ptr = vec![0; self.ncols + 1];
        let mut row_idx = Vec::with_capacity(triplets.len());
        let mut values: Vec<F> = Vec::with_capacity(triplets.len());
        let mut last = None;
        for t in triplets {
            if last == Some((t.col, t.row)) {
                if let Some(v) = values.last_mut() {
                    *v += t.value;
                }
                continue;
            }
            last = Some((t.col, t.row));
            row_idx.push(t.row);
            values.push(t.value);
            col_ptr[t.col + 1] += 1;
        }
        for j in 0..self.ncols {
            col_ptr[j + 1] += col_ptr[j];
        }

        self.col_ptr = col_ptr;
        self.row_idx = row_idx;
        self.values = values;
        Ok(())
    }

    pub fn num_rows(&self) -> usize {
        self.nrows
    }

    pub fn num_cols(&self) -> usize {
        self.ncols
    }

    /// Number of stored entries.
    pub fn num_non_zero(&self) -> usize {
        self.values.len()
    }

    fn column(&self, col: usize) -> (&[usize], &[F]) {
        let range = self.col_ptr[col]..self.col_ptr[col + 1];
        (&self.row_idx[range.clone()], &self.values[range])
    }

    /// The value at `(row, col)`, zero if not stored.
    ///
    /// Panics if the position is outside the matrix.
    pub fn get(&self, row: usize, col: usize) -> F {
        assert!(row < self.nrows && col < self.ncols);
        let (rows, values) = self.column(col);
        match rows.binary_search(&row) {
            Ok(i) => values[i],
            Err(_) => F::zero(),
        }
    }

    /// Whether all stored values are finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| Float::is_finite(*v))
    }

    pub fn transpose(&self) -> Self {
        let mut col_ptr = vec![0; self.nrows + 1];
        for &r in &self.row_idx {
            col_ptr[r + 1] += 1;
        }
        for i in 0..self.nrows {
            col_ptr[i + 1] += col_ptr[i];
        }

        let mut next = col_ptr.clone();
        let mut row_idx = vec![0; self.values.len()];
        let mut values = vec![F::zero(); self.values.len()];
        // Walking the source columns in order keeps each target column sorted.
        for j in 0..self.ncols {
            let (rows, vals) = self.column(j);
            for (&r, &v) in rows.iter().zip(vals) {
                let dest = next[r];
                row_idx[dest] = j;
                values[dest] = v;
                next[r] += 1;
            }
        }

        Self {
            nrows: self.ncols,
            ncols: self.nrows,
            col_ptr,
            row_idx,
            values,
        }
    }

    /// The sparse product `self * rhs`.
    pub fn multiply(&self, rhs: &Self) -> Result<Self> {
        if self.ncols != rhs.nrows {
            return Err(Error::Structural(format!(
                "cannot multiply {}x{} by {}x{}",
                self.nrows, self.ncols, rhs.nrows, rhs.ncols
            )));
        }

        let mut col_ptr = Vec::with_capacity(rhs.ncols + 1);
        col_ptr.push(0);
        let mut row_idx = Vec::new();
        let mut values = Vec::new();

        let mut accum = vec![F::zero(); self.nrows];
        let mut marker = vec![usize::MAX; self.nrows];
        let mut pattern = Vec::new();
        for j in 0..rhs.ncols {
            pattern.clear();
            let (rhs_rows, rhs_vals) = rhs.column(j);
            for (&k, &b) in rhs_rows.iter().zip(rhs_vals) {
                let (rows, vals) = self.column(k);
                for (&i, &a) in rows.iter().zip(vals) {
                    if marker[i] != j {
                        marker[i] = j;
                        accum[i] = F::zero();
                        pattern.push(i);
                    }
                    accum[i] += a * b;
                }
            }
            pattern.sort_unstable();
            for &i in &pattern {
                row_idx.push(i);
                values.push(accum[i]);
            }
            col_ptr.push(row_idx.len());
        }

        Ok(Self {
            nrows: self.nrows,
            ncols: rhs.ncols,
            col_ptr,
            row_idx,
            values,
        })
    }

    /// The dense product `self * x`.
    pub fn multiply_vector(&self, x: &na::DVector<F>) -> Result<na::DVector<F>> {
        if self.ncols != x.len() {
            return Err(Error::Structural(format!(
                "cannot multiply {}x{} by vector of length {}",
                self.nrows,
                self.ncols,
                x.len()
            )));
        }
        let mut out = na::DVector::zeros(self.nrows);
        for j in 0..self.ncols {
            let xj = x[j];
            let (rows, vals) = self.column(j);
            for (&i, &a) in rows.iter().zip(vals) {
                out[i] += a * xj;
            }
        }
        Ok(out)
    }

    /// Element-wise `self - rhs`. Both matrices must have the same shape.
    pub fn subtract(&self, rhs: &Self) -> Result<Self> {
        if self.nrows != rhs.nrows || self.ncols != rhs.ncols {
            return Err(Error::Structural(format!(
                "cannot subtract {}x{} from {}x{}",
                rhs.nrows, rhs.ncols, self.nrows, self.ncols
            )));
        }

        let mut col_ptr = Vec::with_capacity(self.ncols + 1);
        col_ptr.push(0);
        let mut row_idx = Vec::with_capacity(self.values.len() + rhs.values.len());
        let mut values = Vec::with_capacity(self.values.len() + rhs.values.len());
        for j in 0..self.ncols {
            let (a_rows, a_vals) = self.column(j);
            let (b_rows, b_vals) = rhs.column(j);
            let (mut ia, mut ib) = (0, 0);
            while ia < a_rows.len() || ib < b_rows.len() {
                let ra = a_rows.get(ia).copied().unwrap_or(usize::MAX);
                let rb = b_rows.get(ib).copied().unwrap_or(usize::MAX);
                if ra == rb {
                    row_idx.push(ra);
                    values.push(a_vals[ia] - b_vals[ib]);
                    ia += 1;
                    ib += 1;
                } else if ra < rb {
                    row_idx.push(ra);
                    values.push(a_vals[ia]);
                    ia += 1;
                } else {
                    row_idx.push(rb);
                    values.push(-b_vals[ib]);
                    ib += 1;
                }
            }
            col_ptr.push(row_idx.len());
        }

        Ok(Self {
            nrows: self.nrows,
            ncols: self.ncols,
            col_ptr,
            row_idx,
            values,
        })
    }

    /// Multiply every stored diagonal entry by `factor`.
    ///
    /// Diagonal entries that are not stored stay zero.
    pub fn mult_diagonal(&mut self, factor: F) {
        for j in 0..self.ncols.min(self.nrows) {
            let range = self.col_ptr[j]..self.col_ptr[j + 1];
            if let Ok(i) = self.row_idx[range.clone()].binary_search(&j) {
                self.values[range.start + i] *= factor;
            }
        }
    }

    /// The block diagonal of `self^T * self` for column blocks of width
    /// `block_size`.
    ///
    /// The result is square with `num_cols()` rows and stores every entry of
    /// each `block_size x block_size` diagonal block, even where the value is
    /// zero, so it is a valid input for the block inversions.
    pub fn block_column_gram(&self, block_size: usize) -> Result<Self> {
        if block_size == 0 || self.ncols % block_size != 0 {
            return Err(Error::Structural(format!(
                "{} columns are not divisible into blocks of {block_size}",
                self.ncols
            )));
        }

        let mut col_ptr = Vec::with_capacity(self.ncols + 1);
        col_ptr.push(0);
        let mut row_idx = Vec::with_capacity(self.ncols * block_size);
        let mut values = Vec::with_capacity(self.ncols * block_size);
        for block_start in (0..self.ncols).step_by(block_size) {
            for b in block_start..block_start + block_size {
                let col_b = self.column(b);
                for a in block_start..block_start + block_size {
                    row_idx.push(a);
                    values.push(sparse_dot(self.column(a), col_b));
                }
                col_ptr.push(row_idx.len());
            }
        }

        Ok(Self {
            nrows: self.ncols,
            ncols: self.ncols,
            col_ptr,
            row_idx,
            values,
        })
    }

    /// Mutable views of the `block_size x block_size` blocks on the diagonal.
    ///
    /// Fails with [Error::Structural] unless the matrix is square, divisible
    /// into blocks and stores exactly the entries of its diagonal blocks.
    pub fn diagonal_blocks_mut(&mut self, block_size: usize) -> Result<DiagonalBlocksMut<'_, F>> {
        if self.nrows != self.ncols {
            return Err(Error::Structural(format!(
                "block diagonal matrix must be square, got {}x{}",
                self.nrows, self.ncols
            )));
        }
        if block_size == 0 || self.ncols % block_size != 0 {
            return Err(Error::Structural(format!(
                "{} columns are not divisible into blocks of {block_size}",
                self.ncols
            )));
        }
        if self.values.len() != self.nrows * block_size {
            return Err(Error::Structural(format!(
                "expected {} stored entries for blocks of {block_size}, got {}",
                self.nrows * block_size,
                self.values.len()
            )));
        }
        for j in 0..self.ncols {
            let block_start = j - j % block_size;
            let (rows, _) = self.column(j);
            if rows.len() != block_size
                || rows.iter().any(|&r| r < block_start || r >= block_start + block_size)
            {
                return Err(Error::Structural(format!(
                    "column {j} has entries outside its diagonal block"
                )));
            }
        }

        Ok(DiagonalBlocksMut {
            block_size,
            values: &mut self.values,
        })
    }

    /// Invert every 3x3 diagonal block in place using the closed-form
    /// adjugate inverse.
    ///
    /// Blocks that are numerically singular or not finite are set to zero.
    /// Returns the number of such blocks.
    pub fn invert_block_diagonal_3x3(&mut self) -> Result<usize> {
        let mut num_zeroed = 0;
        for mut block in self.diagonal_blocks_mut(3)?.iter_mut() {
            let m = na::Matrix3::from_column_slice(block.as_slice());
            match invert_3x3(&m) {
                Some(inv) => block.as_mut_slice().copy_from_slice(inv.as_slice()),
                None => {
                    tracing::trace!("zeroing singular 3x3 block {}", block.index());
                    block.fill_zero();
                    num_zeroed += 1;
                }
            }
        }
        Ok(num_zeroed)
    }

    /// Invert every `block_size x block_size` diagonal block in place using
    /// its Cholesky decomposition.
    ///
    /// Blocks that are not positive definite or whose inverse is not finite
    /// are set to zero. Returns the number of such blocks.
    pub fn invert_block_diagonal_cholesky(&mut self, block_size: usize) -> Result<usize> {
        let mut num_zeroed = 0;
        for mut block in self.diagonal_blocks_mut(block_size)?.iter_mut() {
            let m = block.to_matrix();
            let inv = m
                .cholesky()
                .map(|chol| chol.inverse())
                .filter(|inv| inv.iter().all(|v| Float::is_finite(*v)));
            match inv {
                Some(inv) => block.as_mut_slice().copy_from_slice(inv.as_slice()),
                None => {
                    tracing::trace!(
                        "zeroing {block_size}x{block_size} block {} without Cholesky decomposition",
                        block.index()
                    );
                    block.fill_zero();
                    num_zeroed += 1;
                }
            }
        }
        Ok(num_zeroed)
    }

    pub fn to_dense(&self) -> na::DMatrix<F> {
        let mut m = na::DMatrix::zeros(self.nrows, self.ncols);
        for j in 0..self.ncols {
            let (rows, vals) = self.column(j);
            for (&i, &v) in rows.iter().zip(vals) {
                m[(i, j)] = v;
            }
        }
        m
    }
}

/// Dot product of two sorted sparse columns.
fn sparse_dot<F: na::RealField + Float>(a: (&[usize], &[F]), b: (&[usize], &[F])) -> F {
    let (a_rows, a_vals) = a;
    let (b_rows, b_vals) = b;
    let (mut ia, mut ib) = (0, 0);
    let mut sum = F::zero();
    while ia < a_rows.len() && ib < b_rows.len() {
        match a_rows[ia].cmp(&b_rows[ib]) {
            std::cmp::Ordering::Less => ia += 1,
            std::cmp::Ordering::Greater => ib += 1,
            std::cmp::Ordering::Equal => {
                sum += a_vals[ia] * b_vals[ib];
                ia += 1;
                ib += 1;
            }
        }
    }
    sum
}

/// Closed-form inverse of a 3x3 matrix, `None` if it is numerically singular
/// or not finite.
fn invert_3x3<F: na::RealField + Float>(m: &na::Matrix3<F>) -> Option<na::Matrix3<F>> {
    let c00 = m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)];
    let c01 = m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)];
    let c02 = m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)];
    let det = m[(0, 0)] * c00 + m[(0, 1)] * c01 + m[(0, 2)] * c02;

    let diag_product = Float::abs(m[(0, 0)] * m[(1, 1)] * m[(2, 2)]);
    if !Float::is_finite(det) || Float::abs(det) <= <F as Float>::epsilon() * diag_product {
        return None;
    }

    #[rustfmt::skip]
    let adjugate = na::Matrix3::new(
        c00, m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)], m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)],
        c01, m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)], m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)],
        c02, m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)], m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)],
    );
    let inv = adjugate / det;
    if inv.iter().all(|v| Float::is_finite(*v)) {
        Some(inv)
    } else {
        None
    }
}

/// The diagonal blocks of a block diagonal [SparseMatrix], see
/// [SparseMatrix::diagonal_blocks_mut].
///
/// Block `k` covers rows and columns `k * block_size .. (k + 1) * block_size`
/// and is stored column-major in its own contiguous chunk of the value
/// buffer.
pub struct DiagonalBlocksMut<'a, F> {
    block_size: usize,
    values: &'a mut [F],
}

impl<'a, F: na::RealField + Float> DiagonalBlocksMut<'a, F> {
    pub fn iter_mut(&mut self) -> impl Iterator<Item = DiagonalBlockMut<'_, F>> {
        let size = self.block_size;
        self.values
            .chunks_exact_mut(size * size)
            .enumerate()
            .map(move |(index, values)| DiagonalBlockMut {
                size,
                index,
                values,
            })
    }
}

/// One square block on the diagonal, stored column-major.
pub struct DiagonalBlockMut<'a, F> {
    size: usize,
    index: usize,
    values: &'a mut [F],
}

impl<'a, F: na::RealField + Float> DiagonalBlockMut<'a, F> {
    /// Position of this block along the diagonal.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn as_slice(&self) -> &[F] {
        &*self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [F] {
        &mut *self.values
    }

    pub fn to_matrix(&self) -> na::DMatrix<F> {
        na::DMatrix::from_column_slice(self.size, self.size, self.values)
    }

    pub fn fill_zero(&mut self) {
        self.values.fill(F::zero());
    }
}
