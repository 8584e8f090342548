//! Singular value and QR decompositions constrained by conserved quantum
//! numbers.
//!
//! Every row of the matrix being decomposed carries a quantum number for the
//! "left" subsystem and every column one for the "right" subsystem. Only
//! elements whose labels sum to the total quantum number can be non-zero, so
//! the matrix is block-sparse after grouping rows and columns by label. Each
//! block is decomposed on its own and the factors are scattered back into
//! full-size matrices, with every new bond direction tagged by the sector it
//! came from.
//!
//! ```text
//!          nr = tot - nl
//!        .-----------.
//!  nl -> | block     |   ->   U[:, sector cols] Σ V†[sector rows, :]
//!        '-----------'
//! ```

use std::cmp::Ordering;
use itertools::Itertools;
use ndarray as nd;
use ndarray_linalg::{ QRInto, SVDInto, error::LinalgError };
use num_complex::Complex64 as C64;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum DecompError {
    /// Returned when LAPACK fails on a block.
    #[error("error in block decomposition: {0}")]
    Linalg(#[from] LinalgError),

    /// Returned when the label vectors do not match the matrix shape.
    #[error("error in block decomposition: {rows}x{cols} matrix with {nl} left and {nr} right labels")]
    LabelMismatch { rows: usize, cols: usize, nl: usize, nr: usize },

    /// Returned when no pair of row and column labels sums to the total.
    #[error("error in block decomposition: no quantum-number sector sums to {0}")]
    NoSector(i32),

    /// Returned when the SVD driver does not return singular vectors.
    #[error("error in block decomposition: missing singular vectors")]
    MissingVectors,
}
use DecompError::*;
pub type DecompResult<T> = Result<T, DecompError>;

/// Which factorization to perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecompMode {
    /// Singular value decomposition; both factors have orthonormal columns
    /// (rows for `vt`).
    Svd,
    /// QR factorization; only the factor on the side given by [`System`] is
    /// orthonormal.
    Qr,
}

/// The side of the matrix whose factor is made orthonormal in a QR
/// factorization, i.e. the subsystem a sweep is moving away from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum System {
    /// `u` is orthonormal; used when sweeping left to right.
    L,
    /// `vt` is orthonormal; used when sweeping right to left.
    R,
}

/// Output of [`decompose`].
///
/// The input matrix is recovered as `u · diag(sigma) · vt` (or `u · vt` for
/// QR). Column `k` of `u` and row `k` of `vt` belong to the sector
/// `(qnl[k], qnr[k])`.
#[derive(Clone, Debug)]
pub struct QnDecomp {
    pub u: nd::Array2<C64>,
    /// Singular values, in descending order. `None` for QR.
    pub sigma: Option<Vec<f64>>,
    pub qnl: Vec<i32>,
    pub vt: nd::Array2<C64>,
    pub qnr: Vec<i32>,
}

impl QnDecomp {
    /// Number of new bond directions.
    pub fn rank(&self) -> usize { self.qnl.len() }
}

// factors of a single sector, in block-local row/column numbering
struct Block {
    lset: Vec<usize>,
    rset: Vec<usize>,
    u: nd::Array2<C64>,
    s: Option<nd::Array1<f64>>,
    vt: nd::Array2<C64>,
    nl: i32,
    nr: i32,
}

impl Block {
    fn rank(&self) -> usize { self.u.ncols() }
}

fn decompose_block(
    block: nd::Array2<C64>,
    mode: DecompMode,
    system: System,
) -> DecompResult<(nd::Array2<C64>, Option<nd::Array1<f64>>, nd::Array2<C64>)>
{
    let (rows, cols) = block.dim();
    let k = rows.min(cols);
    match (mode, system) {
        (DecompMode::Svd, _) => {
            let (Some(u), s, Some(vt)) = block.svd_into(true, true)?
                else { return Err(MissingVectors); };
            let u = u.slice(nd::s![.., ..k]).to_owned();
            let vt = vt.slice(nd::s![..k, ..]).to_owned();
            Ok((u, Some(s), vt))
        },
        (DecompMode::Qr, System::L) => {
            let (q, r) = block.qr_into()?;
            Ok((q, None, r))
        },
        (DecompMode::Qr, System::R) => {
            // block = rᵀ qᵀ with qᵀ having orthonormal rows
            let (q, r) = block.t().to_owned().qr_into()?;
            Ok((r.t().to_owned(), None, q.t().to_owned()))
        },
    }
}

/// Decompose `mat` block-wise according to row labels `qnbigl` and column
/// labels `qnbigr`, keeping only sectors whose labels sum to `qntot`.
///
/// Sectors are visited in ascending order of their left label. For SVD, the
/// resulting directions are then sorted by descending singular value across
/// all sectors (stably, so each sector stays internally descending); QR
/// output is left in sector order.
///
/// Fails if the labels do not match the matrix shape or if no sector is
/// present.
pub fn decompose(
    mat: &nd::Array2<C64>,
    qnbigl: &[i32],
    qnbigr: &[i32],
    qntot: i32,
    mode: DecompMode,
    system: System,
) -> DecompResult<QnDecomp>
{
    let (m, n) = mat.dim();
    if qnbigl.len() != m || qnbigr.len() != n {
        return Err(LabelMismatch {
            rows: m,
            cols: n,
            nl: qnbigl.len(),
            nr: qnbigr.len(),
        });
    }
    let mut rsets: FxHashMap<i32, Vec<usize>> = FxHashMap::default();
    qnbigr.iter().enumerate()
        .for_each(|(j, q)| { rsets.entry(*q).or_default().push(j); });

    let mut blocks: Vec<Block> = Vec::new();
    for nl in qnbigl.iter().copied().sorted().dedup() {
        let nr = qntot - nl;
        let Some(rset) = rsets.get(&nr) else { continue; };
        let lset: Vec<usize>
            = qnbigl.iter().enumerate()
            .filter_map(|(i, q)| (*q == nl).then_some(i))
            .collect();
        let block: nd::Array2<C64>
            = nd::Array2::from_shape_fn(
                (lset.len(), rset.len()),
                |(i, j)| mat[[lset[i], rset[j]]],
            );
        let (u, s, vt) = decompose_block(block, mode, system)?;
        trace!(nl, nr, rows = lset.len(), cols = rset.len(), rank = u.ncols(), "sector");
        blocks.push(Block { lset, rset: rset.clone(), u, s, vt, nl, nr });
    }

    let mut order: Vec<(usize, usize)>
        = blocks.iter().enumerate()
        .flat_map(|(b, block)| (0..block.rank()).map(move |j| (b, j)))
        .collect();
    if order.is_empty() { return Err(NoSector(qntot)); }
    if mode == DecompMode::Svd {
        let sval = |&(b, j): &(usize, usize)| {
            blocks[b].s.as_ref().map(|s| s[j]).unwrap_or(0.0)
        };
        order.sort_by(|x, y| {
            sval(y).partial_cmp(&sval(x)).unwrap_or(Ordering::Equal)
        });
    }

    let rank = order.len();
    let mut u: nd::Array2<C64> = nd::Array2::zeros((m, rank));
    let mut vt: nd::Array2<C64> = nd::Array2::zeros((rank, n));
    let mut qnl: Vec<i32> = Vec::with_capacity(rank);
    let mut qnr: Vec<i32> = Vec::with_capacity(rank);
    let mut sigma: Vec<f64> = Vec::with_capacity(rank);
    for (k, &(b, j)) in order.iter().enumerate() {
        let block = &blocks[b];
        block.lset.iter().enumerate()
            .for_each(|(i, row)| { u[[*row, k]] = block.u[[i, j]]; });
        block.rset.iter().enumerate()
            .for_each(|(i, col)| { vt[[k, *col]] = block.vt[[j, i]]; });
        qnl.push(block.nl);
        qnr.push(block.nr);
        if let Some(s) = &block.s { sigma.push(s[j]); }
    }
    let sigma = (mode == DecompMode::Svd).then_some(sigma);
    Ok(QnDecomp { u, sigma, qnl, vt, qnr })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn c(re: f64) -> C64 { C64::new(re, 0.0) }

    fn reconstruct(dec: &QnDecomp) -> nd::Array2<C64> {
        match &dec.sigma {
            Some(s) => {
                let mut us = dec.u.clone();
                us.axis_iter_mut(nd::Axis(1))
                    .zip(s)
                    .for_each(|(mut col, sk)| { col.map_inplace(|x| { *x *= *sk; }); });
                us.dot(&dec.vt)
            },
            None => dec.u.dot(&dec.vt),
        }
    }

    fn max_diff(a: &nd::Array2<C64>, b: &nd::Array2<C64>) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).norm()).fold(0.0, f64::max)
    }

    // rows labeled [0, 1, 1], columns labeled [1, 0, 0] with total 1: the
    // (0, 1) block is 1x1 and the (1, 0) block is 2x2
    fn block_matrix() -> (nd::Array2<C64>, Vec<i32>, Vec<i32>) {
        let mat = nd::array![
            [c(3.0), c(0.0), c(0.0)],
            [c(0.0), c(1.0), c(2.0)],
            [c(0.0), c(2.0), c(1.0)],
        ];
        (mat, vec![0, 1, 1], vec![1, 0, 0])
    }

    #[test]
    fn svd_respects_sectors() {
        let (mat, qnl, qnr) = block_matrix();
        let dec = decompose(&mat, &qnl, &qnr, 1, DecompMode::Svd, System::L)
            .unwrap();
        assert_eq!(dec.rank(), 3);
        let s = dec.sigma.as_ref().unwrap();
        assert_abs_diff_eq!(s[0], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s[1], 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s[2], 1.0, epsilon = 1e-12);
        assert!(s.windows(2).all(|w| w[0] >= w[1]));
        dec.qnl.iter().zip(&dec.qnr)
            .for_each(|(l, r)| { assert_eq!(l + r, 1); });
        assert!(max_diff(&reconstruct(&dec), &mat) < 1e-12);
    }

    #[test]
    fn qr_orthonormal_side() {
        let (mat, qnl, qnr) = block_matrix();
        let dec = decompose(&mat, &qnl, &qnr, 1, DecompMode::Qr, System::L)
            .unwrap();
        assert!(dec.sigma.is_none());
        let uhu = dec.u.t().mapv(|x| x.conj()).dot(&dec.u);
        assert!(max_diff(&uhu, &nd::Array2::eye(dec.rank())) < 1e-12);
        assert!(max_diff(&reconstruct(&dec), &mat) < 1e-12);

        let dec = decompose(&mat, &qnl, &qnr, 1, DecompMode::Qr, System::R)
            .unwrap();
        let vvh = dec.vt.dot(&dec.vt.t().mapv(|x| x.conj()));
        assert!(max_diff(&vvh, &nd::Array2::eye(dec.rank())) < 1e-12);
        assert!(max_diff(&reconstruct(&dec), &mat) < 1e-12);
        assert_eq!(dec.qnl, vec![0, 1, 1]);
        assert_eq!(dec.qnr, vec![1, 0, 0]);
    }

    #[test]
    fn out_of_sector_elements_are_dropped() {
        let (mut mat, qnl, qnr) = block_matrix();
        mat[[0, 1]] = c(5.0); // labels (0, 0) don't sum to 1
        let dec = decompose(&mat, &qnl, &qnr, 1, DecompMode::Svd, System::R)
            .unwrap();
        let rec = reconstruct(&dec);
        assert_abs_diff_eq!(rec[[0, 1]].norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn errors() {
        let (mat, qnl, qnr) = block_matrix();
        assert!(matches!(
            decompose(&mat, &qnl[..2], &qnr, 1, DecompMode::Svd, System::L),
            Err(LabelMismatch { .. }),
        ));
        assert!(matches!(
            decompose(&mat, &qnl, &qnr, 7, DecompMode::Qr, System::L),
            Err(NoSector(7)),
        ));
    }
}
