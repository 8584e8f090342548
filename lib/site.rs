//! Single-site tensors of a tensor train.
//!
//! A site of a matrix product state (MPS) carries one physical index between
//! two bond indices, while a site of a matrix product operator (MPO) carries
//! two physical indices (row/"up" and column/"down") between its bonds.
//!
//! ```text
//!  state:      operator:
//!                  | <- up
//!  -- M --      -- W --
//!     |            |
//!     | <- phys    | <- down
//! ```
//!
//! All decompositions in a sweep act on a site after one of its bonds has been
//! fused with its physical indices, so [`SiteTensor`] mostly exists to provide
//! these reshapes ([`SiteTensor::l_combine`], [`SiteTensor::r_combine`]) and
//! their inverses.

use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rand::{ Rng, distributions::Distribution };
use serde::{ Deserialize, Serialize };
use statrs::distribution::Normal;
use thiserror::Error;

/// Absolute tolerance used in orthogonality checks.
pub const ORTHO_TOL: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum SiteError {
    /// Returned when a reshape between a site and a matrix fails.
    #[error("error in site reshape: {0}")]
    Shape(#[from] nd::ShapeError),

    /// Returned when a matrix is folded into a bond of a different dimension.
    #[error("error in site fold: bond dimension {bond} does not match matrix dimension {matrix}")]
    FoldMismatch { bond: usize, matrix: usize },

    /// Returned when a combined matrix cannot be split by the physical
    /// dimension(s).
    #[error("error in site construction: dimension {dim} is not divisible by physical dimension {pdim}")]
    IndivisibleDim { dim: usize, pdim: usize },

    /// Returned when a site is constructed with the wrong number of physical
    /// dimensions for its kind.
    #[error("error in site construction: expected {expected} physical dimension(s), got {got}")]
    PhysicalRank { expected: usize, got: usize },
}
use SiteError::*;
pub type SiteResult<T> = Result<T, SiteError>;

/// Discriminates between the two ranks of tensors a train can hold.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrainKind {
    /// Matrix product state; sites are rank 3.
    State,
    /// Matrix product operator; sites are rank 4.
    Operator,
}

impl TrainKind {
    /// Number of physical indices on each site.
    pub fn num_physical(&self) -> usize {
        match self {
            Self::State => 1,
            Self::Operator => 2,
        }
    }

    /// Return `true` if `self` is `State`.
    pub fn is_state(&self) -> bool { matches!(self, Self::State) }

    /// Return `true` if `self` is `Operator`.
    pub fn is_operator(&self) -> bool { matches!(self, Self::Operator) }
}

/// A single site of a tensor train.
///
/// Axis conventions are `[bondL, physical, bondR]` for states and
/// `[bondL, physicalUp, physicalDown, bondR]` for operators.
#[derive(Clone, Debug, PartialEq)]
pub enum SiteTensor {
    State(nd::Array3<C64>),
    Operator(nd::Array4<C64>),
}

impl From<nd::Array3<C64>> for SiteTensor {
    fn from(data: nd::Array3<C64>) -> Self { Self::State(data) }
}

impl From<nd::Array4<C64>> for SiteTensor {
    fn from(data: nd::Array4<C64>) -> Self { Self::Operator(data) }
}

impl SiteTensor {
    /// Create a new site filled with zeros.
    ///
    /// `pdim` must hold one entry for states and two for operators.
    pub fn zeros(kind: TrainKind, bond: (usize, usize), pdim: &[usize])
        -> SiteResult<Self>
    {
        if pdim.len() != kind.num_physical() {
            return Err(PhysicalRank {
                expected: kind.num_physical(),
                got: pdim.len(),
            });
        }
        let site
            = match kind {
                TrainKind::State
                    => Self::State(nd::Array3::zeros((bond.0, pdim[0], bond.1))),
                TrainKind::Operator
                    => Self::Operator(
                        nd::Array4::zeros((bond.0, pdim[0], pdim[1], bond.1))),
            };
        Ok(site)
    }

    /// Create a new site with entries drawn from a standard complex normal
    /// distribution, keeping only the elements for which `mask` returns
    /// `true`.
    ///
    /// `mask` is passed `(left bond, flattened physical index, right bond)`.
    pub fn random_masked<R, F>(
        kind: TrainKind,
        bond: (usize, usize),
        pdim: &[usize],
        complex: bool,
        rng: &mut R,
        mut mask: F,
    ) -> SiteResult<Self>
    where
        R: Rng + ?Sized,
        F: FnMut(usize, usize, usize) -> bool,
    {
        let normal = Normal::standard();
        let mut site = Self::zeros(kind, bond, pdim)?;
        let pprod: usize = pdim.iter().product();
        let mut mat = site.l_combine()?;
        mat.indexed_iter_mut()
            .for_each(|((lp, r), x)| {
                if mask(lp / pprod, lp % pprod, r) {
                    let im = if complex { normal.sample(rng) } else { 0.0 };
                    *x = C64::new(normal.sample(rng), im);
                }
            });
        site = Self::from_l_combined(kind, mat, pdim)?;
        Ok(site)
    }

    /// Reshape a `[bondL * physical, bondR]` matrix back into a site.
    pub fn from_l_combined(kind: TrainKind, mat: nd::Array2<C64>, pdim: &[usize])
        -> SiteResult<Self>
    {
        let pprod: usize = pdim.iter().product();
        let (rows, cols) = mat.dim();
        if pprod == 0 || rows % pprod != 0 {
            return Err(IndivisibleDim { dim: rows, pdim: pprod });
        }
        Self::from_flat(kind, (rows / pprod, cols), pdim, mat.iter().copied())
    }

    /// Reshape a `[bondL, physical * bondR]` matrix back into a site.
    pub fn from_r_combined(kind: TrainKind, mat: nd::Array2<C64>, pdim: &[usize])
        -> SiteResult<Self>
    {
        let pprod: usize = pdim.iter().product();
        let (rows, cols) = mat.dim();
        if pprod == 0 || cols % pprod != 0 {
            return Err(IndivisibleDim { dim: cols, pdim: pprod });
        }
        Self::from_flat(kind, (rows, cols / pprod), pdim, mat.iter().copied())
    }

    // elements must be given in row-major order
    fn from_flat<I>(kind: TrainKind, bond: (usize, usize), pdim: &[usize], elems: I)
        -> SiteResult<Self>
    where I: IntoIterator<Item = C64>
    {
        let elems: Vec<C64> = elems.into_iter().collect();
        match (kind, pdim) {
            (TrainKind::State, &[p]) => {
                let data = nd::Array3::from_shape_vec((bond.0, p, bond.1), elems)?;
                Ok(Self::State(data))
            },
            (TrainKind::Operator, &[pu, pd]) => {
                let data
                    = nd::Array4::from_shape_vec((bond.0, pu, pd, bond.1), elems)?;
                Ok(Self::Operator(data))
            },
            _ => Err(PhysicalRank {
                expected: kind.num_physical(),
                got: pdim.len(),
            }),
        }
    }

    /// Return the kind of train this site belongs in.
    pub fn kind(&self) -> TrainKind {
        match self {
            Self::State(_) => TrainKind::State,
            Self::Operator(_) => TrainKind::Operator,
        }
    }

    /// Return a dynamic-dimensional view of the underlying data.
    pub fn view(&self) -> nd::ArrayViewD<'_, C64> {
        match self {
            Self::State(data) => data.view().into_dyn(),
            Self::Operator(data) => data.view().into_dyn(),
        }
    }

    /// Return the full shape of the site.
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::State(data) => data.shape(),
            Self::Operator(data) => data.shape(),
        }
    }

    /// Return the `(left, right)` bond dimensions.
    pub fn bond_dim(&self) -> (usize, usize) {
        let sh = self.shape();
        (sh[0], sh[sh.len() - 1])
    }

    /// Return the physical dimension(s).
    pub fn pdim(&self) -> Vec<usize> {
        let sh = self.shape();
        sh[1..sh.len() - 1].to_vec()
    }

    /// Return the product of all physical dimensions.
    pub fn pdim_prod(&self) -> usize { self.pdim().iter().product() }

    /// Return the number of bytes held in the site's data.
    pub fn nbytes(&self) -> usize {
        self.shape().iter().product::<usize>() * std::mem::size_of::<C64>()
    }

    /// Return `true` if every element is exactly zero.
    pub fn is_zero(&self) -> bool { self.view().iter().all(|x| x.is_zero()) }

    /// Return `true` if any element has a non-zero imaginary part.
    pub fn has_imag(&self) -> bool { self.view().iter().any(|x| x.im != 0.0) }

    /// Fuse the physical indices into the left bond, giving a
    /// `[bondL * physical, bondR]` matrix.
    pub fn l_combine(&self) -> SiteResult<nd::Array2<C64>> {
        let (l, r) = self.bond_dim();
        let rows = l * self.pdim_prod();
        let elems: Vec<C64> = self.view().iter().copied().collect();
        Ok(nd::Array2::from_shape_vec((rows, r), elems)?)
    }

    /// Fuse the physical indices into the right bond, giving a
    /// `[bondL, physical * bondR]` matrix.
    pub fn r_combine(&self) -> SiteResult<nd::Array2<C64>> {
        let (l, r) = self.bond_dim();
        let cols = self.pdim_prod() * r;
        let elems: Vec<C64> = self.view().iter().copied().collect();
        Ok(nd::Array2::from_shape_vec((l, cols), elems)?)
    }

    /// Check that contracting the site with its conjugate over the left bond
    /// and physical indices gives the identity on the right bond.
    pub fn check_lortho(&self) -> bool {
        let Ok(m) = self.l_combine() else { return false; };
        let mh = m.t().mapv(|x| x.conj());
        is_identity(&mh.dot(&m))
    }

    /// Check that contracting the site with its conjugate over the right bond
    /// and physical indices gives the identity on the left bond.
    pub fn check_rortho(&self) -> bool {
        let Ok(m) = self.r_combine() else { return false; };
        let mh = m.t().mapv(|x| x.conj());
        is_identity(&m.dot(&mh))
    }

    /// Return the complex conjugate.
    pub fn conj(&self) -> Self {
        match self {
            Self::State(data) => Self::State(data.mapv(|x| x.conj())),
            Self::Operator(data) => Self::Operator(data.mapv(|x| x.conj())),
        }
    }

    /// Multiply every element by `val`.
    pub fn scale_inplace(&mut self, val: C64) {
        match self {
            Self::State(data) => { data.map_inplace(|x| { *x *= val; }); },
            Self::Operator(data) => { data.map_inplace(|x| { *x *= val; }); },
        }
    }

    /// Contract `mat` into the right bond, i.e.
    /// `M'[l, σ, j] = Σ_r M[l, σ, r] mat[r, j]`.
    pub fn fold_right_bond(&self, mat: &nd::Array2<C64>) -> SiteResult<Self> {
        let (_, r) = self.bond_dim();
        if mat.nrows() != r {
            return Err(FoldMismatch { bond: r, matrix: mat.nrows() });
        }
        let folded = self.l_combine()?.dot(mat);
        Self::from_l_combined(self.kind(), folded, &self.pdim())
    }

    /// Contract `mat` into the left bond, i.e.
    /// `M'[i, σ, r] = Σ_l mat[i, l] M[l, σ, r]`.
    pub fn fold_left_bond(&self, mat: &nd::Array2<C64>) -> SiteResult<Self> {
        let (l, _) = self.bond_dim();
        if mat.ncols() != l {
            return Err(FoldMismatch { bond: l, matrix: mat.ncols() });
        }
        let folded = mat.dot(&self.r_combine()?);
        Self::from_r_combined(self.kind(), folded, &self.pdim())
    }

    /// Expand elementary per-level quantum-number increments into the
    /// increments of the flattened physical index.
    ///
    /// `increments` is passed the dimension of each physical index. States use
    /// it directly; operators use `up - down` over all pairs, with the up index
    /// varying slowest.
    pub fn sigma_qn<F>(&self, increments: F) -> Vec<i32>
    where F: Fn(usize) -> Vec<i32>
    {
        match self {
            Self::State(data) => increments(data.shape()[1]),
            Self::Operator(data) => {
                let up = increments(data.shape()[1]);
                let down = increments(data.shape()[2]);
                up.iter()
                    .cartesian_product(&down)
                    .map(|(u, d)| u - d)
                    .collect()
            },
        }
    }

    /// Return the data as a `[bondL, physical, bondR]` array, with all
    /// physical indices fused.
    pub fn to_array3(&self) -> SiteResult<nd::Array3<C64>> {
        let (l, r) = self.bond_dim();
        let elems: Vec<C64> = self.view().iter().copied().collect();
        Ok(nd::Array3::from_shape_vec((l, self.pdim_prod(), r), elems)?)
    }

    /// Inverse of [`Self::to_array3`].
    pub fn from_array3(kind: TrainKind, data: nd::Array3<C64>, pdim: &[usize])
        -> SiteResult<Self>
    {
        let (l, p, r) = data.dim();
        let pprod: usize = pdim.iter().product();
        if p != pprod { return Err(IndivisibleDim { dim: p, pdim: pprod }); }
        Self::from_flat(kind, (l, r), pdim, data.iter().copied())
    }

    /// Return `true` if all elements are within `tol` of those of `other`.
    ///
    /// Sites of different shapes are never close.
    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        self.shape() == other.shape()
            && self.view().iter().zip(other.view().iter())
                .all(|(a, b)| (a - b).norm() <= tol)
    }
}

fn is_identity(m: &nd::Array2<C64>) -> bool {
    m.indexed_iter()
        .all(|((i, j), x)| {
            let target = if i == j { C64::new(1.0, 0.0) } else { C64::zero() };
            (x - target).norm() <= ORTHO_TOL
        })
}
