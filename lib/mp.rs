//! Tensor trains (matrix product states and operators) with quantum-number
//! bookkeeping.
//!
//! A [`TensorTrain`] is a chain of [`SiteTensor`]s linked by bond indices.
//! Every bond optionally carries a list of integer quantum numbers, one per
//! bond direction, recording the conserved excitation count of one of the two
//! subsystems the bond separates.
//!
//! ```text
//!  qn[0]      qn[1]      qn[2]            qn[n-1]      qn[n]
//!    |  M[0]    |  M[1]    |   ...   ...    |   M[n-1]   |
//!    '---[]-----'---[]-----'---         ----'----[]------'
//!         |          |                            |
//! ```
//!
//! The canonical center `qnidx` splits the bonds in two: labels on bonds
//! `0..=qnidx` count excitations to the *left* of the bond, labels on bonds
//! `qnidx+1..=n` count excitations to the *right*, so that a label and its
//! complement always sum to `qntot`. Between public operations the train rests
//! in one of two states:
//!
//! - left-canonical, `qnidx == n - 1`: every site but the last is
//!   left-orthonormal;
//! - right-canonical, `qnidx == 0`: every site but the first is
//!   right-orthonormal.
//!
//! [`TensorTrain::canonicalise`] and [`TensorTrain::compress`] sweep from the
//! orthonormal end toward the center and leave the train in the opposite
//! canonical form.

use std::{ fmt, sync::Arc };
use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use rand::Rng;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, trace, warn };
use crate::{
    config::{ CompressMethod, ConfigError, TrainConfig },
    ephtable::EphTable,
    events::{ Direction, EventSink, SweepMode, TrainEvent },
    site::{ SiteError, SiteTensor, TrainKind },
    svd_qn::{ self, DecompError, DecompMode, QnDecomp, System },
};

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("{0}")]
    Site(#[from] SiteError),

    #[error("{0}")]
    Decomp(#[from] DecompError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("error in array reshape: {0}")]
    Shape(#[from] nd::ShapeError),

    /// Returned when attempting to create a train with no sites.
    #[error("error in train creation: cannot create an empty train")]
    EmptyTrain,

    /// Returned when a site of the wrong rank is placed in a train.
    #[error("site {site}: expected a {expected:?} tensor, got {found:?}")]
    KindMismatch { site: usize, expected: TrainKind, found: TrainKind },

    /// Returned when neighboring sites disagree on a bond dimension.
    #[error("bond {bond}: left site has dimension {left}, right site has dimension {right}")]
    BondMismatch { bond: usize, left: usize, right: usize },

    /// Returned when an outer bond has dimension other than 1.
    #[error("outer bond {bond} has dimension {dim}; expected 1")]
    OuterBond { bond: usize, dim: usize },

    /// Returned when a tensor with complex elements is placed in a real train.
    #[error("site {0}: complex-valued tensor in a real train")]
    ComplexInReal(usize),

    /// Returned when indexing past the end of the train.
    #[error("site index {index} out of bounds for a train of {len} sites")]
    OutOfBounds { index: usize, len: usize },

    /// Returned when appending to a train whose quantum numbers are tracked.
    #[error("cannot append sites while quantum numbers are tracked")]
    QnTracked,

    /// Returned when quantum-number labels do not fit the bonds.
    #[error("quantum numbers: bond {bond} has dimension {dim} but {labels} labels")]
    QnMismatch { bond: usize, dim: usize, labels: usize },

    /// Returned when a canonical center is out of range.
    #[error("canonical center {qnidx} out of range for a train of {len} sites")]
    InvalidCenter { qnidx: usize, len: usize },

    /// Returned when no train with the requested total quantum number exists.
    #[error("total quantum number {qntot} cannot be reached (maximum {max})")]
    UnreachableTotal { qntot: i32, max: i32 },

    /// Returned when compression is requested on a train that fails its
    /// orthogonality check.
    #[error("train is not {0} canonical")]
    NotCanonical(Direction),

    /// Returned when a sweep encounters a site that is entirely zero.
    #[error("zero site tensor encountered at site {0}")]
    ZeroSite(usize),

    /// Returned when every singular value of a bond falls below the
    /// truncation threshold.
    #[error("all normalized singular values at bond {bond} are at or below {threshold}: {spectrum:?}")]
    ZeroTruncation { bond: usize, threshold: f64, spectrum: Vec<f64> },

    /// Returned when compressing with a threshold that would be read as a
    /// number of states to keep.
    #[error("truncation threshold {0} >= 1 (fixed bond dimension) is not supported")]
    IntegerThreshold(f64),

    /// Returned when compressing with a method other than SVD.
    #[error("compress method '{0}' is not supported")]
    UnsupportedCompress(CompressMethod),

    /// Returned when the operands of a binary operation are incompatible.
    #[error("incompatible operands: {what} differ ({left} vs {right})")]
    OperandMismatch { what: &'static str, left: String, right: String },

    /// Returned when paired sites have different physical dimensions.
    #[error("site {site}: physical dimensions {left:?} and {right:?} do not match")]
    PhysicalMismatch { site: usize, left: Vec<usize>, right: Vec<usize> },

    /// Returned when an operator is required but a state was given.
    #[error("expected an operator train")]
    NotOperator,

    /// Returned when a product state is given levels that do not fit its
    /// physical dimensions.
    #[error("site {site}: level {level} out of range for physical dimension {pdim}")]
    InvalidLevel { site: usize, level: usize, pdim: usize },

    /// Returned when normalizing a train of zero norm.
    #[error("cannot normalize a train with zero norm")]
    ZeroNorm,
}
use TrainError::*;
pub type TrainResult<T> = Result<T, TrainError>;

/// Element type of a train's data.
///
/// Data is always stored as complex numbers; a `Real` train is guaranteed to
/// have zero imaginary parts everywhere. Promotion is one-way.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    #[default]
    Real,
    Complex,
}

/// A matrix product state or operator.
///
/// Sites are owned exclusively by the train and replaced wholesale on update.
/// [`Clone`] deep-copies all site data; the attached [`EphTable`] and
/// [`EventSink`] are shared.
#[derive(Clone, Debug)]
pub struct TensorTrain {
    pub(crate) kind: TrainKind,
    // length n ≥ 1; site k has bonds (k, k + 1)
    pub(crate) sites: Vec<SiteTensor>,
    pub(crate) dtype: ElementType,
    // length n + 1 when tracked
    pub(crate) qn: Option<Vec<Vec<i32>>>,
    pub(crate) qnidx: usize,
    pub(crate) qntot: i32,
    pub(crate) config: TrainConfig,
    pub(crate) peak_bytes: usize,
    pub(crate) ephtable: Option<Arc<dyn EphTable>>,
    pub(crate) sink: Option<Arc<dyn EventSink>>,
}

impl TensorTrain {
    /// Create a new train from a raw list of sites.
    ///
    /// All sites must be of the same kind, neighboring bond dimensions must
    /// agree, and both outer bonds must have dimension 1. The element type is
    /// complex if any site has a non-zero imaginary part. Quantum numbers are
    /// not tracked until [`Self::build_empty_qn`] or [`Self::set_qn`].
    pub fn from_sites<I>(sites: I) -> TrainResult<Self>
    where I: IntoIterator<Item = SiteTensor>
    {
        let sites: Vec<SiteTensor> = sites.into_iter().collect();
        let Some(first) = sites.first() else { return Err(EmptyTrain); };
        let kind = first.kind();
        for (k, site) in sites.iter().enumerate() {
            if site.kind() != kind {
                return Err(KindMismatch { site: k, expected: kind, found: site.kind() });
            }
        }
        for (k, (a, b)) in sites.iter().tuple_windows().enumerate() {
            let (left, right) = (a.bond_dim().1, b.bond_dim().0);
            if left != right { return Err(BondMismatch { bond: k + 1, left, right }); }
        }
        let n = sites.len();
        let (l0, _) = sites[0].bond_dim();
        if l0 != 1 { return Err(OuterBond { bond: 0, dim: l0 }); }
        let (_, rn) = sites[n - 1].bond_dim();
        if rn != 1 { return Err(OuterBond { bond: n, dim: rn }); }
        let dtype
            = if sites.iter().any(SiteTensor::has_imag) {
                ElementType::Complex
            } else {
                ElementType::Real
            };
        let mut new = Self {
            kind,
            sites,
            dtype,
            qn: None,
            qnidx: 0,
            qntot: 0,
            config: TrainConfig::default(),
            peak_bytes: 0,
            ephtable: None,
            sink: None,
        };
        new.set_peak_bytes(None);
        Ok(new)
    }

    /// Attach an electron-phonon table, used to compute the quantum-number
    /// increments of each site.
    pub fn with_ephtable(mut self, table: Arc<dyn EphTable>) -> Self {
        self.ephtable = Some(table);
        self
    }

    /// Attach an event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace the compression/propagation settings.
    pub fn with_config(mut self, config: TrainConfig) -> Self {
        self.config = config;
        self
    }

    /// Return the kind of the train.
    pub fn kind(&self) -> TrainKind { self.kind }

    /// Return `true` if the train is a matrix product state.
    pub fn is_mps(&self) -> bool { self.kind.is_state() }

    /// Return `true` if the train is a matrix product operator.
    pub fn is_mpo(&self) -> bool { self.kind.is_operator() }

    /// Return the number of sites.
    pub fn len(&self) -> usize { self.sites.len() }

    /// Always `false`; trains hold at least one site.
    pub fn is_empty(&self) -> bool { self.sites.is_empty() }

    /// Return the sites.
    pub fn sites(&self) -> &[SiteTensor] { &self.sites }

    /// Consume the train, returning its sites.
    pub fn into_sites(self) -> Vec<SiteTensor> { self.sites }

    /// Return the `k`-th site, if it exists.
    pub fn get(&self, k: usize) -> Option<&SiteTensor> { self.sites.get(k) }

    /// Replace the `k`-th site.
    ///
    /// Fails if `k` is out of bounds or the new site's kind, bond dimensions,
    /// or element type are incompatible with the train.
    pub fn set(&mut self, k: usize, site: SiteTensor) -> TrainResult<&mut Self> {
        let n = self.len();
        let old = self.sites.get(k).ok_or(OutOfBounds { index: k, len: n })?;
        self.check_site(k, &site)?;
        if old.bond_dim() != site.bond_dim() {
            let (ol, or) = old.bond_dim();
            let (nl, nr) = site.bond_dim();
            return if ol != nl {
                Err(BondMismatch { bond: k, left: ol, right: nl })
            } else {
                Err(BondMismatch { bond: k + 1, left: or, right: nr })
            };
        }
        self.sites[k] = site;
        self.set_peak_bytes(None);
        Ok(self)
    }

    /// Append a site to the right end of the train.
    ///
    /// The current last site must have a right bond equal to the new site's
    /// left bond, and the new site must have a right bond of dimension 1.
    /// Fails if quantum numbers are tracked.
    pub fn push(&mut self, site: SiteTensor) -> TrainResult<&mut Self> {
        if self.qn.is_some() { return Err(QnTracked); }
        let n = self.len();
        self.check_site(n, &site)?;
        let (_, left) = self.sites[n - 1].bond_dim();
        let (right, rn) = site.bond_dim();
        if left != right { return Err(BondMismatch { bond: n, left, right }); }
        if rn != 1 { return Err(OuterBond { bond: n + 1, dim: rn }); }
        self.sites.push(site);
        self.set_peak_bytes(None);
        Ok(self)
    }

    fn check_site(&self, k: usize, site: &SiteTensor) -> TrainResult<()> {
        if site.kind() != self.kind {
            return Err(KindMismatch { site: k, expected: self.kind, found: site.kind() });
        }
        if self.dtype == ElementType::Real && site.has_imag() {
            return Err(ComplexInReal(k));
        }
        Ok(())
    }

    /// Return the element type.
    pub fn element_type(&self) -> ElementType { self.dtype }

    /// Return `true` if the element type is complex.
    pub fn is_complex(&self) -> bool { self.dtype == ElementType::Complex }

    /// Promote the element type to complex.
    pub fn to_complex(&mut self) -> &mut Self {
        self.dtype = ElementType::Complex;
        self
    }

    /// Return the bond dimensions, including both outer bonds.
    pub fn bond_dims(&self) -> Vec<usize> {
        self.sites.iter()
            .map(|site| site.bond_dim().0)
            .chain(self.sites.last().map(|site| site.bond_dim().1))
            .collect()
    }

    /// Return the quantum numbers of all bonds, if tracked.
    pub fn qn(&self) -> Option<&[Vec<i32>]> { self.qn.as_deref() }

    /// Return the canonical center.
    pub fn qnidx(&self) -> usize { self.qnidx }

    /// Return the total quantum number.
    pub fn qntot(&self) -> i32 { self.qntot }

    /// Return `true` if the train is marked left-canonical.
    pub fn is_left_canon(&self) -> bool { self.qnidx == self.len() - 1 }

    /// Return `true` if the train is marked right-canonical.
    pub fn is_right_canon(&self) -> bool { self.qnidx == 0 }

    /// Return the compression/propagation settings.
    pub fn config(&self) -> &TrainConfig { &self.config }

    /// Return the compression/propagation settings mutably.
    pub fn config_mut(&mut self) -> &mut TrainConfig { &mut self.config }

    /// Return the truncation threshold.
    pub fn threshold(&self) -> f64 { self.config.threshold }

    /// Set the truncation threshold.
    pub fn set_threshold(&mut self, threshold: f64) -> TrainResult<&mut Self> {
        self.config.set_threshold(threshold)?;
        Ok(self)
    }

    /// Set the compression method by name.
    pub fn set_compress_method(&mut self, name: &str) -> TrainResult<&mut Self> {
        self.config.set_compress_method(name)?;
        Ok(self)
    }

    /// Set the propagation method by name.
    pub fn set_prop_method(&mut self, name: &str) -> TrainResult<&mut Self> {
        self.config.set_prop_method(name)?;
        Ok(self)
    }

    /// Return the number of bytes held in all sites.
    pub fn total_bytes(&self) -> usize { self.sites.iter().map(SiteTensor::nbytes).sum() }

    /// Return the memory high-water mark observed so far.
    pub fn peak_bytes(&self) -> usize { self.peak_bytes }

    /// Raise the memory high-water mark to `new_bytes` (or the current total
    /// if `None`). Never lowers it.
    pub fn set_peak_bytes(&mut self, new_bytes: Option<usize>) {
        let bytes = new_bytes.unwrap_or_else(|| self.total_bytes());
        if bytes <= self.peak_bytes { return; }
        self.peak_bytes = bytes;
        debug!(bytes, "raised peak bytes");
        self.emit(TrainEvent::PeakBytes { bytes });
    }

    fn emit(&self, event: TrainEvent) {
        if let Some(sink) = &self.sink { sink.on_event(&event); }
    }

    /// Start tracking quantum numbers with all labels set to zero, a total of
    /// zero, and the canonical center at bond 0.
    pub fn build_empty_qn(&mut self) -> &mut Self {
        self.qntot = 0;
        self.qnidx = 0;
        self.qn = Some(self.bond_dims().into_iter().map(|d| vec![0; d]).collect());
        self
    }

    /// Stop tracking quantum numbers.
    pub fn build_none_qn(&mut self) -> &mut Self {
        self.qntot = 0;
        self.qnidx = 0;
        self.qn = None;
        self
    }

    /// Set quantum-number labels, canonical center, and total.
    ///
    /// Fails if there is not exactly one label per direction of every bond or
    /// if the center is out of range.
    pub fn set_qn(&mut self, qn: Vec<Vec<i32>>, qnidx: usize, qntot: i32)
        -> TrainResult<&mut Self>
    {
        let dims = self.bond_dims();
        if qn.len() != dims.len() {
            return Err(QnMismatch { bond: dims.len(), dim: dims.len(), labels: qn.len() });
        }
        for (bond, (d, labels)) in dims.iter().zip(&qn).enumerate() {
            if *d != labels.len() {
                return Err(QnMismatch { bond, dim: *d, labels: labels.len() });
            }
        }
        if qnidx >= self.len() {
            return Err(InvalidCenter { qnidx, len: self.len() });
        }
        self.qn = Some(qn);
        self.qnidx = qnidx;
        self.qntot = qntot;
        Ok(self)
    }

    /// Return all bond labels expressed as left-subsystem counts, so that they
    /// run from 0 at the left end to `qntot` at the right end.
    pub fn left_system_qn(&self) -> Option<Vec<Vec<i32>>> {
        let qn = self.qn.as_ref()?;
        let labels
            = qn.iter().enumerate()
            .map(|(bond, labels)| {
                if bond <= self.qnidx {
                    labels.clone()
                } else {
                    labels.iter().map(|q| self.qntot - q).collect()
                }
            })
            .collect();
        Some(labels)
    }

    /// Move the canonical center to bond `dstidx` by complementing labels,
    /// without touching any site.
    pub fn move_qnidx(&mut self, dstidx: usize) -> TrainResult<&mut Self> {
        let n = self.len();
        if dstidx >= n { return Err(InvalidCenter { qnidx: dstidx, len: n }); }
        let qntot = self.qntot;
        if let Some(qn) = &mut self.qn {
            // right-system labels to left-system
            (self.qnidx + 1..n).for_each(|b| {
                qn[b].iter_mut().for_each(|q| { *q = qntot - *q; });
            });
            // then back for everything right of the destination
            (dstidx + 1..n).for_each(|b| {
                qn[b].iter_mut().for_each(|q| { *q = qntot - *q; });
            });
        }
        self.qnidx = dstidx;
        Ok(self)
    }

    /// Check that every site but the last is left-orthonormal.
    pub fn check_left_canonical(&self) -> bool {
        self.sites[..self.len() - 1].iter().all(SiteTensor::check_lortho)
    }

    /// Check that every site but the first is right-orthonormal.
    pub fn check_right_canonical(&self) -> bool {
        self.sites[1..].iter().all(SiteTensor::check_rortho)
    }

    // quantum-number increments of the flattened physical index of site `idx`
    fn site_sigma_qn(&self, idx: usize) -> Vec<i32> {
        let site = &self.sites[idx];
        match &self.ephtable {
            Some(table) => site.sigma_qn(|d| table.sigma_qn(idx, d)),
            None => vec![0; site.pdim_prod()],
        }
    }

    // row and column labels of site `idx` combined for the current sweep
    fn big_qn(&self, idx: usize) -> (Vec<i32>, Vec<i32>) {
        let left = self.is_left_canon();
        let site = &self.sites[idx];
        let (l, r) = site.bond_dim();
        let p = site.pdim_prod();
        // untracked: a single sector, left count 0 against right count qntot
        let Some(qn) = &self.qn else {
            return if left {
                (vec![0; l], vec![self.qntot; p * r])
            } else {
                (vec![0; l * p], vec![self.qntot; r])
            };
        };
        let sigmaqn = self.site_sigma_qn(idx);
        let qnl = &qn[idx];
        let qnr = &qn[idx + 1];
        if left {
            let qnbigr
                = sigmaqn.iter().cartesian_product(qnr)
                .map(|(s, q)| s + q)
                .collect();
            (qnl.clone(), qnbigr)
        } else {
            let qnbigl
                = qnl.iter().cartesian_product(&sigmaqn)
                .map(|(q, s)| q + s)
                .collect();
            (qnbigl, qnr.clone())
        }
    }

    // sites visited by a sweep from the current canonical form
    fn iter_idx_list(&self) -> Vec<usize> {
        let n = self.len();
        if self.is_left_canon() {
            (1..n).rev().collect()
        } else {
            (0..n - 1).collect()
        }
    }

    fn switch_domain(&mut self) {
        self.qnidx = if self.is_left_canon() { 0 } else { self.len() - 1 };
    }

    // number of singular values kept at `bond`
    fn truncation(&self, bond: usize, sigma: &[f64]) -> TrainResult<usize> {
        let threshold = self.config.threshold;
        let norm = sigma.iter().map(|s| s * s).sum::<f64>().sqrt();
        let spectrum: Vec<f64> = sigma.iter().map(|s| s / norm).collect();
        let m_trunc = spectrum.iter().filter(|s| **s > threshold).count();
        if m_trunc == 0 {
            warn!(bond, threshold, "no singular values above threshold");
            return Err(ZeroTruncation { bond, threshold, spectrum });
        }
        Ok(m_trunc)
    }

    // absorb the non-orthogonal factor of a decomposition of site `idx` into
    // its neighbor toward the canonical center and replace site `idx` with the
    // orthogonal factor, both truncated to `m_trunc` directions
    fn update_ms(&mut self, idx: usize, dec: QnDecomp, m_trunc: usize)
        -> TrainResult<()>
    {
        let left = self.is_left_canon();
        let QnDecomp { u, sigma, qnl, vt, qnr } = dec;
        let mut u = u.slice(nd::s![.., ..m_trunc]).to_owned();
        let mut vt = vt.slice(nd::s![..m_trunc, ..]).to_owned();
        if let Some(sigma) = sigma {
            let (target, axis) = if left { (&mut u, 1) } else { (&mut vt, 0) };
            target.axis_iter_mut(nd::Axis(axis))
                .zip(&sigma[..m_trunc])
                .for_each(|(mut v, s)| { v.map_inplace(|x| { *x *= *s; }); });
        }
        let kind = self.sites[idx].kind();
        let pdim = self.sites[idx].pdim();
        let new_site
            = if left {
                self.sites[idx - 1] = self.sites[idx - 1].fold_right_bond(&u)?;
                if let Some(qn) = &mut self.qn { qn[idx] = qnr[..m_trunc].to_vec(); }
                SiteTensor::from_r_combined(kind, vt, &pdim)?
            } else {
                self.sites[idx + 1] = self.sites[idx + 1].fold_left_bond(&vt)?;
                if let Some(qn) = &mut self.qn { qn[idx + 1] = qnl[..m_trunc].to_vec(); }
                SiteTensor::from_l_combined(kind, u, &pdim)?
            };
        if new_site.is_zero() { return Err(ZeroSite(idx)); }
        self.sites[idx] = new_site;
        Ok(())
    }

    fn sweep(&mut self, mode: DecompMode) -> TrainResult<()> {
        if !self.is_left_canon() && !self.is_right_canon() { self.move_qnidx(0)?; }
        let left = self.is_left_canon();
        let (system, direction)
            = if left {
                (System::R, Direction::RightToLeft)
            } else {
                (System::L, Direction::LeftToRight)
            };
        for idx in self.iter_idx_list() {
            let site = &self.sites[idx];
            if site.is_zero() { return Err(ZeroSite(idx)); }
            let mat = if left { site.r_combine()? } else { site.l_combine()? };
            let (qnbigl, qnbigr) = self.big_qn(idx);
            let dec
                = svd_qn::decompose(&mat, &qnbigl, &qnbigr, self.qntot, mode, system)?;
            let m_trunc
                = match &dec.sigma {
                    Some(sigma) => {
                        let bond = if left { idx } else { idx + 1 };
                        let m_trunc = self.truncation(bond, sigma)?;
                        trace!(bond, kept = m_trunc, total = sigma.len(), "truncated bond");
                        self.emit(TrainEvent::BondTruncated {
                            bond,
                            kept: m_trunc,
                            total: sigma.len(),
                        });
                        m_trunc
                    },
                    None => dec.rank(),
                };
            self.update_ms(idx, dec, m_trunc)?;
        }
        self.switch_domain();
        let sweep_mode
            = match mode {
                DecompMode::Qr => SweepMode::Canonicalise,
                DecompMode::Svd => SweepMode::Compress,
            };
        let bond_dims = self.bond_dims();
        debug!(?sweep_mode, ?direction, ?bond_dims, "finished sweep");
        self.emit(TrainEvent::Swept { kind: self.kind, mode: sweep_mode, direction, bond_dims });
        self.set_peak_bytes(None);
        Ok(())
    }

    /// Bring the train into canonical form without truncation.
    ///
    /// A left-canonical train is swept right to left and becomes
    /// right-canonical; any other train is swept left to right and becomes
    /// left-canonical. Fails if a zero site is encountered.
    pub fn canonicalise(&mut self) -> TrainResult<&mut Self> {
        self.sweep(DecompMode::Qr)?;
        Ok(self)
    }

    /// Compress the train by a truncated SVD sweep, after checking that it is
    /// canonical in its current direction.
    ///
    /// See [`Self::compress_with`].
    pub fn compress(&mut self) -> TrainResult<&mut Self> {
        self.compress_with(true)
    }

    /// Compress the train by a truncated SVD sweep, optionally skipping the
    /// canonical-form check.
    ///
    /// At every bond, singular values are normalized and those above the
    /// truncation threshold are kept. The train ends in the canonical form
    /// opposite to the one it started in.
    ///
    /// Fails if the compression method is not SVD, the threshold is `>= 1`,
    /// the train is not canonical (when checked), or a bond would keep no
    /// singular values.
    pub fn compress_with(&mut self, check_canonical: bool) -> TrainResult<&mut Self> {
        if self.config.compress_method != CompressMethod::Svd {
            return Err(UnsupportedCompress(self.config.compress_method));
        }
        let threshold = self.config.threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::InvalidThreshold(threshold).into());
        }
        if threshold >= 1.0 { return Err(IntegerThreshold(threshold)); }
        if check_canonical {
            if self.is_left_canon() {
                if !self.check_left_canonical() {
                    return Err(NotCanonical(Direction::LeftToRight));
                }
            } else if !self.check_right_canonical() {
                return Err(NotCanonical(Direction::RightToLeft));
            }
        }
        self.sweep(DecompMode::Svd)?;
        Ok(self)
    }

    /// Return the elementwise complex conjugate.
    pub fn conj(&self) -> Self {
        let mut new = self.clone();
        new.sites.iter_mut().for_each(|site| { *site = site.conj(); });
        new
    }

    /// Multiply the train by `val` in place, applied to the site at the
    /// canonical center.
    ///
    /// Promotes the element type to complex if `val` has a non-zero imaginary
    /// part.
    pub fn scale(&mut self, val: C64) -> &mut Self {
        if val.im != 0.0 { self.to_complex(); }
        let k = self.qnidx.min(self.len() - 1);
        self.sites[k].scale_inplace(val);
        self
    }

    /// Like [`Self::scale`], but on a copy.
    pub fn scaled(&self, val: C64) -> Self {
        let mut new = self.clone();
        new.scale(val);
        new
    }

    /// Compute the bilinear product `Σ self · other` over all bond and
    /// physical indices, without conjugation.
    ///
    /// Fails if the trains differ in length or kind or if paired sites have
    /// different physical dimensions.
    pub fn dot(&self, other: &Self) -> TrainResult<C64> {
        if self.len() != other.len() {
            return Err(OperandMismatch {
                what: "site counts",
                left: self.len().to_string(),
                right: other.len().to_string(),
            });
        }
        if self.kind != other.kind {
            return Err(OperandMismatch {
                what: "train kinds",
                left: format!("{:?}", self.kind),
                right: format!("{:?}", other.kind),
            });
        }
        // e0[i, j]: open bond i of `self` and bond j of `other`
        let mut e0: nd::Array2<C64> = nd::Array2::ones((1, 1));
        for (k, (a, b)) in self.sites.iter().zip(&other.sites).enumerate() {
            if a.pdim() != b.pdim() {
                return Err(PhysicalMismatch { site: k, left: a.pdim(), right: b.pdim() });
            }
            let (la, _) = a.bond_dim();
            let (_, rb) = b.bond_dim();
            let p = a.pdim_prod();
            let t = e0.dot(&b.r_combine()?);
            let t = reshape2(&t, (la * p, rb))?;
            e0 = a.l_combine()?.t().dot(&t);
        }
        Ok(e0[[0, 0]])
    }

    /// Compute the norm `sqrt(Re⟨self|self⟩)`.
    pub fn norm(&self) -> TrainResult<f64> {
        let sq = self.conj().dot(self)?.re;
        Ok(sq.max(0.0).sqrt())
    }

    /// Rescale to the given norm.
    ///
    /// Fails if the current norm is zero.
    pub fn normalize(&mut self, norm: f64) -> TrainResult<&mut Self> {
        let current = self.norm()?;
        if current == 0.0 { return Err(ZeroNorm); }
        self.scale(C64::from(norm / current));
        Ok(self)
    }

    /// Compute `|⟨self|other⟩|`.
    pub fn angle(&self, other: &Self) -> TrainResult<f64> {
        Ok(self.conj().dot(other)?.norm())
    }

    /// Compute the phase-insensitive squared distance
    /// `⟨a|a⟩ - |⟨a|b⟩| - |⟨b|a⟩| + ⟨b|b⟩`.
    pub fn distance(&self, other: &Self) -> TrainResult<f64> {
        let aa = self.conj().dot(self)?;
        let ab = self.conj().dot(other)?;
        let ba = other.conj().dot(self)?;
        let bb = other.conj().dot(other)?;
        Ok((aa - C64::from(ab.norm()) - C64::from(ba.norm()) + bb).re)
    }

    /// Compute `Re⟨self|op|self⟩ / ⟨self|self⟩`.
    pub fn expectation(&self, op: &Self) -> TrainResult<f64> {
        let applied = op.apply(self)?;
        let num = self.conj().dot(&applied)?.re;
        let norm = self.norm()?;
        Ok(num / (norm * norm))
    }

    /// Return `true` if both trains have the same length and all sites agree
    /// elementwise to within `tol`.
    pub fn approx_eq(&self, other: &Self, tol: f64) -> bool {
        self.len() == other.len()
            && self.sites.iter().zip(&other.sites).all(|(a, b)| a.approx_eq(b, tol))
    }

    /// Form the direct sum `self + other`.
    ///
    /// Both trains must have the same kind, length, total quantum number, and
    /// canonical direction. Outer bonds are stacked and inner bonds become
    /// block-diagonal, so inner bond dimensions add. The result inherits the
    /// settings of `other` with the smaller of the two thresholds, and its
    /// quantum numbers are laid out around the center of `self`. If
    /// `compress_add` is set on `self`, the result is canonicalised and compressed
    /// before being returned.
    pub fn add(&self, other: &Self) -> TrainResult<Self> {
        if self.kind != other.kind {
            return Err(OperandMismatch {
                what: "train kinds",
                left: format!("{:?}", self.kind),
                right: format!("{:?}", other.kind),
            });
        }
        if self.len() != other.len() {
            return Err(OperandMismatch {
                what: "site counts",
                left: self.len().to_string(),
                right: other.len().to_string(),
            });
        }
        if self.qntot != other.qntot {
            return Err(OperandMismatch {
                what: "total quantum numbers",
                left: self.qntot.to_string(),
                right: other.qntot.to_string(),
            });
        }
        if self.is_left_canon() != other.is_left_canon() {
            return Err(OperandMismatch {
                what: "canonical directions",
                left: self.qnidx.to_string(),
                right: other.qnidx.to_string(),
            });
        }

        let n = self.len();
        let mut new = other.clone();
        new.config.threshold = self.config.threshold.min(other.config.threshold);
        if self.is_complex() { new.to_complex(); }
        for (k, (a, b)) in self.sites.iter().zip(&other.sites).enumerate() {
            if a.pdim() != b.pdim() {
                return Err(PhysicalMismatch { site: k, left: a.pdim(), right: b.pdim() });
            }
            let a3 = a.to_array3()?;
            let b3 = b.to_array3()?;
            let sum
                = if n == 1 {
                    a3 + b3
                } else if k == 0 {
                    nd::concatenate(nd::Axis(2), &[a3.view(), b3.view()])?
                } else if k == n - 1 {
                    nd::concatenate(nd::Axis(0), &[a3.view(), b3.view()])?
                } else {
                    let (la, p, ra) = a3.dim();
                    let (lb, _, rb) = b3.dim();
                    let mut sum: nd::Array3<C64> = nd::Array3::zeros((la + lb, p, ra + rb));
                    sum.slice_mut(nd::s![..la, .., ..ra]).assign(&a3);
                    sum.slice_mut(nd::s![la.., .., ra..]).assign(&b3);
                    sum
                };
            new.sites[k] = SiteTensor::from_array3(self.kind, sum, &a.pdim())?;
        }

        new.move_qnidx(self.qnidx)?;
        new.qn
            = match (&self.qn, &new.qn) {
                (Some(qa), Some(qb)) => {
                    let mut qn: Vec<Vec<i32>>
                        = qa.iter().zip(qb)
                        .map(|(la, lb)| la.iter().chain(lb).copied().collect())
                        .collect();
                    qn[0] = vec![0];
                    qn[n] = vec![0];
                    Some(qn)
                },
                _ => None,
            };
        new.set_peak_bytes(None);
        if self.config.compress_add {
            new.canonicalise()?;
            new.compress()?;
        }
        Ok(new)
    }

    /// Apply `self`, which must be an operator, to `other`.
    ///
    /// Bond dimensions multiply and no compression is performed. Quantum
    /// numbers (if tracked on both) are summed pairwise after moving the
    /// operator's center to that of `other`, and the totals add. The result
    /// is of the same kind as `other` and inherits its settings.
    pub fn apply(&self, other: &Self) -> TrainResult<Self> {
        if !self.is_mpo() { return Err(NotOperator); }
        if self.len() != other.len() {
            return Err(OperandMismatch {
                what: "site counts",
                left: self.len().to_string(),
                right: other.len().to_string(),
            });
        }
        let mut new = other.clone();
        if self.is_complex() { new.to_complex(); }
        for (k, (o, m)) in self.sites.iter().zip(&other.sites).enumerate() {
            new.sites[k] = apply_site(k, o, m)?;
        }
        if let (Some(_), Some(qm)) = (&self.qn, &other.qn) {
            let mut op = self.clone();
            op.move_qnidx(other.qnidx)?;
            let qo = op.qn.as_ref().map(Vec::as_slice).unwrap_or_default();
            let qn: Vec<Vec<i32>>
                = qo.iter().zip(qm)
                .map(|(lo, lm)| {
                    lo.iter().cartesian_product(lm).map(|(a, b)| a + b).collect()
                })
                .collect();
            new.qn = Some(qn);
            new.qntot = op.qntot + other.qntot;
        } else {
            new.qn = None;
        }
        new.set_peak_bytes(None);
        Ok(new)
    }

    /// Apply `self` to `other`, then canonicalise and compress the result
    /// with the settings of `other`.
    pub fn contract(&self, other: &Self) -> TrainResult<Self> {
        let mut new = self.apply(other)?;
        new.canonicalise()?;
        new.compress()?;
        Ok(new)
    }

    /// Create a random real state with the given physical dimensions whose
    /// entries respect quantum-number conservation with total `qntot`.
    ///
    /// Bond dimensions are at most about `max_bond`, spread evenly over the
    /// labels allowed at each bond. The returned train has quantum numbers
    /// built and is right-canonical.
    ///
    /// Fails if `qntot` cannot be reached with the increments given by
    /// `table`.
    pub fn random_state<R>(
        pdims: &[usize],
        table: Arc<dyn EphTable>,
        qntot: i32,
        max_bond: usize,
        rng: &mut R,
    ) -> TrainResult<Self>
    where R: Rng + ?Sized
    {
        let n = pdims.len();
        if n == 0 { return Err(EmptyTrain); }
        let sigmas: Vec<Vec<i32>>
            = pdims.iter().enumerate()
            .map(|(k, d)| table.sigma_qn(k, *d))
            .collect();
        // maximum number of excitations held left of each bond, and that can
        // still be added right of it
        let smax: Vec<i32>
            = sigmas.iter()
            .map(|s| s.iter().copied().max().unwrap_or(0).max(0))
            .collect();
        let mut reached: Vec<i32> = vec![0; n + 1];
        let mut remaining: Vec<i32> = vec![0; n + 1];
        for k in 0..n {
            reached[k + 1] = reached[k] + smax[k];
            remaining[n - 1 - k] = remaining[n - k] + smax[n - 1 - k];
        }
        if qntot < 0 || remaining[0] < qntot {
            return Err(UnreachableTotal { qntot, max: remaining[0] });
        }
        // left-system labels of every bond
        let labels: Vec<Vec<i32>>
            = (0..=n)
            .map(|b| {
                if b == 0 { return vec![0]; }
                if b == n { return vec![qntot]; }
                let allowed: Vec<i32>
                    = (0..=qntot.min(reached[b]))
                    .filter(|q| q + remaining[b] >= qntot)
                    .collect();
                let rep = (max_bond / allowed.len().max(1)).max(1);
                allowed.into_iter()
                    .flat_map(|q| std::iter::repeat(q).take(rep))
                    .collect()
            })
            .collect();
        let sites: Vec<SiteTensor>
            = (0..n)
            .map(|k| {
                let (ql, qr) = (&labels[k], &labels[k + 1]);
                SiteTensor::random_masked(
                    TrainKind::State,
                    (ql.len(), qr.len()),
                    &[pdims[k]],
                    false,
                    &mut *rng,
                    |l, p, r| ql[l] + sigmas[k][p] == qr[r],
                )
            })
            .collect::<Result<_, _>>()?;
        let mut qn = labels;
        qn[n] = vec![0];
        let mut new = Self::from_sites(sites)?.with_ephtable(table);
        new.set_qn(qn, n - 1, qntot)?;
        if n > 1 { new.canonicalise()?; }
        Ok(new)
    }
}

// apply a single operator site to a state or operator site
fn apply_site(k: usize, o: &SiteTensor, m: &SiteTensor) -> TrainResult<SiteTensor> {
    let SiteTensor::Operator(o) = o else { return Err(NotOperator); };
    let (ol, pu, pd, or) = o.dim();
    match m {
        SiteTensor::State(m) => {
            let (ml, mp, mr) = m.dim();
            if pd != mp {
                return Err(PhysicalMismatch { site: k, left: vec![pu, pd], right: vec![mp] });
            }
            let data: nd::Array3<C64>
                = nd::Array3::from_shape_fn(
                    (ol * ml, pu, or * mr),
                    |(ac, p, bd)| {
                        let (a, c) = (ac / ml, ac % ml);
                        let (b, d) = (bd / mr, bd % mr);
                        (0..pd)
                            .map(|q| o[[a, p, q, b]] * m[[c, q, d]])
                            .fold(C64::zero(), |acc, x| acc + x)
                    },
                );
            Ok(SiteTensor::State(data))
        },
        SiteTensor::Operator(m) => {
            let (ml, mu, md, mr) = m.dim();
            if pd != mu {
                return Err(PhysicalMismatch { site: k, left: vec![pu, pd], right: vec![mu, md] });
            }
            let data: nd::Array4<C64>
                = nd::Array4::from_shape_fn(
                    (ol * ml, pu, md, or * mr),
                    |(ac, p, r, bd)| {
                        let (a, c) = (ac / ml, ac % ml);
                        let (b, d) = (bd / mr, bd % mr);
                        (0..pd)
                            .map(|q| o[[a, p, q, b]] * m[[c, q, r, d]])
                            .fold(C64::zero(), |acc, x| acc + x)
                    },
                );
            Ok(SiteTensor::Operator(data))
        },
    }
}

fn reshape2(arr: &nd::Array2<C64>, shape: (usize, usize)) -> TrainResult<nd::Array2<C64>> {
    let elems: Vec<C64> = arr.iter().copied().collect();
    Ok(nd::Array2::from_shape_vec(shape, elems)?)
}

impl fmt::Display for TensorTrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mps() { "MPS" } else { "MPO" };
        write!(f, "{} with {} sites, bond dims {:?}", kind, self.len(), self.bond_dims())?;
        if let Some(qn) = &self.qn {
            write!(f, ", qntot {} at center {}: {:?}", self.qntot, self.qnidx, qn)?;
        }
        Ok(())
    }
}

/// Construct the identity operator on sites with the given physical
/// dimensions, with quantum numbers built.
pub fn identity_mpo(pdims: &[usize]) -> TrainResult<TensorTrain> {
    let sites: Vec<SiteTensor>
        = pdims.iter()
        .map(|d| -> TrainResult<SiteTensor> {
            let eye: nd::Array2<C64> = nd::Array2::eye(*d);
            let data = eye.into_shape((1, *d, *d, 1))?;
            Ok(SiteTensor::Operator(data))
        })
        .collect::<TrainResult<_>>()?;
    let mut mpo = TensorTrain::from_sites(sites)?;
    mpo.build_empty_qn();
    Ok(mpo)
}

/// Construct the operator `Σ_k h_k` for on-site diagonal terms
/// `h_k = diag(energies[k])`, with quantum numbers built.
///
/// Inner bonds have dimension 2: one direction carries the identity before
/// the on-site term has been placed, the other after.
pub fn onsite_mpo(energies: &[Vec<f64>]) -> TrainResult<TensorTrain> {
    let n = energies.len();
    let sites: Vec<SiteTensor>
        = energies.iter().enumerate()
        .map(|(k, e)| {
            let d = e.len();
            let (bl, br) = (if k == 0 { 1 } else { 2 }, if k == n - 1 { 1 } else { 2 });
            // bond direction 0: term placed; 1: not yet placed
            let data: nd::Array4<C64>
                = nd::Array4::from_shape_fn(
                    (bl, d, d, br),
                    |(a, p, q, b)| {
                        if p != q { return C64::zero(); }
                        let a = if k == 0 { 1 } else { a };
                        let b = if k == n - 1 { 0 } else { b };
                        match (a, b) {
                            (1, 0) => C64::from(e[p]),
                            (0, 0) | (1, 1) => C64::one(),
                            _ => C64::zero(),
                        }
                    },
                );
            SiteTensor::Operator(data)
        })
        .collect();
    let mut mpo = TensorTrain::from_sites(sites)?;
    mpo.build_empty_qn();
    Ok(mpo)
}

/// Construct a product state with the `k`-th site in level `levels[k]`.
///
/// Fails if `levels` and `pdims` differ in length or a level is out of range.
pub fn product_state(pdims: &[usize], levels: &[usize]) -> TrainResult<TensorTrain> {
    if pdims.len() != levels.len() {
        return Err(OperandMismatch {
            what: "site counts",
            left: pdims.len().to_string(),
            right: levels.len().to_string(),
        });
    }
    let sites: Vec<SiteTensor>
        = pdims.iter().zip(levels).enumerate()
        .map(|(k, (d, l))| {
            if l >= d { return Err(InvalidLevel { site: k, level: *l, pdim: *d }); }
            let mut data: nd::Array3<C64> = nd::Array3::zeros((1, *d, 1));
            data[[0, *l, 0]] = C64::one();
            Ok(SiteTensor::State(data))
        })
        .collect::<TrainResult<_>>()?;
    TensorTrain::from_sites(sites)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use crate::{ ephtable::{ SiteKind, SiteTable }, events::EventLog };

    fn table() -> Arc<dyn EphTable> {
        Arc::new(SiteTable(vec![
            SiteKind::Electron, SiteKind::Phonon, SiteKind::Electron, SiteKind::Phonon,
        ]))
    }

    fn random(seed: u64, qntot: i32) -> TensorTrain {
        let mut rng = StdRng::seed_from_u64(seed);
        TensorTrain::random_state(&[2, 3, 2, 3], table(), qntot, 6, &mut rng).unwrap()
    }

    #[test]
    fn construction_checks() {
        assert!(matches!(TensorTrain::from_sites(vec![]), Err(EmptyTrain)));
        let a = SiteTensor::zeros(TrainKind::State, (1, 2), &[2]).unwrap();
        let b = SiteTensor::zeros(TrainKind::State, (3, 1), &[2]).unwrap();
        assert!(matches!(
            TensorTrain::from_sites(vec![a.clone(), b]),
            Err(BondMismatch { bond: 1, left: 2, right: 3 }),
        ));
        let c = SiteTensor::zeros(TrainKind::Operator, (2, 1), &[2, 2]).unwrap();
        assert!(matches!(
            TensorTrain::from_sites(vec![a, c]),
            Err(KindMismatch { site: 1, .. }),
        ));

        let mut mps = product_state(&[2, 2], &[1, 0]).unwrap();
        assert_eq!(mps.bond_dims(), vec![1, 1, 1]);
        assert_eq!(mps.element_type(), ElementType::Real);
        let cplx = SiteTensor::State(nd::Array3::from_elem((1, 2, 1), C64::new(0.0, 1.0)));
        assert!(matches!(mps.set(0, cplx.clone()), Err(ComplexInReal(0))));
        mps.to_complex();
        mps.set(0, cplx).unwrap();
        let wide = SiteTensor::zeros(TrainKind::State, (1, 2), &[2]).unwrap();
        assert!(matches!(mps.set(1, wide), Err(BondMismatch { .. })));
        assert!(matches!(mps.set(5, SiteTensor::zeros(TrainKind::State, (1, 1), &[2]).unwrap()),
            Err(OutOfBounds { index: 5, len: 2 })));
    }

    #[test]
    fn push_and_qn_lengths() {
        let mut mps = product_state(&[2], &[0]).unwrap();
        mps.push(SiteTensor::zeros(TrainKind::State, (1, 1), &[3]).unwrap()).unwrap();
        assert_eq!(mps.len(), 2);
        mps.build_empty_qn();
        assert_eq!(mps.qn().unwrap().len(), 3);
        assert!(matches!(
            mps.push(SiteTensor::zeros(TrainKind::State, (1, 1), &[3]).unwrap()),
            Err(QnTracked),
        ));
        assert!(matches!(
            mps.set_qn(vec![vec![0], vec![0, 1], vec![0]], 0, 1),
            Err(QnMismatch { bond: 1, dim: 1, labels: 2 }),
        ));
        assert!(matches!(
            mps.set_qn(vec![vec![0], vec![0], vec![0]], 2, 1),
            Err(InvalidCenter { .. }),
        ));
    }

    #[test]
    fn random_state_is_right_canonical() {
        let mps = random(1, 1);
        assert!(mps.is_right_canon());
        assert!(mps.check_right_canonical());
        let qn = mps.qn().unwrap();
        mps.bond_dims().iter().zip(qn)
            .for_each(|(d, labels)| { assert_eq!(*d, labels.len()); });
        assert_eq!(qn[0], vec![0]);
        assert_eq!(qn[4], vec![0]);
        assert!(mps.norm().unwrap() > 0.0);
    }

    #[test]
    fn canonicalise_flips_direction_and_keeps_norm() {
        let mut mps = random(2, 1);
        let orig = mps.clone();
        let norm = mps.norm().unwrap();
        mps.canonicalise().unwrap();
        assert!(mps.is_left_canon());
        assert!(mps.check_left_canonical());
        assert_abs_diff_eq!(mps.norm().unwrap(), norm, epsilon = 1e-10 * norm);
        assert_abs_diff_eq!(
            mps.conj().dot(&orig).unwrap().re, norm * norm, epsilon = 1e-10 * norm * norm);
        mps.canonicalise().unwrap();
        assert!(mps.is_right_canon());
        assert!(mps.check_right_canonical());
    }

    #[test]
    fn left_system_labels_run_to_total() {
        let mut mps = random(3, 2);
        for _ in 0..2 {
            let labels = mps.left_system_qn().unwrap();
            assert_eq!(labels[0], vec![0]);
            assert_eq!(labels[4], vec![2]);
            labels.iter().flatten().for_each(|q| { assert!((0..=2).contains(q)); });
            mps.canonicalise().unwrap();
        }
    }

    #[test]
    fn move_qnidx_complements_labels() {
        let mut mps = random(4, 1);
        let before = mps.left_system_qn().unwrap();
        mps.move_qnidx(2).unwrap();
        assert_eq!(mps.qnidx(), 2);
        assert_eq!(mps.left_system_qn().unwrap(), before);
        let qn = mps.qn().unwrap();
        assert_eq!(qn[2], before[2]);
        assert_eq!(qn[3], before[3].iter().map(|q| 1 - q).collect::<Vec<_>>());
        mps.move_qnidx(0).unwrap();
        assert_eq!(mps.left_system_qn().unwrap(), before);
        assert!(mps.move_qnidx(4).is_err());
    }

    #[test]
    fn compress_requires_canonical_form() {
        let mut mps = random(5, 1);
        mps.sites[2].scale_inplace(C64::from(3.0));
        assert!(matches!(mps.compress(), Err(NotCanonical(Direction::RightToLeft))));
        mps.compress_with(false).unwrap();
        assert!(mps.is_left_canon());
    }

    #[test]
    fn compress_rejects_unsupported_settings() {
        let mut mps = random(6, 1);
        mps.config_mut().threshold = 2.0;
        assert!(matches!(mps.compress(), Err(IntegerThreshold(_))));
        mps.set_threshold(1e-3).unwrap();
        mps.set_compress_method("variational").unwrap();
        assert!(matches!(mps.compress(), Err(UnsupportedCompress(CompressMethod::Variational))));
        assert!(matches!(mps.set_compress_method("dmrg"), Err(Config(_))));
    }

    #[test]
    fn scale_promotes_and_norms() {
        let mut mps = random(7, 1);
        let norm = mps.norm().unwrap();
        let scaled = mps.scaled(C64::new(0.0, 2.0));
        assert!(scaled.is_complex());
        assert!(!mps.is_complex());
        assert_abs_diff_eq!(scaled.norm().unwrap(), 2.0 * norm, epsilon = 1e-10);
        mps.normalize(1.0).unwrap();
        assert_abs_diff_eq!(mps.norm().unwrap(), 1.0, epsilon = 1e-12);
        assert!(!mps.is_complex());
    }

    #[test]
    fn add_doubles_state() {
        let mps = random(8, 1);
        let norm = mps.norm().unwrap();
        let sum = mps.add(&mps).unwrap();
        let dims = sum.bond_dims();
        mps.bond_dims().iter().zip(&dims).enumerate()
            .for_each(|(b, (d, ds))| {
                if b == 0 || b == 4 { assert_eq!(*ds, 1); } else { assert_eq!(*ds, 2 * d); }
            });
        assert_abs_diff_eq!(sum.norm().unwrap(), 2.0 * norm, epsilon = 1e-10);

        // duplicated directions are removed by compression
        let mut single = mps.clone();
        single.set_threshold(1e-8).unwrap();
        single.canonicalise().unwrap();
        single.compress().unwrap();
        let mut compressed = sum.clone();
        compressed.set_threshold(1e-8).unwrap();
        compressed.canonicalise().unwrap();
        compressed.compress().unwrap();
        assert_eq!(compressed.bond_dims(), single.bond_dims());
        assert_abs_diff_eq!(compressed.norm().unwrap(), 2.0 * norm, epsilon = 1e-8);
    }

    #[test]
    fn add_checks_operands() {
        let a = random(9, 1);
        let b = random(10, 2);
        assert!(matches!(a.add(&b), Err(OperandMismatch { what: "total quantum numbers", .. })));
        let mut c = random(11, 1);
        c.canonicalise().unwrap();
        assert!(matches!(a.add(&c), Err(OperandMismatch { what: "canonical directions", .. })));
        let id = identity_mpo(&[2, 3, 2, 3]).unwrap();
        assert!(matches!(a.add(&id), Err(OperandMismatch { what: "train kinds", .. })));
    }

    #[test]
    fn compress_on_add_follows_left_operand() {
        let mut a = random(16, 1);
        a.config_mut().compress_add = true;
        a.set_threshold(1e-8).unwrap();
        let b = random(17, 1);
        assert!(!b.config().compress_add);

        // canonicalised and compressed: flipped twice, back to right-canonical
        let eager = a.add(&b).unwrap();
        assert!(eager.is_right_canon());
        assert!(eager.check_right_canonical());
        assert!(eager.bond_dims()[1] <= 2);

        // raw direct sum: the stacked last site is not right-orthonormal
        let lazy = b.add(&a).unwrap();
        assert_eq!(lazy.bond_dims()[1], a.bond_dims()[1] + b.bond_dims()[1]);
        assert!(!lazy.check_right_canonical());
        assert_abs_diff_eq!(eager.distance(&lazy).unwrap(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn product_state_checks_levels() {
        assert!(matches!(
            product_state(&[2, 3], &[1]),
            Err(OperandMismatch { what: "site counts", .. }),
        ));
        assert!(matches!(
            product_state(&[2, 3], &[1, 3]),
            Err(InvalidLevel { site: 1, level: 3, pdim: 3 }),
        ));
        let mps = product_state(&[2, 3], &[1, 2]).unwrap();
        assert_abs_diff_eq!(mps.norm().unwrap(), 1.0, epsilon = 1e-14);
    }

    #[test]
    fn untracked_operator_keeps_total() {
        let mps = random(18, 1);
        let sites: Vec<SiteTensor>
            = [2, 3, 2, 3].iter()
            .map(|d| {
                let eye: nd::Array2<C64> = nd::Array2::eye(*d);
                SiteTensor::Operator(eye.into_shape((1, *d, *d, 1)).unwrap())
            })
            .collect();
        let id = TensorTrain::from_sites(sites).unwrap();
        assert!(id.qn().is_none());
        let mut out = id.apply(&mps).unwrap();
        assert!(out.qn().is_none());
        assert_eq!(out.qntot(), 1);
        out.canonicalise().unwrap();
        out.compress().unwrap();
        assert_abs_diff_eq!(out.norm().unwrap(), mps.norm().unwrap(), epsilon = 1e-10);
        let contracted = id.contract(&mps).unwrap();
        assert_abs_diff_eq!(
            contracted.angle(&mps).unwrap(), mps.norm().unwrap().powi(2), epsilon = 1e-10);
    }

    #[test]
    fn single_site_add_sums() {
        let a = product_state(&[3], &[0]).unwrap();
        let b = product_state(&[3], &[2]).unwrap();
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.bond_dims(), vec![1, 1]);
        assert_abs_diff_eq!(sum.norm().unwrap(), 2.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn identity_application() {
        let mps = random(12, 1);
        let id = identity_mpo(&[2, 3, 2, 3]).unwrap();
        let applied = id.apply(&mps).unwrap();
        assert_eq!(applied.bond_dims(), mps.bond_dims());
        assert_eq!(applied.qntot(), 1);
        assert!(applied.approx_eq(&mps, 1e-14));
        let norm = mps.norm().unwrap();
        assert_abs_diff_eq!(mps.expectation(&id).unwrap(), 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(mps.distance(&applied).unwrap(), 0.0, epsilon = 1e-10);
        assert_abs_diff_eq!(mps.angle(&applied).unwrap(), norm * norm, epsilon = 1e-10);
        assert!(matches!(mps.apply(&mps), Err(NotOperator)));
    }

    #[test]
    fn operator_dot_is_trace() {
        let id = identity_mpo(&[2, 3]).unwrap();
        // Tr(1ᵀ 1) = 6
        assert_abs_diff_eq!(id.dot(&id).unwrap().re, 6.0, epsilon = 1e-12);
        let id2 = id.apply(&id).unwrap();
        assert!(id2.is_mpo());
        assert!(id2.approx_eq(&id, 1e-14));
    }

    #[test]
    fn onsite_expectation() {
        let h = onsite_mpo(&[vec![0.0, 1.0], vec![0.0, 0.5, 2.0], vec![3.0, 0.0]]).unwrap();
        assert_eq!(h.bond_dims(), vec![1, 2, 2, 1]);
        let mps = product_state(&[2, 3, 2], &[1, 2, 0]).unwrap();
        assert_abs_diff_eq!(mps.expectation(&h).unwrap(), 1.0 + 2.0 + 3.0, epsilon = 1e-12);
        let single = onsite_mpo(&[vec![0.5, 1.5]]).unwrap();
        let mps = product_state(&[2], &[1]).unwrap();
        assert_abs_diff_eq!(mps.expectation(&single).unwrap(), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn zero_site_is_fatal() {
        let mut mps = random(13, 1);
        mps.sites[0] = SiteTensor::zeros(TrainKind::State, mps.sites[0].bond_dim(), &[2])
            .unwrap();
        assert!(matches!(mps.canonicalise(), Err(ZeroSite(0))));
    }

    #[test]
    fn peak_bytes_are_monotone_and_reported() {
        let log = Arc::new(EventLog::new());
        let mps = random(14, 1).with_sink(log.clone());
        let peak0 = mps.peak_bytes();
        let mut sum = mps.add(&mps).unwrap();
        assert!(sum.peak_bytes() > peak0);
        let peak1 = sum.peak_bytes();
        sum.canonicalise().unwrap();
        sum.compress().unwrap();
        assert!(sum.peak_bytes() >= peak1);
        assert_eq!(log.peak_bytes(), Some(sum.peak_bytes()));
        assert!(log.events().iter().any(|ev| matches!(ev, TrainEvent::BondTruncated { .. })));
        assert!(log.events().iter().any(|ev| matches!(ev, TrainEvent::Swept { .. })));
    }

    #[test]
    fn untracked_qn_sweeps() {
        let mut mps = random(15, 1);
        mps.build_none_qn();
        let norm = mps.norm().unwrap();
        mps.canonicalise().unwrap();
        assert!(mps.check_left_canonical());
        mps.compress().unwrap();
        assert!(mps.check_right_canonical());
        assert!(mps.qn().is_none());
        assert_abs_diff_eq!(mps.norm().unwrap(), norm, epsilon = 1e-3 * norm);
    }
}
