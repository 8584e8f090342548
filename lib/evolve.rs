//! Short-time evolution of tensor trains under a Hamiltonian operator.
//!
//! [`TensorTrain::evolve`] expands `exp(-i H dt)` as a truncated Taylor series
//! whose weights come from the configured Runge-Kutta scheme,
//!
//! ```text
//! |ψ(t + dt)> ≈ Σ_k c_k (-i dt)^k H^k |ψ(t)>,
//! ```
//!
//! building every power `H^k |ψ>` by contracting and compressing the previous
//! one. [`TensorTrain::evolve_exact`] skips the series and hands the state to a
//! precomputed [`Propagator`].

use ndarray as nd;
use num_complex::Complex64 as C64;
use tracing::debug;
use crate::{
    mp::{ TensorTrain, TrainError, TrainResult },
    site::SiteTensor,
};

/// Growth factor applied to the truncation threshold of each successive
/// Taylor term.
pub const THRESHOLD_GROWTH: f64 = 3.0;

/// An object that advances a state train by one fixed time step.
pub trait Propagator {
    /// Return the propagated train.
    fn propagate(&self, train: &TensorTrain) -> TrainResult<TensorTrain>;
}

/// Operator trains propagate by contraction, with the settings of the state.
impl Propagator for TensorTrain {
    fn propagate(&self, train: &TensorTrain) -> TrainResult<TensorTrain> {
        self.contract(train)
    }
}

impl TensorTrain {
    /// Evolve by one time step `dt` under the Hamiltonian `mpo`.
    ///
    /// Each Taylor term is computed from the last by [`TensorTrain::contract`]
    /// with the truncation threshold relaxed by [`THRESHOLD_GROWTH`], scaled by
    /// `(-i dt)^k c_k`, and all terms are summed. The sum is canonicalised and
    /// compressed unless `compress_add` is set, in which case every addition
    /// already compressed. If `norm` is given, the result is rescaled to it.
    ///
    /// `self` is left untouched.
    pub fn evolve(&self, mpo: &TensorTrain, dt: f64, norm: Option<f64>)
        -> TrainResult<TensorTrain>
    {
        if !mpo.is_mpo() { return Err(TrainError::NotOperator); }
        let method = self.config.prop_method;
        let coeffs = method.coefficients();
        let mut terms: Vec<TensorTrain> = Vec::with_capacity(coeffs.len());
        terms.push(self.clone());
        while terms.len() < coeffs.len() {
            let Some(last) = terms.last() else { break; };
            let mut next = mpo.contract(last)?;
            next.config.threshold *= THRESHOLD_GROWTH;
            terms.push(next);
        }
        let mut factor = C64::new(1.0, 0.0);
        let minus_i_dt = C64::new(0.0, -dt);
        for (term, ck) in terms.iter_mut().zip(coeffs) {
            term.scale(factor * *ck);
            factor *= minus_i_dt;
        }
        debug!(
            %method,
            dt,
            term_bond_dims = ?terms.iter().map(|t| t.bond_dims()).collect::<Vec<_>>(),
            "evolve terms"
        );
        let mut iter = terms.into_iter();
        let mut new = iter.next().ok_or(TrainError::EmptyTrain)?;
        for term in iter {
            new = new.add(&term)?;
        }
        if !new.config.compress_add {
            new.canonicalise()?;
            new.compress()?;
        }
        if let Some(norm) = norm { new.normalize(norm)?; }
        Ok(new)
    }

    /// Evolve by one time step with a precomputed propagator, bypassing the
    /// Taylor series.
    pub fn evolve_exact<P>(&self, prop: &P) -> TrainResult<TensorTrain>
    where P: Propagator + ?Sized
    {
        prop.propagate(self)
    }
}

/// Construct the bond-dimension-1 operator `⊗_k exp(-i dt h_k)` for on-site
/// diagonal Hamiltonians `h_k = diag(energies[k])`.
///
/// This is the exact propagator of the sum [`crate::mp::onsite_mpo`] builds
/// from the same energies.
pub fn onsite_propagator(energies: &[Vec<f64>], dt: f64) -> TrainResult<TensorTrain> {
    let sites: Vec<SiteTensor>
        = energies.iter()
        .map(|e| {
            let d = e.len();
            let data: nd::Array4<C64>
                = nd::Array4::from_shape_fn(
                    (1, d, d, 1),
                    |(_, p, q, _)| {
                        if p == q { C64::cis(-dt * e[p]) } else { C64::new(0.0, 0.0) }
                    },
                );
            SiteTensor::Operator(data)
        })
        .collect();
    let mut prop = TensorTrain::from_sites(sites)?;
    prop.build_empty_qn();
    Ok(prop)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use approx::assert_abs_diff_eq;
    use rand::{ SeedableRng, rngs::StdRng };
    use super::*;
    use crate::{
        ephtable::SiteTable,
        mp::onsite_mpo,
        rk::PropMethod,
    };

    fn energies() -> Vec<Vec<f64>> {
        vec![vec![0.0, 1.0], vec![0.0, 0.3, 0.6], vec![0.0, 0.8], vec![0.0, 0.25, 0.5]]
    }

    fn state(seed: u64) -> TensorTrain {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut mps
            = TensorTrain::random_state(
                &[2, 3, 2, 3],
                Arc::new(SiteTable::molecules(2, 1)),
                1,
                4,
                &mut rng,
            )
            .unwrap();
        mps.set_threshold(1e-10).unwrap();
        mps.normalize(1.0).unwrap();
        mps
    }

    #[test]
    fn taylor_matches_exact_propagator() {
        let mps = state(1);
        let dt = 0.02;
        let h = onsite_mpo(&energies()).unwrap();
        let prop = onsite_propagator(&energies(), dt).unwrap();
        let exact = mps.evolve_exact(&prop).unwrap();
        assert!(exact.is_complex());
        assert_abs_diff_eq!(exact.norm().unwrap(), 1.0, epsilon = 1e-10);

        let rk4 = mps.evolve(&h, dt, None).unwrap();
        assert_eq!(rk4.qntot(), 1);
        assert!(rk4.distance(&exact).unwrap().abs() < 1e-12);
        assert_abs_diff_eq!(rk4.angle(&exact).unwrap(), 1.0, epsilon = 1e-8);

        let mut euler_mps = mps.clone();
        euler_mps.config_mut().prop_method = PropMethod::Euler;
        let euler = euler_mps.evolve(&h, dt, None).unwrap();
        let err_euler = (euler.angle(&exact).unwrap() - 1.0).abs()
            + (euler.norm().unwrap() - 1.0).abs();
        let err_rk4 = (rk4.angle(&exact).unwrap() - 1.0).abs()
            + (rk4.norm().unwrap() - 1.0).abs();
        assert!(err_rk4 < err_euler);
    }

    #[test]
    fn evolution_conserves_norm_and_energy() {
        let mps = state(2);
        let h = onsite_mpo(&energies()).unwrap();
        let e0 = mps.expectation(&h).unwrap();
        let mut psi = mps.clone();
        for _ in 0..5 {
            psi = psi.evolve(&h, 0.02, None).unwrap();
        }
        assert_abs_diff_eq!(psi.norm().unwrap(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(psi.expectation(&h).unwrap(), e0, epsilon = 1e-6);
        assert!(!mps.is_complex());
    }

    #[test]
    fn untracked_operator_evolves() {
        let mps = state(4);
        let sites: Vec<SiteTensor>
            = [2, 3, 2, 3].iter()
            .map(|d| {
                let eye: nd::Array2<C64> = nd::Array2::eye(*d);
                SiteTensor::Operator(eye.into_shape((1, *d, *d, 1)).unwrap())
            })
            .collect();
        let id = TensorTrain::from_sites(sites).unwrap();
        assert!(id.qn().is_none());

        let dt = 0.1;
        let out = mps.evolve(&id, dt, None).unwrap();
        assert!(out.qn().is_none());
        assert_eq!(out.qntot(), 1);
        let mut factor = C64::new(1.0, 0.0);
        let mut series = C64::new(0.0, 0.0);
        for ck in PropMethod::CRk4.coefficients() {
            series += factor * *ck;
            factor *= C64::new(0.0, -dt);
        }
        assert_abs_diff_eq!(mps.angle(&out).unwrap(), series.norm(), epsilon = 1e-8);
        assert_abs_diff_eq!(out.norm().unwrap(), series.norm(), epsilon = 1e-8);

        let exact = mps.evolve_exact(&id).unwrap();
        assert_abs_diff_eq!(exact.angle(&mps).unwrap(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn evolve_renormalizes_and_respects_compress_add() {
        let mut mps = state(3);
        mps.config_mut().compress_add = true;
        let h = onsite_mpo(&energies()).unwrap();
        let out = mps.evolve(&h, 0.5, Some(2.0)).unwrap();
        assert_abs_diff_eq!(out.norm().unwrap(), 2.0, epsilon = 1e-10);
        assert!(out.is_right_canon());
        assert!(matches!(mps.evolve(&mps, 0.1, None), Err(TrainError::NotOperator)));
    }
}
