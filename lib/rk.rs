//! Explicit Runge-Kutta schemes, reduced to the Taylor coefficients they
//! produce on linear equations.
//!
//! For `dy/dt = A y`, one step of an explicit scheme with Butcher tableau
//! `(a, b)` gives `y(t + h) = Σ_k c_k (hA)^k y(t)` with `c_0 = 1` and
//! `c_k = bᵀ a^(k-1) 𝟙`. Time evolution of tensor trains only needs these
//! scalar weights.

use std::{ fmt, str::FromStr };
use ndarray as nd;
use once_cell::sync::Lazy;
use serde::{ Deserialize, Serialize };
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RkError {
    /// Returned when looking up a scheme by an unrecognized name.
    #[error("unknown propagation method '{0}'")]
    UnknownMethod(String),
}
use RkError::*;
pub type RkResult<T> = Result<T, RkError>;

/// Named explicit Runge-Kutta schemes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PropMethod {
    /// Runge-Kutta-Fehlberg, fifth-order weights.
    Rkf45,
    /// Runge-Kutta-Fehlberg, fourth-order weights.
    Rkf4,
    /// Kutta's 3/8 rule.
    Rk4,
    /// The classic fourth-order method.
    #[default]
    CRk4,
    /// Heun's second-order method.
    HeunRk2,
    /// Ralston's second-order method.
    RalstonRk2,
    /// Explicit midpoint method.
    MidpointRk2,
    /// Forward Euler.
    Euler,
}

/// All available schemes, in lookup order.
pub const METHODS: [PropMethod; 8] = [
    PropMethod::Rkf45,
    PropMethod::Rkf4,
    PropMethod::Rk4,
    PropMethod::CRk4,
    PropMethod::HeunRk2,
    PropMethod::RalstonRk2,
    PropMethod::MidpointRk2,
    PropMethod::Euler,
];

impl PropMethod {
    /// Return the name of the scheme.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rkf45 => "RKF45",
            Self::Rkf4 => "RKF4",
            Self::Rk4 => "RK4",
            Self::CRk4 => "C_RK4",
            Self::HeunRk2 => "Heun_RK2",
            Self::RalstonRk2 => "Ralston_RK2",
            Self::MidpointRk2 => "midpoint_RK2",
            Self::Euler => "Euler",
        }
    }

    /// Return the Butcher tableau of the scheme.
    pub fn tableau(&self) -> &'static Tableau {
        let idx = METHODS.iter().position(|m| m == self).unwrap_or(0);
        &Lazy::force(&TABLEAUX)[idx]
    }

    /// Return the number of stages of the scheme.
    pub fn stages(&self) -> usize { self.tableau().b.len() }

    /// Return the Taylor coefficients `c_0, ..., c_stages` of the scheme.
    pub fn coefficients(&self) -> &'static [f64] {
        let idx = METHODS.iter().position(|m| m == self).unwrap_or(0);
        &Lazy::force(&COEFFICIENTS)[idx]
    }
}

impl fmt::Display for PropMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PropMethod {
    type Err = RkError;

    fn from_str(s: &str) -> RkResult<Self> {
        METHODS.iter()
            .find(|m| m.name() == s)
            .copied()
            .ok_or_else(|| UnknownMethod(s.to_string()))
    }
}

impl TryFrom<String> for PropMethod {
    type Error = RkError;

    fn try_from(s: String) -> RkResult<Self> { s.parse() }
}

impl From<PropMethod> for String {
    fn from(method: PropMethod) -> Self { method.name().to_string() }
}

/// Look up a scheme by name, returning its stage count and Taylor
/// coefficients.
pub fn lookup(name: &str) -> RkResult<(usize, &'static [f64])> {
    let method: PropMethod = name.parse()?;
    Ok((method.stages(), method.coefficients()))
}

/// Butcher tableau of an explicit scheme; `a` is square and strictly
/// lower-triangular.
#[derive(Clone, Debug, PartialEq)]
pub struct Tableau {
    pub a: nd::Array2<f64>,
    pub b: nd::Array1<f64>,
}

impl Tableau {
    /// Compute `c_k = bᵀ a^(k-1) 𝟙` for `k = 1..=stages`, preceded by
    /// `c_0 = 1`.
    pub fn taylor_coefficients(&self) -> Vec<f64> {
        let s = self.b.len();
        let mut coeffs: Vec<f64> = Vec::with_capacity(s + 1);
        coeffs.push(1.0);
        let mut v: nd::Array1<f64> = nd::Array1::ones(s);
        for _ in 0..s {
            coeffs.push(self.b.dot(&v));
            v = self.a.dot(&v);
        }
        coeffs
    }
}

fn rkf_a() -> nd::Array2<f64> {
    nd::array![
        [0.0,               0.0,               0.0,                0.0,              0.0,         0.0],
        [1.0 / 4.0,         0.0,               0.0,                0.0,              0.0,         0.0],
        [3.0 / 32.0,        9.0 / 32.0,        0.0,                0.0,              0.0,         0.0],
        [1932.0 / 2197.0,  -7200.0 / 2197.0,   7296.0 / 2197.0,    0.0,              0.0,         0.0],
        [439.0 / 216.0,    -8.0,               3680.0 / 513.0,    -845.0 / 4104.0,   0.0,         0.0],
        [-8.0 / 27.0,       2.0,              -3544.0 / 2565.0,    1859.0 / 4104.0, -11.0 / 40.0, 0.0],
    ]
}

static TABLEAUX: Lazy<Vec<Tableau>> = Lazy::new(|| {
    vec![
        // RKF45
        Tableau {
            a: rkf_a(),
            b: nd::array![
                16.0 / 135.0, 0.0, 6656.0 / 12825.0, 28561.0 / 56430.0,
                -9.0 / 50.0, 2.0 / 55.0,
            ],
        },
        // RKF4
        Tableau {
            a: rkf_a(),
            b: nd::array![
                25.0 / 216.0, 0.0, 1408.0 / 2565.0, 2197.0 / 4104.0,
                -1.0 / 5.0, 0.0,
            ],
        },
        // RK4, 3/8 rule
        Tableau {
            a: nd::array![
                [ 0.0,       0.0, 0.0, 0.0],
                [ 1.0 / 3.0, 0.0, 0.0, 0.0],
                [-1.0 / 3.0, 1.0, 0.0, 0.0],
                [ 1.0,      -1.0, 1.0, 0.0],
            ],
            b: nd::array![1.0 / 8.0, 3.0 / 8.0, 3.0 / 8.0, 1.0 / 8.0],
        },
        // C_RK4
        Tableau {
            a: nd::array![
                [0.0, 0.0, 0.0, 0.0],
                [0.5, 0.0, 0.0, 0.0],
                [0.0, 0.5, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            b: nd::array![1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0],
        },
        // Heun_RK2
        Tableau { a: nd::array![[0.0, 0.0], [1.0, 0.0]], b: nd::array![0.5, 0.5] },
        // Ralston_RK2
        Tableau { a: nd::array![[0.0, 0.0], [2.0 / 3.0, 0.0]], b: nd::array![0.25, 0.75] },
        // midpoint_RK2
        Tableau { a: nd::array![[0.0, 0.0], [0.5, 0.0]], b: nd::array![0.0, 1.0] },
        // Euler
        Tableau { a: nd::array![[0.0]], b: nd::array![1.0] },
    ]
});

static COEFFICIENTS: Lazy<Vec<Vec<f64>>> = Lazy::new(|| {
    TABLEAUX.iter().map(Tableau::taylor_coefficients).collect()
});
