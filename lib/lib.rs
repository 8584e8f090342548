//! Matrix product states and operators for exciton-phonon systems, with
//! conserved-quantum-number bookkeeping.
//!
//! The central type is [`TensorTrain`], a chain of [`SiteTensor`]s that is
//! kept in left- or right-canonical form and compressed by truncated
//! SVD sweeps. Decompositions respect the block structure imposed by a
//! conserved excitation number ([`svd_qn`]), whose per-site increments come
//! from an [`EphTable`]. Time evolution expands the short-time propagator in
//! a Taylor series weighted by a Runge-Kutta scheme ([`rk`]).

pub mod site;
pub mod ephtable;
pub mod svd_qn;
pub mod rk;
pub mod config;
pub mod events;
pub mod mp;
pub mod evolve;

pub use site::{ SiteTensor, TrainKind };
pub use ephtable::{ EphTable, SiteKind, SiteTable };
pub use rk::PropMethod;
pub use config::{ CompressMethod, TrainConfig };
pub use events::{ EventLog, EventSink, TrainEvent };
pub use mp::{ ElementType, TensorTrain, TrainError, TrainResult };
pub use evolve::Propagator;
