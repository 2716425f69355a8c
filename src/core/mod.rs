//! Module containing the mapping machinery: the objective and its
//! gradients, the assignment parameterisation, the optimiser and training
//! loop, chunked execution and the mapping diagnostics.

pub mod assignment;
pub mod chunking;
pub mod diagnostics;
pub mod errors;
pub mod objective;
pub mod optimiser;
pub mod params;
pub mod training;
