//! Shared vector and matrix helpers plus the shape assertion macros.

pub mod general;
#[macro_use]
pub mod macros;
