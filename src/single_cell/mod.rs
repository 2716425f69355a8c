//! Contains the single cell facing part of the crate: aggregation of cells
//! into clusters and the `SpatialMapper` entry point.

pub mod cluster_aggregations;
pub mod mapping;
