//! Probabilistic mapping of single cell transcriptomes onto spatial
//! transcriptomics voxels.
//!
//! A row-stochastic assignment matrix (cells or clusters × voxels) is
//! learned by gradient descent so that the expression predicted for every
//! voxel matches the measured one. Optional terms pull the share of cells
//! per voxel towards a density prior or expected cell counts, sharpen
//! cluster assignments, or select a fixed number of cells through a soft
//! filter. Large data sets can be mapped in independent voxel partitions.

pub mod core;
pub mod single_cell;
pub mod utils;

pub use crate::core::chunking::{ChunkParams, ChunkStrategy, VoxelPartition};
pub use crate::core::errors::{LossTerm, MappingError};
pub use crate::core::objective::{DensityPrior, SpatialPriors};
pub use crate::core::params::{
    Annealing, EarlyStopping, InitStrategy, LossWeights, MapperParams, StopSignal,
};
pub use crate::core::training::{TerminalState, TrainingDiagnostics};
pub use crate::single_cell::cluster_aggregations::ClusterLabels;
pub use crate::single_cell::mapping::{
    ChunkedMappingResult, MappingMode, MappingResult, SpatialMapper,
};
