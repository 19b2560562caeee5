//! Rotation, shift and mirror invariant clustering of 2-D images.
//!
//! Images are assigned to the class whose prototype they match best after
//! alignment. Classes are split level by level until the requested number is
//! reached, and undersized classes are replaced by splits of the largest one.
//! Work is shared between workers that only meet in collective exchanges.

pub mod align;
pub mod class;
pub mod comm;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod histogram;
pub mod image;
pub mod output;
pub mod quantizer;
pub mod split;
pub mod store;
pub mod synthetic;

pub use align::{Aligner, Assignment, Fit, PolarImage, RegistrationKernel, SpatialKernel};
pub use class::Class;
pub use comm::{Communicator, LocalCluster, LocalCommunicator, ReduceOp, SoloCommunicator, TaskDistributor};
pub use config::{Cl2dConfig, SimilarityMode};
pub use context::RunContext;
pub use engine::{classify, run_local_cluster, run_solo, Classification};
pub use error::{Cl2dError, Cl2dResult};
pub use image::{Geometry, ImageId, ImageRecord};
pub use output::{
    ClassSummary, IterationReport, JsonDirectoryWriter, LevelReport, MemoryObserver, NullObserver, RunObserver,
};
pub use quantizer::Quantizer;
pub use split::{split_largest_first, split_node, SplitChild, SplitOutcome};
pub use store::{ImageStore, InMemoryImageStore, InMemoryMetadata, MetadataRow, MetadataTable};
