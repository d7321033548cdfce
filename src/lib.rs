//! hzbrick - Hierarchical Z-order volume bricking
//!
//! Converts an arbitrary-sized 3D scalar volume (a stack of 2D slices) into
//! power-of-two cubic bricks whose samples are stored in brick-local Morton
//! order, ready for out-of-core rendering or querying.
//!
//! # Features
//!
//! - Adaptive partitioning into bricks bounded by `[minBrickSize, maxBrickSize]`
//! - Morton / HZ curve codec with exact round trips
//! - Octree index over the produced bricks, exported as `metadata.json`
//! - Streaming apportionment into memory-mapped brick files
//! - Raw file, image stack (TIFF/PNG) and in-memory volume sources
//!
//! # Example
//!
//! ```rust,ignore
//! use hzbrick::{BrickFactory, ComputeContext, Settings};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::new(64, 512)?.with_output_path("/data/bricks");
//! let factory = BrickFactory::new(settings, Arc::new(ComputeContext::new(0)?))?;
//!
//! factory.open_image_stack("/data/ct-scan").await?;
//! let report = factory.generate_bricks().await?;
//! println!("wrote {} bricks", report.bricks_written);
//! # Ok(())
//! # }
//! ```

pub mod apportion;
pub mod backend;
pub mod curve;
pub mod error;
pub mod factory;
pub mod metadata;
pub mod octree;
pub mod partition;
pub mod settings;
pub mod source;
pub mod types;
pub mod utils;

// Re-exports
pub use apportion::{ApportionProgress, ApportionReport, VolumeApportioner};
pub use backend::{ComputeBackend, ComputeContext, CpuBackend, SerialBackend};
pub use curve::{decode_truncated, encode_hz, encode_morton};
pub use error::{BrickError, Result};
pub use factory::BrickFactory;
pub use metadata::BrickMetadata;
pub use octree::OctNode;
pub use partition::{PartitionResult, VolumePartitioner};
pub use settings::Settings;
pub use source::{ImageStack, InMemoryVolume, RawVolume, Slice, VolumeSource};
pub use types::{Brick, ByteOrder, Dims3, TensorDims};

/// Version of the hzbrick crate
pub const HZBRICK_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!HZBRICK_VERSION.is_empty());
    }
}
