//! `metadata.json` document describing a brick output directory

use crate::error::Result;
use crate::octree::{OctNode, OctreeJson};
use crate::partition::PartitionResult;
use crate::utils::{brick_filename, round_up};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name of the metadata file inside the output directory
pub const METADATA_FILE: &str = "metadata.json";

/// One brick file entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrickEntry {
    pub filename: String,
    pub size: u32,
    pub position: [u32; 3],
}

/// Complete metadata for a bricked volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrickMetadata {
    /// Bytes per sample in the brick files
    pub bytes_per_pixel: u8,

    pub total_bricks: usize,

    /// Volume extents rounded up to `min_level`
    pub global_size: [u32; 3],

    /// Smallest brick edge actually produced
    pub min_level: u32,

    /// Configured largest brick edge
    pub max_level: u32,

    pub bricks: Vec<BrickEntry>,

    pub octree: OctreeJson,

    pub total_octnodes: usize,
}

impl BrickMetadata {
    /// Describe a partition and its octree
    pub fn new(partition: &PartitionResult, octree: &OctNode, bytes_per_pixel: u8) -> Self {
        let bricks = partition
            .bricks
            .iter()
            .enumerate()
            .map(|(i, brick)| BrickEntry {
                filename: brick_filename(i),
                size: brick.size,
                position: brick.position,
            })
            .collect();

        let smallest = partition.smallest_brick_size();
        let dims = partition.volume_dims;
        Self {
            bytes_per_pixel,
            total_bricks: partition.brick_count(),
            global_size: [
                round_up(dims.width, smallest),
                round_up(dims.height, smallest),
                round_up(dims.depth, smallest),
            ],
            min_level: smallest,
            max_level: partition.max_brick_size,
            bricks,
            octree: octree.to_json(),
            total_octnodes: octree.total_nodes(),
        }
    }

    /// Total bytes of all brick files
    pub fn total_bytes(&self) -> u64 {
        self.bricks
            .iter()
            .map(|b| (b.size as u64).pow(3) * self.bytes_per_pixel as u64)
            .sum()
    }

    /// Write `metadata.json` into `dir`, creating the directory if needed
    pub async fn write(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&path, json).await?;
        tracing::debug!("Wrote {} ({} bricks)", path.display(), self.total_bricks);
        Ok(path)
    }

    /// Load `metadata.json` from `dir`
    pub async fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(dir.as_ref().join(METADATA_FILE)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
