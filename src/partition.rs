//! Volume partitioning - divides a volume into power-of-two cubic bricks

use crate::backend::ComputeContext;
use crate::error::{BrickError, Result};
use crate::settings::{check_brick_bounds, Settings};
use crate::types::{Brick, Dims3, TensorDims};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Bricks covering a padded volume, plus the per-cell lookup tables
#[derive(Debug, Clone)]
pub struct PartitionResult {
    /// Dense brick list, ordered by origin cell (x fastest)
    pub bricks: Vec<Brick>,

    /// Tensor of `min_brick_size` cells overlaid on the volume
    pub tensor: TensorDims,

    /// Extents of the source volume
    pub volume_dims: Dims3,

    pub min_brick_size: u32,
    pub max_brick_size: u32,

    /// Brick edge per cell, in cells
    cell_sizes: Vec<u32>,

    /// Owning brick id per cell
    cell_bricks: Vec<u32>,
}

impl PartitionResult {
    /// Number of tensor cells
    pub fn tensor_size(&self) -> usize {
        self.tensor.len()
    }

    /// Volume extents rounded up to a multiple of `min_brick_size`
    pub fn padded_dims(&self) -> Dims3 {
        Dims3::new(
            self.tensor.width * self.min_brick_size,
            self.tensor.height * self.min_brick_size,
            self.tensor.depth * self.min_brick_size,
        )
    }

    pub fn brick_count(&self) -> usize {
        self.bricks.len()
    }

    /// Smallest brick edge actually produced
    pub fn smallest_brick_size(&self) -> u32 {
        self.bricks
            .iter()
            .map(|b| b.size)
            .min()
            .unwrap_or(self.min_brick_size)
    }

    /// Largest brick edge actually produced
    pub fn largest_brick_size(&self) -> u32 {
        self.bricks
            .iter()
            .map(|b| b.size)
            .max()
            .unwrap_or(self.min_brick_size)
    }

    /// Voxels stored across all bricks, padding included
    pub fn total_voxels(&self) -> u64 {
        self.bricks.iter().map(Brick::voxel_count).sum()
    }

    /// Brick edge of a tensor cell, in cells
    pub fn cell_size(&self, cell: usize) -> u32 {
        self.cell_sizes[cell]
    }

    /// Brick id owning a tensor cell
    pub fn cell_brick(&self, cell: usize) -> u32 {
        self.cell_bricks[cell]
    }

    /// Brick id owning the voxel at `(x, y, z)`, if it lies in the padded volume
    pub fn brick_at(&self, x: u32, y: u32, z: u32) -> Option<u32> {
        let m = self.min_brick_size;
        let (cx, cy, cz) = (x / m, y / m, z / m);
        if !self.tensor.contains(cx, cy, cz) {
            return None;
        }
        Some(self.cell_bricks[self.tensor.index(cx, cy, cz)])
    }

    /// Ids of the bricks intersecting slice `z`
    pub fn bricks_in_slice(&self, z: u32) -> Vec<usize> {
        self.bricks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.z_range().contains(&z))
            .map(|(i, _)| i)
            .collect()
    }

    /// Get a summary string of the partition
    pub fn summary(&self) -> String {
        format!(
            "{} volume -> {} bricks ({}..{} voxels per edge), tensor {}x{}x{}, padded {}",
            self.volume_dims,
            self.brick_count(),
            self.smallest_brick_size(),
            self.largest_brick_size(),
            self.tensor.width,
            self.tensor.height,
            self.tensor.depth,
            self.padded_dims()
        )
    }
}

/// Classify, scan and compact the tensor of a `dims` volume into bricks
pub fn partition_volume(
    ctx: &ComputeContext,
    dims: Dims3,
    min_brick_size: u32,
    max_brick_size: u32,
) -> Result<PartitionResult> {
    check_brick_bounds(min_brick_size, max_brick_size)?;
    if dims.is_empty() {
        return Err(BrickError::InvalidSettings(format!(
            "cannot partition an empty volume ({})",
            dims
        )));
    }
    let tensor = TensorDims::covering(dims, min_brick_size);

    let classification = ctx.classify(tensor, min_brick_size, max_brick_size)?;
    let addresses = ctx.scan(&classification.predicate)?;
    if addresses.len() != tensor.len() + 1 {
        return Err(BrickError::ComputeBackend(format!(
            "scan returned {} entries for {} cells",
            addresses.len(),
            tensor.len()
        )));
    }
    let total = addresses[tensor.len()] as usize;

    let sizes = ctx.compact_u32(
        &classification.sizes,
        &classification.predicate,
        &addresses,
    )?;
    let origins = ctx.compact_origins(
        &classification.origins,
        &classification.predicate,
        &addresses,
    )?;
    if sizes.len() != total || origins.len() != total {
        return Err(BrickError::ComputeBackend(format!(
            "compaction produced {} sizes and {} origins for {} bricks",
            sizes.len(),
            origins.len(),
            total
        )));
    }

    let covered: u64 = sizes.iter().map(|&s| (s as u64).pow(3)).sum();
    if covered != tensor.len() as u64 {
        return Err(BrickError::ComputeBackend(format!(
            "bricks cover {} cells of a {} cell tensor",
            covered,
            tensor.len()
        )));
    }

    let bricks: Vec<Brick> = origins
        .into_iter()
        .zip(&sizes)
        .map(|(origin, &cells)| Brick::new(origin, cells * min_brick_size))
        .collect();

    let cell_sizes = classification.sizes;
    let predicate = &classification.predicate;
    let cell_bricks: Vec<u32> = ctx.install(|| {
        (0..tensor.len())
            .into_par_iter()
            .map(|i| {
                let size = cell_sizes[i];
                let [x, y, z] = tensor.coords(i);
                let mask = !(size - 1);
                let origin = tensor.index(x & mask, y & mask, z & mask);
                if predicate[origin] == 0 {
                    return Err(BrickError::ComputeBackend(format!(
                        "cell {} resolves to non-origin cell {}",
                        i, origin
                    )));
                }
                Ok(addresses[origin])
            })
            .collect::<Result<Vec<u32>>>()
    })?;

    Ok(PartitionResult {
        bricks,
        tensor,
        volume_dims: dims,
        min_brick_size,
        max_brick_size,
        cell_sizes,
        cell_bricks,
    })
}

/// Identity of one partition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub volume_id: u64,
    pub dims: Dims3,
    pub min_brick_size: u32,
    pub max_brick_size: u32,
}

/// Partitioner that memoizes its last result
#[derive(Default)]
pub struct VolumePartitioner {
    last: RwLock<Option<(PartitionKey, Arc<PartitionResult>)>>,
    computations: AtomicUsize,
}

impl VolumePartitioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partition a volume, reusing the previous result when nothing changed
    pub fn partition(
        &self,
        ctx: &ComputeContext,
        volume_id: u64,
        dims: Dims3,
        settings: &Settings,
    ) -> Result<Arc<PartitionResult>> {
        settings.validate()?;
        let key = PartitionKey {
            volume_id,
            dims,
            min_brick_size: settings.min_brick_size,
            max_brick_size: settings.max_brick_size,
        };

        if let Some((last_key, result)) = self.last.read().as_ref() {
            if *last_key == key {
                tracing::debug!("Reusing partition for volume {}", volume_id);
                return Ok(Arc::clone(result));
            }
        }

        let result = Arc::new(partition_volume(
            ctx,
            dims,
            settings.min_brick_size,
            settings.max_brick_size,
        )?);
        self.computations.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Partitioned: {}", result.summary());

        *self.last.write() = Some((key, Arc::clone(&result)));
        Ok(result)
    }

    /// Most recent result, if any
    pub fn last(&self) -> Option<Arc<PartitionResult>> {
        self.last.read().as_ref().map(|(_, r)| Arc::clone(r))
    }

    /// Number of partitions actually computed (memo hits excluded)
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }

    /// Forget the memoized result
    pub fn clear(&self) {
        *self.last.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Classification, ComputeBackend, CpuBackend};

    fn ctx() -> ComputeContext {
        ComputeContext::new(2).unwrap()
    }

    /// Every padded cell is covered by exactly one brick
    fn assert_tiles(result: &PartitionResult) {
        let m = result.min_brick_size;
        let mut hits = vec![0u32; result.tensor_size()];
        for brick in &result.bricks {
            assert!(brick.size.is_power_of_two());
            assert!(brick.size >= result.min_brick_size);
            assert!(brick.size <= result.max_brick_size);
            for z in (brick.position[2]..brick.end()[2]).step_by(m as usize) {
                for y in (brick.position[1]..brick.end()[1]).step_by(m as usize) {
                    for x in (brick.position[0]..brick.end()[0]).step_by(m as usize) {
                        hits[result.tensor.index(x / m, y / m, z / m)] += 1;
                    }
                }
            }
        }
        assert!(hits.iter().all(|&h| h == 1));
    }

    #[test]
    fn test_single_brick() {
        let result = partition_volume(&ctx(), Dims3::new(512, 512, 512), 512, 512).unwrap();
        assert_eq!(result.bricks, vec![Brick::new([0, 0, 0], 512)]);
        assert_eq!(result.tensor, TensorDims::new(1, 1, 1));
    }

    #[test]
    fn test_wide_volume() {
        let result = partition_volume(&ctx(), Dims3::new(1024, 512, 512), 64, 512).unwrap();
        assert_eq!(result.tensor, TensorDims::new(16, 8, 8));
        assert_tiles(&result);
        assert!(result.total_voxels() >= 1024 * 512 * 512);
        assert_eq!(
            result.bricks,
            vec![Brick::new([0, 0, 0], 512), Brick::new([512, 0, 0], 512)]
        );
    }

    #[test]
    fn test_small_ragged_volume() {
        let result = partition_volume(&ctx(), Dims3::new(18, 18, 19), 16, 512).unwrap();
        assert_eq!(result.tensor, TensorDims::new(2, 2, 2));
        assert_tiles(&result);
        assert_eq!(result.bricks, vec![Brick::new([0, 0, 0], 32)]);
        assert_eq!(result.padded_dims(), Dims3::new(32, 32, 32));
    }

    #[test]
    fn test_min_equals_max_no_merge() {
        let result = partition_volume(&ctx(), Dims3::new(100, 40, 70), 32, 32).unwrap();
        assert_eq!(result.brick_count(), result.tensor_size());
        assert!(result.bricks.iter().all(|b| b.size == 32));
        assert_tiles(&result);
    }

    #[test]
    fn test_irregular_volumes_tile() {
        for dims in [
            Dims3::new(300, 200, 100),
            Dims3::new(1, 1, 1),
            Dims3::new(257, 65, 513),
            Dims3::new(96, 96, 96),
        ] {
            let result = partition_volume(&ctx(), dims, 16, 128).unwrap();
            assert_tiles(&result);
            assert!(result.total_voxels() >= dims.voxel_count());
        }
    }

    #[test]
    fn test_cell_tables() {
        let result = partition_volume(&ctx(), Dims3::new(48, 32, 32), 16, 64).unwrap();
        assert_tiles(&result);
        for cell in 0..result.tensor_size() {
            let [x, y, z] = result.tensor.coords(cell);
            let id = result.cell_brick(cell) as usize;
            let brick = result.bricks[id];
            assert!(brick.contains(x * 16, y * 16, z * 16));
            assert_eq!(result.cell_size(cell) * 16, brick.size);
        }
        assert_eq!(result.brick_at(47, 31, 31), Some(result.cell_brick(result.tensor_size() - 1)));
        assert_eq!(result.brick_at(48, 0, 0), None);
    }

    #[test]
    fn test_bricks_in_slice() {
        let result = partition_volume(&ctx(), Dims3::new(32, 32, 48), 16, 32).unwrap();
        // One 32-brick at z=0 and four 16-bricks at z=32
        assert_eq!(result.bricks_in_slice(0), vec![0]);
        assert_eq!(result.bricks_in_slice(40).len(), 4);
    }

    #[test]
    fn test_memoization() {
        let ctx = ctx();
        let partitioner = VolumePartitioner::new();
        let settings = Settings::new(16, 64).unwrap();
        let dims = Dims3::new(64, 64, 64);

        let first = partitioner.partition(&ctx, 1, dims, &settings).unwrap();
        let second = partitioner.partition(&ctx, 1, dims, &settings).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(partitioner.computations(), 1);

        let other_volume = partitioner.partition(&ctx, 2, dims, &settings).unwrap();
        assert!(!Arc::ptr_eq(&first, &other_volume));
        assert_eq!(partitioner.computations(), 2);

        let resized = Settings::new(16, 32).unwrap();
        partitioner.partition(&ctx, 2, dims, &resized).unwrap();
        assert_eq!(partitioner.computations(), 3);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let partitioner = VolumePartitioner::new();
        let settings = Settings {
            min_brick_size: 128,
            max_brick_size: 64,
            ..Settings::default()
        };
        assert!(matches!(
            partitioner.partition(&ctx(), 1, Dims3::new(8, 8, 8), &settings),
            Err(BrickError::InvalidSettings(_))
        ));
        assert!(partitioner.last().is_none());
    }

    #[test]
    fn test_partition_volume_checks_bounds() {
        let ctx = ctx();
        let dims = Dims3::new(32, 32, 32);
        for (min, max) in [(0, 32), (48, 64), (64, 32), (16, 0)] {
            assert!(
                matches!(
                    partition_volume(&ctx, dims, min, max),
                    Err(BrickError::InvalidSettings(_))
                ),
                "min {} max {}",
                min,
                max
            );
        }
    }

    /// Scan that leaves out the trailing total
    struct NoTotalScan;

    impl ComputeBackend for NoTotalScan {
        fn name(&self) -> &'static str {
            "no-total"
        }

        fn classify(&self, tensor: TensorDims, min: u32, max: u32) -> Result<Classification> {
            CpuBackend.classify(tensor, min, max)
        }

        fn scan(&self, predicate: &[u32]) -> Result<Vec<u32>> {
            let mut addresses = CpuBackend.scan(predicate)?;
            addresses.pop();
            Ok(addresses)
        }

        fn compact_u32(
            &self,
            values: &[u32],
            predicate: &[u32],
            addresses: &[u32],
        ) -> Result<Vec<u32>> {
            CpuBackend.compact_u32(values, predicate, addresses)
        }

        fn compact_origins(
            &self,
            values: &[[u32; 3]],
            predicate: &[u32],
            addresses: &[u32],
        ) -> Result<Vec<[u32; 3]>> {
            CpuBackend.compact_origins(values, predicate, addresses)
        }
    }

    #[test]
    fn test_short_scan_is_backend_error() {
        let ctx = ComputeContext::with_backend(1, Box::new(NoTotalScan)).unwrap();
        assert!(matches!(
            partition_volume(&ctx, Dims3::new(48, 32, 32), 16, 64),
            Err(BrickError::ComputeBackend(_))
        ));
    }
}
