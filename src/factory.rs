//! Brick factory - one bricking session from loaded volume to output directory

use crate::apportion::{ApportionProgress, ApportionReport, VolumeApportioner};
use crate::backend::ComputeContext;
use crate::error::{BrickError, Result};
use crate::metadata::BrickMetadata;
use crate::octree::OctNode;
use crate::partition::{PartitionResult, VolumePartitioner};
use crate::settings::Settings;
use crate::source::{ImageStack, RawVolume, VolumeSource};
use crate::types::{ByteOrder, Dims3};
use crate::utils::format_bytes;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VOLUME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
struct LoadedVolume {
    id: u64,
    source: Arc<dyn VolumeSource>,
}

/// Session glue tying a volume, its settings and the compute context together
pub struct BrickFactory {
    settings: RwLock<Settings>,
    volume: RwLock<Option<LoadedVolume>>,
    partitioner: VolumePartitioner,
    apportioner: VolumeApportioner,
    ctx: Arc<ComputeContext>,
}

impl BrickFactory {
    /// Create a factory around an explicit compute context
    pub fn new(settings: Settings, ctx: Arc<ComputeContext>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings: RwLock::new(settings),
            volume: RwLock::new(None),
            partitioner: VolumePartitioner::new(),
            apportioner: VolumeApportioner::new(),
            ctx,
        })
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Replace the settings; a brick-size change invalidates the memoized partition
    pub fn set_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        *self.settings.write() = settings;
        Ok(())
    }

    pub fn set_output_path(&self, path: impl AsRef<Path>) {
        self.settings.write().output_path = path.as_ref().to_path_buf();
    }

    pub fn output_path(&self) -> PathBuf {
        self.settings.read().output_path.clone()
    }

    pub fn compute_context(&self) -> &Arc<ComputeContext> {
        &self.ctx
    }

    /// Load a flat binary volume and return its slice names
    pub fn open_raw(
        &self,
        path: impl AsRef<Path>,
        dims: Dims3,
        bits_per_pixel: u32,
        byte_order: ByteOrder,
    ) -> Result<Vec<String>> {
        let source = RawVolume::new(path, dims, bits_per_pixel, byte_order)?;
        Ok(self.set_volume(Arc::new(source)))
    }

    /// Load a folder of slice images and return its slice names
    pub async fn open_image_stack(&self, dir: impl AsRef<Path>) -> Result<Vec<String>> {
        let source = ImageStack::open(dir).await?;
        Ok(self.set_volume(Arc::new(source)))
    }

    /// Make `source` the session volume
    pub fn set_volume(&self, source: Arc<dyn VolumeSource>) -> Vec<String> {
        let id = NEXT_VOLUME_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Loaded volume {} ({}, {} bytes per pixel, {:?})",
            id,
            source.dims(),
            source.bytes_per_pixel(),
            source.kind()
        );
        let names = source.slice_names();
        *self.volume.write() = Some(LoadedVolume { id, source });
        names
    }

    fn loaded(&self) -> Result<LoadedVolume> {
        self.volume.read().clone().ok_or(BrickError::NoVolumeLoaded)
    }

    /// The session volume
    pub fn volume(&self) -> Result<Arc<dyn VolumeSource>> {
        Ok(self.loaded()?.source)
    }

    /// Partition of the loaded volume, memoized per volume and brick-size bounds
    pub fn partitions(&self) -> Result<Arc<PartitionResult>> {
        let loaded = self.loaded()?;
        let settings = self.settings();
        self.partitioner
            .partition(&self.ctx, loaded.id, loaded.source.dims(), &settings)
    }

    pub fn octree(&self) -> Result<OctNode> {
        let partition = self.partitions()?;
        Ok(OctNode::build(&partition))
    }

    /// Bytes per sample the brick files will hold
    pub fn output_bytes_per_pixel(&self) -> Result<u8> {
        let loaded = self.loaded()?;
        Ok(self
            .settings
            .read()
            .output_bytes_per_pixel(loaded.source.bytes_per_pixel()))
    }

    /// Total size of all brick files, raw and human readable
    pub fn result_file_size(&self) -> Result<(u64, String)> {
        let partition = self.partitions()?;
        let bytes = partition.total_voxels() * self.output_bytes_per_pixel()? as u64;
        Ok((bytes, format_bytes(bytes)))
    }

    /// Partition, index, describe and apportion the loaded volume
    ///
    /// A cancellation requested through [`BrickFactory::progress`] before this
    /// call stops it before anything is written.
    pub async fn generate_bricks(&self) -> Result<ApportionReport> {
        let loaded = self.loaded()?;
        let settings = self.settings();
        if self.apportioner.progress().take_cancel() {
            tracing::warn!("Brick generation cancelled before partitioning");
            return Err(BrickError::Cancelled);
        }
        let partition = self.partitions()?;
        let octree = OctNode::build(&partition);
        let out_bpp = settings.output_bytes_per_pixel(loaded.source.bytes_per_pixel());

        let metadata = BrickMetadata::new(&partition, &octree, out_bpp);
        metadata.write(&settings.output_path).await?;

        self.apportioner
            .apportion(Arc::clone(&self.ctx), loaded.source, partition, &settings)
            .await
    }

    /// Progress of the current or last apportionment
    pub fn progress(&self) -> Arc<ApportionProgress> {
        self.apportioner.progress()
    }

    /// Memoized partition computations so far
    pub fn partition_computations(&self) -> usize {
        self.partitioner.computations()
    }
}
