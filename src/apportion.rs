//! Apportionment - streams a volume slice by slice into its brick files
//!
//! Every brick file is created at its final size up front and memory mapped,
//! so each voxel write is a bounded store at `address * bytes_per_pixel`.
//! Slices are visited in increasing `z`; a brick is flushed and unmapped as
//! soon as its last real slice has been written.

use crate::backend::ComputeContext;
use crate::curve::{curve_layer, rescale_to_u8, LayerAddresses};
use crate::error::{BrickError, Result};
use crate::partition::PartitionResult;
use crate::settings::Settings;
use crate::source::{Slice, VolumeSource};
use crate::utils::{brick_filename, format_bytes};
use memmap2::MmapMut;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Counters shared with whoever polls a running apportionment
#[derive(Debug, Default)]
pub struct ApportionProgress {
    slices_completed: AtomicU32,
    total_slices: AtomicU32,
    bricks_completed: AtomicUsize,
    total_bricks: AtomicUsize,
    done: AtomicBool,
    cancel_requested: AtomicBool,
}

impl ApportionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn start(&self, total_bricks: usize, total_slices: u32) {
        self.slices_completed.store(0, Ordering::Release);
        self.bricks_completed.store(0, Ordering::Release);
        self.total_bricks.store(total_bricks, Ordering::Release);
        self.total_slices.store(total_slices, Ordering::Release);
        self.done.store(false, Ordering::Release);
    }

    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        self.cancel_requested.store(false, Ordering::Release);
    }

    pub fn slices_completed(&self) -> u32 {
        self.slices_completed.load(Ordering::Acquire)
    }

    pub fn total_slices(&self) -> u32 {
        self.total_slices.load(Ordering::Acquire)
    }

    /// Bricks flushed and closed so far; never decreases during a run
    pub fn bricks_completed(&self) -> usize {
        self.bricks_completed.load(Ordering::Acquire)
    }

    pub fn total_bricks(&self) -> usize {
        self.total_bricks.load(Ordering::Acquire)
    }

    /// Set once every brick file has been written and closed
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Completed fraction of bricks, in `[0, 1]`
    pub fn fraction(&self) -> f64 {
        let total = self.total_bricks();
        if total == 0 {
            return if self.is_done() { 1.0 } else { 0.0 };
        }
        self.bricks_completed() as f64 / total as f64
    }

    /// Ask the running apportionment to stop at the next slice boundary
    ///
    /// A request made before a run starts stops that run before any brick
    /// file is created. The request is consumed by the run that honors it.
    pub fn cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Consume a pending cancellation request
    pub(crate) fn take_cancel(&self) -> bool {
        self.cancel_requested.swap(false, Ordering::AcqRel)
    }
}

/// Summary of a finished apportionment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApportionReport {
    pub bricks_written: usize,
    pub slices_processed: u32,
    pub bytes_allocated: u64,
}

/// Output of one brick, held until its last real slice is written
type BrickSlot = Mutex<Option<MmapMut>>;

/// Writes a partitioned volume into `<index>.raw` brick files
#[derive(Debug, Default)]
pub struct VolumeApportioner {
    progress: Arc<ApportionProgress>,
}

impl VolumeApportioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Progress handle, valid across runs
    pub fn progress(&self) -> Arc<ApportionProgress> {
        Arc::clone(&self.progress)
    }

    /// Write every voxel of `source` into its brick file under `settings.output_path`
    ///
    /// All-or-nothing: on error the output directory must be discarded.
    pub async fn apportion(
        &self,
        ctx: Arc<ComputeContext>,
        source: Arc<dyn VolumeSource>,
        partition: Arc<PartitionResult>,
        settings: &Settings,
    ) -> Result<ApportionReport> {
        settings.validate()?;
        let dims = source.dims();
        if dims != partition.volume_dims {
            return Err(BrickError::InvalidSettings(format!(
                "partition was computed for {} but the volume is {}",
                partition.volume_dims, dims
            )));
        }
        let in_bpp = source.bytes_per_pixel();
        let out_bpp = settings.output_bytes_per_pixel(in_bpp);
        let out_dir = settings.output_path.clone();

        if self.progress.take_cancel() {
            tracing::warn!("Apportionment cancelled before it started");
            return Err(BrickError::Cancelled);
        }
        self.progress.start(partition.brick_count(), dims.depth);
        tokio::fs::create_dir_all(&out_dir).await?;

        let bytes_allocated: u64 = partition
            .bricks
            .iter()
            .map(|b| b.voxel_count() * out_bpp as u64)
            .sum();
        tracing::info!(
            "Apportioning {} into {} bricks ({}) at {}",
            dims,
            partition.brick_count(),
            format_bytes(bytes_allocated),
            out_dir.display()
        );

        let slots = {
            let ctx = Arc::clone(&ctx);
            let partition = Arc::clone(&partition);
            tokio::task::spawn_blocking(move || {
                ctx.install(|| allocate_bricks(&out_dir, &partition, out_bpp))
            })
            .await??
        };
        tracing::debug!("Allocated {} brick files", slots.len());
        let slots = Arc::new(slots);

        // Bricks are closed after the last slice holding real samples
        let mut closing: Vec<Vec<usize>> = vec![Vec::new(); dims.depth as usize];
        for (id, brick) in partition.bricks.iter().enumerate() {
            let last = (brick.position[2] + brick.size).min(dims.depth) - 1;
            closing[last as usize].push(id);
        }

        let mut closing = closing.into_iter();
        for z in 0..dims.depth {
            if self.progress.take_cancel() {
                tracing::warn!("Apportionment cancelled before slice {}", z);
                return Err(BrickError::Cancelled);
            }

            let slice = source.get_slice(z).await?;
            if slice.width() != dims.width || slice.height() != dims.height {
                return Err(BrickError::SourceRead(format!(
                    "slice {} is {}x{}, expected {}x{}",
                    z,
                    slice.width(),
                    slice.height(),
                    dims.width,
                    dims.height
                )));
            }
            let finished = closing.next().unwrap_or_default();

            let ctx = Arc::clone(&ctx);
            let partition = Arc::clone(&partition);
            let slots = Arc::clone(&slots);
            let progress = Arc::clone(&self.progress);
            tokio::task::spawn_blocking(move || {
                ctx.install(|| {
                    let layer = curve_layer(&partition, z)?;
                    write_layer(&partition, &layer, &slice, &slots, out_bpp)?;
                    close_bricks(&slots, &finished, &progress)
                })
            })
            .await??;

            self.progress.slices_completed.fetch_add(1, Ordering::AcqRel);
            tracing::trace!("Slice {} of {} apportioned", z + 1, dims.depth);
        }

        self.progress.finish();
        let report = ApportionReport {
            bricks_written: self.progress.bricks_completed(),
            slices_processed: self.progress.slices_completed(),
            bytes_allocated,
        };
        tracing::info!(
            "Apportionment finished: {} bricks from {} slices",
            report.bricks_written,
            report.slices_processed
        );
        Ok(report)
    }
}

fn allocate_brick(path: &Path, bytes: u64) -> Result<MmapMut> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(bytes)?;

    // The file was just truncated and is only touched through this map until it is flushed.
    let map = unsafe { MmapMut::map_mut(&file)? };
    Ok(map)
}

/// Create every brick file at its final, zero-filled size
fn allocate_bricks(
    out_dir: &Path,
    partition: &PartitionResult,
    out_bpp: u8,
) -> Result<Vec<BrickSlot>> {
    partition
        .bricks
        .par_iter()
        .enumerate()
        .map(|(id, brick)| {
            let path = out_dir.join(brick_filename(id));
            let map = allocate_brick(&path, brick.voxel_count() * out_bpp as u64)?;
            Ok(Mutex::new(Some(map)))
        })
        .collect()
}

/// Flush and unmap finished bricks
fn close_bricks(slots: &[BrickSlot], ids: &[usize], progress: &ApportionProgress) -> Result<()> {
    for &id in ids {
        if let Some(map) = slots[id].lock().take() {
            map.flush()?;
            progress.bricks_completed.fetch_add(1, Ordering::AcqRel);
        }
    }
    Ok(())
}

/// Store every real pixel of one slice, bricks in parallel
fn write_layer(
    partition: &PartitionResult,
    layer: &LayerAddresses,
    slice: &Slice,
    slots: &[BrickSlot],
    out_bpp: u8,
) -> Result<()> {
    let z = layer.z;
    let (width, height) = (slice.width(), slice.height());
    let rescale = out_bpp == 1 && slice.bytes_per_pixel() == 2;
    let stride = out_bpp as usize;

    partition
        .bricks_in_slice(z)
        .into_par_iter()
        .try_for_each(|id| -> Result<()> {
            let brick = partition.bricks[id];
            let x_end = (brick.position[0] + brick.size).min(width);
            let y_end = (brick.position[1] + brick.size).min(height);
            if brick.position[0] >= x_end || brick.position[1] >= y_end {
                return Ok(());
            }

            let mut slot = slots[id].lock();
            let map = slot.as_mut().ok_or_else(|| {
                BrickError::AddressingInvariantViolation(format!(
                    "brick {} written after it was closed (slice {})",
                    id, z
                ))
            })?;

            for y in brick.position[1]..y_end {
                for x in brick.position[0]..x_end {
                    let (owner, address) = layer.get(x, y);
                    if owner as usize != id {
                        return Err(BrickError::AddressingInvariantViolation(format!(
                            "voxel ({}, {}, {}) addressed to brick {} while writing brick {}",
                            x, y, z, owner, id
                        )));
                    }
                    let offset = address as usize * stride;
                    let Some(dest) = map.get_mut(offset..offset + stride) else {
                        return Err(BrickError::AddressingInvariantViolation(format!(
                            "offset {} beyond brick {} file",
                            offset, id
                        )));
                    };

                    let sample = slice.sample(x, y);
                    if stride == 1 {
                        dest[0] = if rescale {
                            rescale_to_u8(sample)
                        } else {
                            sample as u8
                        };
                    } else {
                        dest.copy_from_slice(&sample.to_le_bytes());
                    }
                }
            }
            Ok(())
        })
}
