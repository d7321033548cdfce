//! Morton / Hierarchical Z-order curve codec
//!
//! Bricks of edge `2^L` store their samples at the brick-local Morton code of
//! each voxel. The HZ index of a code (see [`hz_index`]) reorders those codes
//! so that every coarser level is a prefix of the finer one; [`decode_truncated`]
//! maps an HZ index back to coordinates.

use crate::error::{BrickError, Result};
use crate::partition::PartitionResult;
use rayon::prelude::*;

/// Largest supported curve level (21 bits per axis in a 64-bit code)
pub const MAX_LEVEL: u32 = 21;

/// Spread the low 21 bits of `v` so they occupy every third bit
#[inline]
pub fn spread3(v: u32) -> u64 {
    let mut x = v as u64 & 0x1f_ffff;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

/// Gather every third bit of `code` back into a 21-bit integer
#[inline]
pub fn compact3(code: u64) -> u32 {
    let mut x = code & 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & 0x1f_ffff;
    x as u32
}

/// Morton code with x in the lowest bit of each triple
#[inline]
pub fn encode_morton(x: u32, y: u32, z: u32) -> u64 {
    (spread3(z) << 2) | (spread3(y) << 1) | spread3(x)
}

/// Inverse of [`encode_morton`]
#[inline]
pub fn decode_morton(code: u64) -> (u32, u32, u32) {
    (compact3(code), compact3(code >> 1), compact3(code >> 2))
}

/// `1 << 3L`, the sentinel bit just above a level-`L` code
#[inline]
pub fn last_bit_mask(level: u32) -> u64 {
    debug_assert!(level <= MAX_LEVEL);
    1u64 << (3 * level)
}

/// HZ index of a finest-level Morton code in a `2^level` cube
#[inline]
pub fn hz_index(morton: u64, level: u32) -> u64 {
    let mut hz = morton | last_bit_mask(level);
    hz >>= hz.trailing_zeros();
    hz >> 1
}

/// HZ index of `(x, y, z)` in a `2^level` cube
#[inline]
pub fn encode_hz(x: u32, y: u32, z: u32, level: u32) -> u64 {
    hz_index(encode_morton(x, y, z), level)
}

/// Coordinates of an HZ index; `last_bit_mask` is `1 << 3L`
///
/// `c` must be below `last_bit_mask`, as every HZ index of a level `L` brick is.
pub fn decode_truncated(c: u64, last_bit_mask: u64) -> (u32, u32, u32) {
    debug_assert!(
        c < last_bit_mask,
        "HZ index {} out of range for mask {:#x}",
        c,
        last_bit_mask
    );
    if c == 0 {
        return (0, 0, 0);
    }
    // Restore the dropped lowest one.
    let mut c = (c << 1) | 1;

    let mut i = c;
    i |= i >> 1;
    i |= i >> 2;
    i |= i >> 4;
    i |= i >> 8;
    i |= i >> 16;
    i |= i >> 32;
    i -= i >> 1;

    c = c.wrapping_mul(last_bit_mask / i);
    c &= !last_bit_mask;
    (compact3(c), compact3(c >> 1), compact3(c >> 2))
}

/// 16-bit sample mapped linearly onto 8 bits
#[inline]
pub fn rescale_to_u8(sample: u16) -> u8 {
    (sample as f64 / 65535.0 * 255.0).round() as u8
}

fn check_brick_buffers(width: u32, raw: usize, curved: usize) -> Result<usize> {
    if !width.is_power_of_two() || width.trailing_zeros() > MAX_LEVEL {
        return Err(BrickError::AddressingInvariantViolation(format!(
            "brick width {} is not a supported power of two",
            width
        )));
    }
    let voxels = (width as usize).pow(3);
    if raw != voxels || curved != voxels {
        return Err(BrickError::AddressingInvariantViolation(format!(
            "brick of width {} needs {} samples, got {} raw and {} curved",
            width, voxels, raw, curved
        )));
    }
    Ok(voxels)
}

/// `curved[morton(x, y, z)] = map(raw[x + y*w + z*w*w])`
fn curve_with<T, U, F>(width: u32, raw: &[T], curved: &mut [U], map: F) -> Result<()>
where
    T: Copy + Sync,
    U: Send,
    F: Fn(T) -> U + Sync,
{
    check_brick_buffers(width, raw.len(), curved.len())?;
    let w = width as usize;
    curved
        .par_iter_mut()
        .enumerate()
        .for_each(|(code, out)| {
            let (x, y, z) = decode_morton(code as u64);
            *out = map(raw[x as usize + y as usize * w + z as usize * w * w]);
        });
    Ok(())
}

/// `raw[x + y*w + z*w*w] = curved[morton(x, y, z)]`
fn uncurve_with<T>(width: u32, curved: &[T], raw: &mut [T]) -> Result<()>
where
    T: Copy + Send + Sync,
{
    check_brick_buffers(width, raw.len(), curved.len())?;
    let w = width as usize;
    raw.par_iter_mut().enumerate().for_each(|(index, out)| {
        let x = (index % w) as u32;
        let y = ((index / w) % w) as u32;
        let z = (index / (w * w)) as u32;
        *out = curved[encode_morton(x, y, z) as usize];
    });
    Ok(())
}

/// Reorder a row-major 8-bit brick into Morton order
pub fn curve_bytes(width: u32, raw: &[u8], curved: &mut [u8]) -> Result<()> {
    curve_with(width, raw, curved, |v| v)
}

/// Reorder a row-major 16-bit brick into Morton order
pub fn curve_wide(width: u32, raw: &[u16], curved: &mut [u16]) -> Result<()> {
    curve_with(width, raw, curved, |v| v)
}

/// Reorder a 16-bit brick into Morton order while rescaling it to 8 bits
pub fn curve_wide_to_bytes(width: u32, raw: &[u16], curved: &mut [u8]) -> Result<()> {
    curve_with(width, raw, curved, rescale_to_u8)
}

/// Inverse of [`curve_bytes`]
pub fn uncurve_bytes(width: u32, curved: &[u8], raw: &mut [u8]) -> Result<()> {
    uncurve_with(width, curved, raw)
}

/// Inverse of [`curve_wide`]
pub fn uncurve_wide(width: u32, curved: &[u16], raw: &mut [u16]) -> Result<()> {
    uncurve_with(width, curved, raw)
}

/// Destination of every pixel of one padded slice
#[derive(Debug, Clone)]
pub struct LayerAddresses {
    pub z: u32,
    /// Padded footprint width
    pub width: u32,
    /// Padded footprint height
    pub height: u32,
    /// Owning brick per pixel, row-major
    pub brick_ids: Vec<u32>,
    /// Brick-local Morton address per pixel, row-major
    pub hz_addresses: Vec<u64>,
}

impl LayerAddresses {
    /// `(brick id, address)` of pixel `(x, y)`
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> (u32, u64) {
        let i = x as usize + y as usize * self.width as usize;
        (self.brick_ids[i], self.hz_addresses[i])
    }
}

/// Resolve the owning brick and brick-local address of every pixel in slice `z`
///
/// Covers the whole padded footprint. Runs on the current rayon pool.
pub fn curve_layer(partition: &PartitionResult, z: u32) -> Result<LayerAddresses> {
    let padded = partition.padded_dims();
    if z >= padded.depth {
        return Err(BrickError::AddressingInvariantViolation(format!(
            "slice {} outside padded depth {}",
            z, padded.depth
        )));
    }
    let m = partition.min_brick_size;
    let tensor = partition.tensor;
    let (width, height) = (padded.width, padded.height);
    let pixels = width as usize * height as usize;
    let mut brick_ids = vec![0u32; pixels];
    let mut hz_addresses = vec![0u64; pixels];

    brick_ids
        .par_chunks_mut(width as usize)
        .zip(hz_addresses.par_chunks_mut(width as usize))
        .enumerate()
        .try_for_each(|(y, (ids, addrs))| -> Result<()> {
            let y = y as u32;
            for x in 0..width {
                let cell = tensor.index(x / m, y / m, z / m);
                let id = partition.cell_brick(cell);
                let brick = &partition.bricks[id as usize];
                if !brick.contains(x, y, z) {
                    return Err(BrickError::AddressingInvariantViolation(format!(
                        "voxel ({}, {}, {}) resolved to brick {} ({}) which does not contain it",
                        x, y, z, id, brick
                    )));
                }
                let address = encode_morton(
                    x - brick.position[0],
                    y - brick.position[1],
                    z - brick.position[2],
                );
                if address >= brick.voxel_count() {
                    return Err(BrickError::AddressingInvariantViolation(format!(
                        "address {} exceeds brick {} of {} voxels",
                        address,
                        id,
                        brick.voxel_count()
                    )));
                }
                ids[x as usize] = id;
                addrs[x as usize] = address;
            }
            Ok(())
        })?;

    Ok(LayerAddresses {
        z,
        width,
        height,
        brick_ids,
        hz_addresses,
    })
}
