//! Core data types shared by the partitioner, curve codec and apportioner

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte order of multi-byte samples in a volume source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    #[default]
    LittleEndian,
    BigEndian,
}

impl ByteOrder {
    /// Byte order of the current platform
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::BigEndian
        } else {
            ByteOrder::LittleEndian
        }
    }

    /// Decode a 16-bit sample from two bytes
    pub fn read_u16(&self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
        }
    }
}

/// Extents of a volume in voxels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims3 {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Dims3 {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Total number of voxels
    pub fn voxel_count(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Largest extent along any axis
    pub fn max_extent(&self) -> u32 {
        self.width.max(self.height).max(self.depth)
    }

    pub fn as_array(&self) -> [u32; 3] {
        [self.width, self.height, self.depth]
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }
}

impl fmt::Display for Dims3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} x {} x {}", self.width, self.height, self.depth)
    }
}

/// Dimensions of the partition tensor, in cells of `min_brick_size` voxels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDims {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl TensorDims {
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Tensor covering a volume, padding each axis up to a whole cell
    pub fn covering(dims: Dims3, min_brick_size: u32) -> Self {
        let cells = |extent: u32| extent.div_ceil(min_brick_size).max(1);
        Self::new(cells(dims.width), cells(dims.height), cells(dims.depth))
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear cell index, x fastest
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        x as usize
            + y as usize * self.width as usize
            + z as usize * self.width as usize * self.height as usize
    }

    /// Inverse of [`TensorDims::index`]
    pub fn coords(&self, index: usize) -> [u32; 3] {
        let plane = self.width as usize * self.height as usize;
        let z = index / plane;
        let rem = index % plane;
        [
            (rem % self.width as usize) as u32,
            (rem / self.width as usize) as u32,
            z as u32,
        ]
    }

    pub fn contains(&self, x: u32, y: u32, z: u32) -> bool {
        x < self.width && y < self.height && z < self.depth
    }
}

/// A cubic, power-of-two sized region of the padded volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Brick {
    /// Minimum corner, in voxels
    pub position: [u32; 3],
    /// Edge length in voxels
    pub size: u32,
}

impl Brick {
    pub fn new(position: [u32; 3], size: u32) -> Self {
        Self { position, size }
    }

    /// Curve level `L` with `size == 2^L`
    pub fn level(&self) -> u32 {
        self.size.trailing_zeros()
    }

    /// Number of voxels stored in this brick
    pub fn voxel_count(&self) -> u64 {
        let s = self.size as u64;
        s * s * s
    }

    /// Exclusive maximum corner
    pub fn end(&self) -> [u32; 3] {
        [
            self.position[0] + self.size,
            self.position[1] + self.size,
            self.position[2] + self.size,
        ]
    }

    pub fn contains(&self, x: u32, y: u32, z: u32) -> bool {
        let end = self.end();
        (self.position[0]..end[0]).contains(&x)
            && (self.position[1]..end[1]).contains(&y)
            && (self.position[2]..end[2]).contains(&z)
    }

    /// Whether this brick and `other` share at least one voxel
    pub fn overlaps(&self, other: &Brick) -> bool {
        let (a0, a1) = (self.position, self.end());
        let (b0, b1) = (other.position, other.end());
        (0..3).all(|i| a0[i] < b1[i] && b0[i] < a1[i])
    }

    /// Range of slices this brick spans
    pub fn z_range(&self) -> std::ops::Range<u32> {
        self.position[2]..self.position[2] + self.size
    }
}

impl fmt::Display for Brick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}^3 @ ({}, {}, {})",
            self.size, self.position[0], self.position[1], self.position[2]
        )
    }
}
