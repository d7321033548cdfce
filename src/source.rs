//! Volume sources - the slice-by-slice input to partitioning and apportionment

use crate::error::{BrickError, Result};
use crate::types::{ByteOrder, Dims3};
use async_trait::async_trait;
use bytes::Bytes;
use image::DynamicImage;
use ndarray::Array3;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Kinds of volume sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Single flat binary file
    RawFile,
    /// Folder of 2D images, one per slice
    ImageStack,
    /// Samples already held in memory
    InMemory,
}

/// One row-major 2D raster of a volume
#[derive(Debug, Clone)]
pub struct Slice {
    width: u32,
    height: u32,
    bytes_per_pixel: u8,
    byte_order: ByteOrder,
    data: Bytes,
}

impl Slice {
    /// Wrap raw slice bytes, checking their length against the raster size
    pub fn new(
        width: u32,
        height: u32,
        bytes_per_pixel: u8,
        byte_order: ByteOrder,
        data: impl Into<Bytes>,
    ) -> Result<Self> {
        let data = data.into();
        let expected = width as usize * height as usize * bytes_per_pixel as usize;
        if data.len() != expected {
            return Err(BrickError::SourceRead(format!(
                "slice holds {} bytes, expected {} for {}x{} at {} bytes per pixel",
                data.len(),
                expected,
                width,
                height,
                bytes_per_pixel
            )));
        }
        Ok(Self {
            width,
            height,
            bytes_per_pixel,
            byte_order,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> u8 {
        self.bytes_per_pixel
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decoded sample at `(x, y)`
    #[inline]
    pub fn sample(&self, x: u32, y: u32) -> u16 {
        let index = x as usize + y as usize * self.width as usize;
        match self.bytes_per_pixel {
            1 => self.data[index] as u16,
            _ => {
                let offset = index * 2;
                self.byte_order
                    .read_u16([self.data[offset], self.data[offset + 1]])
            }
        }
    }
}

/// Capability interface over every volume input format
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// Volume extents in voxels
    fn dims(&self) -> Dims3;

    /// Bytes per sample (1 or 2)
    fn bytes_per_pixel(&self) -> u8;

    /// Byte order of 16-bit samples
    fn byte_order(&self) -> ByteOrder;

    /// Load slice `z`
    async fn get_slice(&self, z: u32) -> Result<Slice>;

    /// Human readable name of every slice, in order
    fn slice_names(&self) -> Vec<String>;

    /// Get the source kind
    fn kind(&self) -> SourceKind;
}

fn check_slice_index(z: u32, dims: Dims3) -> Result<()> {
    if z >= dims.depth {
        return Err(BrickError::SourceRead(format!(
            "slice {} out of range (depth {})",
            z, dims.depth
        )));
    }
    Ok(())
}

/// A volume stored as one flat binary file of consecutive slices
pub struct RawVolume {
    path: PathBuf,
    dims: Dims3,
    bytes_per_pixel: u8,
    byte_order: ByteOrder,
}

impl RawVolume {
    /// Describe a raw file; its layout must be supplied by the caller
    pub fn new(
        path: impl AsRef<Path>,
        dims: Dims3,
        bits_per_pixel: u32,
        byte_order: ByteOrder,
    ) -> Result<Self> {
        if dims.is_empty() {
            return Err(BrickError::SourceRead(format!(
                "invalid volume dimensions {}",
                dims
            )));
        }
        if bits_per_pixel != 8 && bits_per_pixel != 16 {
            return Err(BrickError::SourceRead(format!(
                "raw volumes support 8 or 16 bits per pixel, got {}",
                bits_per_pixel
            )));
        }
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(BrickError::SourceRead(format!(
                "raw file not found: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            dims,
            bytes_per_pixel: (bits_per_pixel / 8) as u8,
            byte_order,
        })
    }

    fn slice_bytes(&self) -> usize {
        self.dims.width as usize * self.dims.height as usize * self.bytes_per_pixel as usize
    }
}

#[async_trait]
impl VolumeSource for RawVolume {
    fn dims(&self) -> Dims3 {
        self.dims
    }

    fn bytes_per_pixel(&self) -> u8 {
        self.bytes_per_pixel
    }

    fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    async fn get_slice(&self, z: u32) -> Result<Slice> {
        check_slice_index(z, self.dims)?;
        let len = self.slice_bytes();
        let offset = z as u64 * len as u64;

        let read = async {
            let mut file = fs::File::open(&self.path).await?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data).await?;
            Ok::<_, std::io::Error>(data)
        };
        let data = read.await.map_err(|e| {
            BrickError::SourceRead(format!(
                "reading slice {} of {}: {}",
                z,
                self.path.display(),
                e
            ))
        })?;

        Slice::new(
            self.dims.width,
            self.dims.height,
            self.bytes_per_pixel,
            self.byte_order,
            data,
        )
    }

    fn slice_names(&self) -> Vec<String> {
        (0..self.dims.depth).map(|i| format!("Slice #{}", i)).collect()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::RawFile
    }
}

/// A volume stored as a folder of grayscale images ordered by file name
pub struct ImageStack {
    files: Vec<PathBuf>,
    dims: Dims3,
    bytes_per_pixel: u8,
}

impl ImageStack {
    const EXTENSIONS: &'static [&'static str] = &["tif", "tiff", "png"];

    /// Scan a directory for slice images; the first one fixes the raster format
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        let mut entries = fs::read_dir(dir).await.map_err(|e| {
            BrickError::SourceRead(format!("invalid image directory {}: {}", dir.display(), e))
        })?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| Self::EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if matches {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(BrickError::SourceRead(format!(
                "no .tif/.tiff/.png files found in {}",
                dir.display()
            )));
        }
        files.sort();

        let first = load_image(files[0].clone()).await?;
        let bits_per_channel = {
            let color = first.color();
            color.bits_per_pixel() / color.channel_count() as u16
        };
        let bytes_per_pixel = if bits_per_channel > 8 { 2 } else { 1 };
        let dims = Dims3::new(first.width(), first.height(), files.len() as u32);

        tracing::debug!(
            "Opened image stack {} ({}, {} bytes per pixel)",
            dir.display(),
            dims,
            bytes_per_pixel
        );

        Ok(Self {
            files,
            dims,
            bytes_per_pixel,
        })
    }
}

async fn load_image(path: PathBuf) -> Result<DynamicImage> {
    let image = tokio::task::spawn_blocking(move || image::open(&path)).await??;
    Ok(image)
}

#[async_trait]
impl VolumeSource for ImageStack {
    fn dims(&self) -> Dims3 {
        self.dims
    }

    fn bytes_per_pixel(&self) -> u8 {
        self.bytes_per_pixel
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }

    async fn get_slice(&self, z: u32) -> Result<Slice> {
        check_slice_index(z, self.dims)?;
        let path = &self.files[z as usize];
        let image = load_image(path.clone()).await?;
        if image.width() != self.dims.width || image.height() != self.dims.height {
            return Err(BrickError::SourceRead(format!(
                "{} is {}x{}, expected {}x{}",
                path.display(),
                image.width(),
                image.height(),
                self.dims.width,
                self.dims.height
            )));
        }

        let data: Vec<u8> = if self.bytes_per_pixel == 1 {
            image.into_luma8().into_raw()
        } else {
            image
                .into_luma16()
                .into_raw()
                .into_iter()
                .flat_map(u16::to_le_bytes)
                .collect()
        };

        Slice::new(
            self.dims.width,
            self.dims.height,
            self.bytes_per_pixel,
            ByteOrder::LittleEndian,
            data,
        )
    }

    fn slice_names(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|p| p.display().to_string())
            .collect()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::ImageStack
    }
}

/// A volume held in memory, indexed `[z, y, x]`
pub struct InMemoryVolume {
    samples: Array3<u16>,
    bytes_per_pixel: u8,
}

impl InMemoryVolume {
    /// Wrap an existing sample array; 8-bit volumes keep only the low byte
    pub fn new(samples: Array3<u16>, bytes_per_pixel: u8) -> Result<Self> {
        if bytes_per_pixel != 1 && bytes_per_pixel != 2 {
            return Err(BrickError::SourceRead(format!(
                "bytes per pixel must be 1 or 2, got {}",
                bytes_per_pixel
            )));
        }
        if samples.is_empty() {
            return Err(BrickError::SourceRead("empty volume".to_string()));
        }
        Ok(Self {
            samples,
            bytes_per_pixel,
        })
    }

    /// Build a volume by evaluating `f(x, y, z)` at every voxel
    pub fn from_fn<F>(dims: Dims3, bytes_per_pixel: u8, mut f: F) -> Result<Self>
    where
        F: FnMut(u32, u32, u32) -> u16,
    {
        let shape = (
            dims.depth as usize,
            dims.height as usize,
            dims.width as usize,
        );
        let samples = Array3::from_shape_fn(shape, |(z, y, x)| f(x as u32, y as u32, z as u32));
        Self::new(samples, bytes_per_pixel)
    }

    /// Sample at `(x, y, z)`
    pub fn get(&self, x: u32, y: u32, z: u32) -> u16 {
        self.samples[[z as usize, y as usize, x as usize]]
    }
}

#[async_trait]
impl VolumeSource for InMemoryVolume {
    fn dims(&self) -> Dims3 {
        let (d, h, w) = self.samples.dim();
        Dims3::new(w as u32, h as u32, d as u32)
    }

    fn bytes_per_pixel(&self) -> u8 {
        self.bytes_per_pixel
    }

    fn byte_order(&self) -> ByteOrder {
        ByteOrder::LittleEndian
    }

    async fn get_slice(&self, z: u32) -> Result<Slice> {
        let dims = self.dims();
        check_slice_index(z, dims)?;
        let plane = self.samples.index_axis(ndarray::Axis(0), z as usize);
        let data: Vec<u8> = if self.bytes_per_pixel == 1 {
            plane.iter().map(|&v| v as u8).collect()
        } else {
            plane.iter().flat_map(|v| v.to_le_bytes()).collect()
        };
        Slice::new(
            dims.width,
            dims.height,
            self.bytes_per_pixel,
            ByteOrder::LittleEndian,
            data,
        )
    }

    fn slice_names(&self) -> Vec<String> {
        (0..self.dims().depth)
            .map(|i| format!("Slice #{}", i))
            .collect()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_slice_length_checked() {
        assert!(Slice::new(4, 4, 2, ByteOrder::LittleEndian, vec![0u8; 31]).is_err());
        let slice = Slice::new(2, 1, 2, ByteOrder::BigEndian, vec![0x01, 0x02, 0x03, 0x04]).unwrap();
        assert_eq!(slice.sample(0, 0), 0x0102);
        assert_eq!(slice.sample(1, 0), 0x0304);
    }

    #[tokio::test]
    async fn test_raw_volume_16bit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("volume.raw");
        let dims = Dims3::new(3, 2, 2);
        let bytes: Vec<u8> = (0..dims.voxel_count() as u16)
            .flat_map(|v| (v * 100).to_be_bytes())
            .collect();
        std::fs::write(&path, bytes).unwrap();

        let volume = RawVolume::new(&path, dims, 16, ByteOrder::BigEndian).unwrap();
        assert_eq!(volume.bytes_per_pixel(), 2);
        assert_eq!(volume.kind(), SourceKind::RawFile);

        let slice = volume.get_slice(1).await.unwrap();
        assert_eq!(slice.sample(0, 0), 600);
        assert_eq!(slice.sample(2, 1), 1100);
        assert_eq!(volume.slice_names(), vec!["Slice #0", "Slice #1"]);

        assert!(matches!(
            volume.get_slice(2).await,
            Err(BrickError::SourceRead(_))
        ));
    }

    #[tokio::test]
    async fn test_raw_volume_truncated_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("short.raw");
        std::fs::write(&path, vec![0u8; 10]).unwrap();

        let volume = RawVolume::new(&path, Dims3::new(4, 4, 2), 8, ByteOrder::native()).unwrap();
        assert!(volume.get_slice(0).await.is_err());
    }

    #[test]
    fn test_raw_volume_validation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("v.raw");
        std::fs::write(&path, [0u8; 8]).unwrap();

        assert!(RawVolume::new(&path, Dims3::new(2, 2, 2), 12, ByteOrder::native()).is_err());
        assert!(RawVolume::new(&path, Dims3::new(0, 2, 2), 8, ByteOrder::native()).is_err());
        assert!(RawVolume::new(
            temp_dir.path().join("missing.raw"),
            Dims3::new(2, 2, 2),
            8,
            ByteOrder::native()
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_image_stack() {
        let temp_dir = TempDir::new().unwrap();
        for z in 0..3u16 {
            let img = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_fn(4, 2, |x, y| {
                image::Luma([z * 1000 + (y as u16) * 10 + x as u16])
            });
            img.save(temp_dir.path().join(format!("slice_{:03}.png", z)))
                .unwrap();
        }
        std::fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let stack = ImageStack::open(temp_dir.path()).await.unwrap();
        assert_eq!(stack.dims(), Dims3::new(4, 2, 3));
        assert_eq!(stack.bytes_per_pixel(), 2);
        assert_eq!(stack.slice_names().len(), 3);
        assert!(stack.slice_names()[0].ends_with("slice_000.png"));

        let slice = stack.get_slice(2).await.unwrap();
        assert_eq!(slice.sample(3, 1), 2013);
    }

    #[tokio::test]
    async fn test_image_stack_empty_dir() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            ImageStack::open(temp_dir.path()).await,
            Err(BrickError::SourceRead(_))
        ));
    }

    #[tokio::test]
    async fn test_in_memory_volume() {
        let volume =
            InMemoryVolume::from_fn(Dims3::new(3, 2, 2), 2, |x, y, z| (x + 3 * y + 6 * z) as u16)
                .unwrap();
        assert_eq!(volume.dims(), Dims3::new(3, 2, 2));
        assert_eq!(volume.get(2, 1, 1), 11);

        let slice = volume.get_slice(1).await.unwrap();
        assert_eq!(slice.sample(0, 0), 6);
        assert_eq!(slice.sample(2, 1), 11);
    }
}
