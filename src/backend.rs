//! Parallel primitives consumed by the partitioner: classify, scan and compact
//!
//! Backends implement [`ComputeBackend`]. A [`ComputeContext`] owns the thread
//! pool the primitives run on and is passed explicitly to the partitioner and
//! apportioner; constructing it initializes the pool and dropping it tears the
//! pool down.

use crate::error::{BrickError, Result};
use crate::types::TensorDims;
use rayon::prelude::*;
use rayon::ThreadPool;

/// Cells per block in the blocked scan and compaction
const BLOCK: usize = 4096;

/// Output of the per-cell classification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Candidate brick edge per cell, in cells
    pub sizes: Vec<u32>,
    /// 1 iff the cell is the minimum corner of a brick
    pub predicate: Vec<u32>,
    /// Voxel coordinates of each cell's minimum corner
    pub origins: Vec<[u32; 3]>,
}

/// Semantic contract of the data-parallel primitives
pub trait ComputeBackend: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Classify every tensor cell (see [`classify_cell`])
    fn classify(
        &self,
        tensor: TensorDims,
        min_brick_size: u32,
        max_brick_size: u32,
    ) -> Result<Classification>;

    /// Exclusive prefix sum of `predicate`, followed by the grand total
    ///
    /// The returned vector holds `predicate.len() + 1` entries.
    fn scan(&self, predicate: &[u32]) -> Result<Vec<u32>>;

    /// Gather the flagged `values` into a dense vector at their scanned slots
    fn compact_u32(&self, values: &[u32], predicate: &[u32], addresses: &[u32])
        -> Result<Vec<u32>>;

    /// Same as [`ComputeBackend::compact_u32`] for coordinate triples
    fn compact_origins(
        &self,
        values: &[[u32; 3]],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<[u32; 3]>>;
}

/// Largest aligned block containing `cell` that fits inside the tensor
///
/// Returns `(size, is_origin)` where `size` is a power of two no larger than
/// `max_cells`. Aligned siblings merge into their parent block only when the
/// whole parent fits, so every cell of a block reports the same size.
#[inline]
pub fn classify_cell(tensor: TensorDims, cell: [u32; 3], max_cells: u32) -> (u32, bool) {
    let bounds = [tensor.width, tensor.height, tensor.depth];
    let mut size = 1u32;
    while size < max_cells {
        let next = size << 1;
        let fits = (0..3).all(|axis| {
            let base = cell[axis] & !(next - 1);
            base as u64 + next as u64 <= bounds[axis] as u64
        });
        if !fits {
            break;
        }
        size = next;
    }
    let is_origin = cell.iter().all(|&c| c & (size - 1) == 0);
    (size, is_origin)
}

fn check_classify_args(tensor: TensorDims, min_brick_size: u32, max_brick_size: u32) -> Result<u32> {
    if tensor.is_empty() {
        return Err(BrickError::ComputeBackend("empty tensor".to_string()));
    }
    if !min_brick_size.is_power_of_two()
        || !max_brick_size.is_power_of_two()
        || min_brick_size > max_brick_size
    {
        return Err(BrickError::ComputeBackend(format!(
            "invalid brick bounds {}..{}",
            min_brick_size, max_brick_size
        )));
    }
    Ok(max_brick_size / min_brick_size)
}

fn check_compact_args(values: usize, predicate: &[u32], addresses: &[u32]) -> Result<usize> {
    if predicate.len() != values || addresses.len() != values + 1 {
        return Err(BrickError::ComputeBackend(format!(
            "compaction length mismatch: {} values, {} predicates, {} addresses",
            values,
            predicate.len(),
            addresses.len()
        )));
    }
    Ok(addresses[values] as usize)
}

fn slot_error(index: usize) -> BrickError {
    BrickError::ComputeBackend(format!("scanned address of cell {} is out of range", index))
}

/// Data-parallel backend running on the context's rayon pool
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    fn scatter<T>(values: &[T], predicate: &[u32], addresses: &[u32]) -> Result<Vec<T>>
    where
        T: Copy + Default + Send + Sync,
    {
        let total = check_compact_args(values.len(), predicate, addresses)?;
        let n = values.len();
        let mut dense = vec![T::default(); total];

        // Addresses are monotone, so each input block owns a contiguous output range.
        let mut parts = Vec::with_capacity(n.div_ceil(BLOCK));
        let mut rest = dense.as_mut_slice();
        for start in (0..n).step_by(BLOCK) {
            let end = (start + BLOCK).min(n);
            let len = addresses[end]
                .checked_sub(addresses[start])
                .ok_or_else(|| slot_error(start))? as usize;
            if len > rest.len() {
                return Err(slot_error(start));
            }
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(len);
            parts.push((start, end, head));
            rest = tail;
        }

        parts
            .into_par_iter()
            .try_for_each(|(start, end, out)| -> Result<()> {
                let base = addresses[start];
                for i in start..end {
                    if predicate[i] != 0 {
                        let slot = addresses[i]
                            .checked_sub(base)
                            .ok_or_else(|| slot_error(i))? as usize;
                        *out.get_mut(slot).ok_or_else(|| slot_error(i))? = values[i];
                    }
                }
                Ok(())
            })?;

        Ok(dense)
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn classify(
        &self,
        tensor: TensorDims,
        min_brick_size: u32,
        max_brick_size: u32,
    ) -> Result<Classification> {
        let max_cells = check_classify_args(tensor, min_brick_size, max_brick_size)?;
        let n = tensor.len();
        let mut sizes = vec![0u32; n];
        let mut predicate = vec![0u32; n];
        let mut origins = vec![[0u32; 3]; n];

        sizes
            .par_iter_mut()
            .zip(predicate.par_iter_mut())
            .zip(origins.par_iter_mut())
            .enumerate()
            .for_each(|(i, ((size, pred), origin))| {
                let cell = tensor.coords(i);
                let (s, is_origin) = classify_cell(tensor, cell, max_cells);
                *size = s;
                *pred = is_origin as u32;
                *origin = [
                    cell[0] * min_brick_size,
                    cell[1] * min_brick_size,
                    cell[2] * min_brick_size,
                ];
            });

        Ok(Classification {
            sizes,
            predicate,
            origins,
        })
    }

    fn scan(&self, predicate: &[u32]) -> Result<Vec<u32>> {
        let n = predicate.len();
        let block_sums: Vec<u64> = predicate
            .par_chunks(BLOCK)
            .map(|block| block.iter().map(|&p| p as u64).sum())
            .collect();

        let mut offsets = Vec::with_capacity(block_sums.len());
        let mut running = 0u64;
        for sum in block_sums {
            offsets.push(running as u32);
            running += sum;
        }
        if running > u32::MAX as u64 {
            return Err(BrickError::ComputeBackend(
                "scan total overflows 32 bits".to_string(),
            ));
        }

        let mut addresses = vec![0u32; n + 1];
        addresses[..n]
            .par_chunks_mut(BLOCK)
            .zip(predicate.par_chunks(BLOCK))
            .zip(offsets.par_iter())
            .for_each(|((out, input), &base)| {
                let mut acc = base;
                for (slot, &p) in out.iter_mut().zip(input) {
                    *slot = acc;
                    acc += p;
                }
            });
        addresses[n] = running as u32;
        Ok(addresses)
    }

    fn compact_u32(
        &self,
        values: &[u32],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<u32>> {
        Self::scatter(values, predicate, addresses)
    }

    fn compact_origins(
        &self,
        values: &[[u32; 3]],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<[u32; 3]>> {
        Self::scatter(values, predicate, addresses)
    }
}

/// Single-threaded reference backend
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialBackend;

impl SerialBackend {
    fn scatter<T: Copy + Default>(
        values: &[T],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<T>> {
        let total = check_compact_args(values.len(), predicate, addresses)?;
        let mut dense = vec![T::default(); total];
        for (i, value) in values.iter().enumerate() {
            if predicate[i] != 0 {
                *dense
                    .get_mut(addresses[i] as usize)
                    .ok_or_else(|| slot_error(i))? = *value;
            }
        }
        Ok(dense)
    }
}

impl ComputeBackend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn classify(
        &self,
        tensor: TensorDims,
        min_brick_size: u32,
        max_brick_size: u32,
    ) -> Result<Classification> {
        let max_cells = check_classify_args(tensor, min_brick_size, max_brick_size)?;
        let mut out = Classification::default();
        for i in 0..tensor.len() {
            let cell = tensor.coords(i);
            let (size, is_origin) = classify_cell(tensor, cell, max_cells);
            out.sizes.push(size);
            out.predicate.push(is_origin as u32);
            out.origins.push(cell.map(|c| c * min_brick_size));
        }
        Ok(out)
    }

    fn scan(&self, predicate: &[u32]) -> Result<Vec<u32>> {
        let mut addresses = Vec::with_capacity(predicate.len() + 1);
        let mut acc = 0u32;
        for &p in predicate {
            addresses.push(acc);
            acc = acc.checked_add(p).ok_or_else(|| {
                BrickError::ComputeBackend("scan total overflows 32 bits".to_string())
            })?;
        }
        addresses.push(acc);
        Ok(addresses)
    }

    fn compact_u32(
        &self,
        values: &[u32],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<u32>> {
        Self::scatter(values, predicate, addresses)
    }

    fn compact_origins(
        &self,
        values: &[[u32; 3]],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<[u32; 3]>> {
        Self::scatter(values, predicate, addresses)
    }
}

/// Explicit compute context: a backend plus the thread pool it runs on
pub struct ComputeContext {
    pool: ThreadPool,
    backend: Box<dyn ComputeBackend>,
}

impl ComputeContext {
    /// Create a context with the [`CpuBackend`]; `threads == 0` picks rayon's default
    pub fn new(threads: usize) -> Result<Self> {
        Self::with_backend(threads, Box::new(CpuBackend))
    }

    /// Create a context around any backend
    pub fn with_backend(threads: usize, backend: Box<dyn ComputeBackend>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("hzbrick-compute-{}", i))
            .build()
            .map_err(|e| BrickError::ComputeBackend(e.to_string()))?;
        tracing::debug!(
            "Compute context up: {} backend on {} threads",
            backend.name(),
            pool.current_num_threads()
        );
        Ok(Self { pool, backend })
    }

    /// Single-threaded context running the [`SerialBackend`]
    pub fn serial() -> Result<Self> {
        Self::with_backend(1, Box::new(SerialBackend))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` inside this context's thread pool
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }

    pub fn classify(
        &self,
        tensor: TensorDims,
        min_brick_size: u32,
        max_brick_size: u32,
    ) -> Result<Classification> {
        self.install(|| self.backend.classify(tensor, min_brick_size, max_brick_size))
    }

    pub fn scan(&self, predicate: &[u32]) -> Result<Vec<u32>> {
        self.install(|| self.backend.scan(predicate))
    }

    pub fn compact_u32(
        &self,
        values: &[u32],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<u32>> {
        self.install(|| self.backend.compact_u32(values, predicate, addresses))
    }

    pub fn compact_origins(
        &self,
        values: &[[u32; 3]],
        predicate: &[u32],
        addresses: &[u32],
    ) -> Result<Vec<[u32; 3]>> {
        self.install(|| self.backend.compact_origins(values, predicate, addresses))
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        tracing::debug!("Compute context ({} backend) torn down", self.backend.name());
    }
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("backend", &self.backend.name())
            .field("threads", &self.pool.current_num_threads())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_cell_full_merge() {
        let tensor = TensorDims::new(2, 2, 2);
        assert_eq!(classify_cell(tensor, [0, 0, 0], 32), (2, true));
        assert_eq!(classify_cell(tensor, [1, 1, 1], 32), (2, false));
    }

    #[test]
    fn test_classify_cell_no_merge_when_min_equals_max() {
        let tensor = TensorDims::new(4, 4, 4);
        for i in 0..tensor.len() {
            assert_eq!(classify_cell(tensor, tensor.coords(i), 1), (1, true));
        }
    }

    #[test]
    fn test_classify_cell_ragged_edge() {
        // 3 cells wide: the third column cannot join a 2-block.
        let tensor = TensorDims::new(3, 2, 2);
        assert_eq!(classify_cell(tensor, [0, 0, 0], 8), (2, true));
        assert_eq!(classify_cell(tensor, [1, 0, 1], 8), (2, false));
        assert_eq!(classify_cell(tensor, [2, 0, 0], 8), (1, true));
        assert_eq!(classify_cell(tensor, [2, 1, 1], 8), (1, true));
    }

    #[test]
    fn test_scan_matches_serial() {
        let ctx = ComputeContext::new(4).unwrap();
        let predicate: Vec<u32> = (0..10_000u32).map(|i| (i % 3 == 0) as u32).collect();
        let parallel = ctx.scan(&predicate).unwrap();
        let serial = SerialBackend.scan(&predicate).unwrap();
        assert_eq!(parallel, serial);
        assert_eq!(parallel.len(), predicate.len() + 1);
        assert_eq!(*parallel.last().unwrap(), 3334);
        assert_eq!(parallel[0], 0);
        assert_eq!(parallel[4], 2);
    }

    #[test]
    fn test_scan_empty() {
        let ctx = ComputeContext::new(2).unwrap();
        assert_eq!(ctx.scan(&[]).unwrap(), vec![0]);
    }

    #[test]
    fn test_compact() {
        let ctx = ComputeContext::new(2).unwrap();
        let values = vec![10, 11, 12, 13, 14];
        let predicate = vec![1, 0, 0, 1, 1];
        let addresses = ctx.scan(&predicate).unwrap();
        assert_eq!(
            ctx.compact_u32(&values, &predicate, &addresses).unwrap(),
            vec![10, 13, 14]
        );

        let origins = vec![[0, 0, 0], [1, 0, 0], [2, 0, 0], [3, 0, 0], [4, 0, 0]];
        assert_eq!(
            ctx.compact_origins(&origins, &predicate, &addresses)
                .unwrap(),
            vec![[0, 0, 0], [3, 0, 0], [4, 0, 0]]
        );
    }

    #[test]
    fn test_compact_large_matches_serial() {
        let ctx = ComputeContext::new(4).unwrap();
        let values: Vec<u32> = (0..20_000).collect();
        let predicate: Vec<u32> = values.iter().map(|v| (v % 7 == 2) as u32).collect();
        let addresses = ctx.scan(&predicate).unwrap();
        let parallel = ctx.compact_u32(&values, &predicate, &addresses).unwrap();
        let serial = SerialBackend
            .compact_u32(&values, &predicate, &addresses)
            .unwrap();
        assert_eq!(parallel, serial);
        assert!(parallel.iter().all(|v| v % 7 == 2));
    }

    #[test]
    fn test_compact_length_mismatch() {
        let ctx = ComputeContext::new(1).unwrap();
        let err = ctx.compact_u32(&[1, 2], &[1], &[0, 1]).unwrap_err();
        assert!(matches!(err, BrickError::ComputeBackend(_)));
    }

    #[test]
    fn test_classify_backends_agree() {
        let ctx = ComputeContext::new(3).unwrap();
        let tensor = TensorDims::new(7, 5, 6);
        let cpu = ctx.classify(tensor, 16, 128).unwrap();
        let serial = SerialBackend.classify(tensor, 16, 128).unwrap();
        assert_eq!(cpu, serial);
        assert_eq!(ctx.backend_name(), "cpu");
    }

    #[test]
    fn test_classify_rejects_bad_bounds() {
        let ctx = ComputeContext::serial().unwrap();
        assert!(ctx.classify(TensorDims::new(1, 1, 1), 64, 32).is_err());
        assert!(ctx.classify(TensorDims::new(0, 1, 1), 32, 64).is_err());
    }
}
