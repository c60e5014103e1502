//! Recurrent per-beam cache state carried across decode steps.

use std::any::Any;

use anyhow::Result;
use ndarray::{s, Array3, ArrayView3};
use rayon::prelude::*;

/// Type-erased container for the recurrent state a model accumulates across
/// steps (typically attention key/value rows, one row per beam slot).
///
/// The engine treats the contents as opaque; it only advances the stored
/// length and permutes rows when beam membership changes. Model executors
/// downcast through `as_any` to read and write their concrete layout.
pub trait Cache: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Number of cached positions.
    fn seq_length(&self) -> usize;

    /// Advances the cached length after a step's new entries are written.
    fn increment_len(&mut self, new_tokens: usize);

    fn clear(&mut self);

    /// Permutes rows so that row `i` afterwards holds the history of
    /// `parents[i]`. Beam membership is not stable across steps, so this is
    /// a gather, not an append.
    fn reorder(&mut self, parents: &[usize]) -> Result<()>;
}

/// Double-buffered key/value cache with allocation-free reordering.
///
/// Keeps two sets of per-layer buffers and swaps them on `reorder`, so the
/// gather on the critical path of every step copies into pre-allocated
/// memory instead of cloning. Buffer shape per layer:
/// `[rows, capacity, hidden]` where `rows = batch * num_beams`.
#[derive(Clone)]
pub struct BeamKvCache {
    layers_k: Vec<Array3<f32>>,
    layers_v: Vec<Array3<f32>>,
    scratch_k: Vec<Array3<f32>>,
    scratch_v: Vec<Array3<f32>>,
    seq_length: usize,
    capacity: usize,
}

impl BeamKvCache {
    pub fn new(num_layers: usize, rows: usize, capacity: usize, hidden_size: usize) -> Self {
        let alloc = || {
            (0..num_layers)
                .map(|_| Array3::zeros((rows, capacity, hidden_size)))
                .collect::<Vec<_>>()
        };
        Self {
            layers_k: alloc(),
            layers_v: alloc(),
            scratch_k: alloc(),
            scratch_v: alloc(),
            seq_length: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_layers(&self) -> usize {
        self.layers_k.len()
    }

    pub fn rows(&self) -> usize {
        self.layers_k.first().map(|k| k.shape()[0]).unwrap_or(0)
    }

    /// Writes new key/value entries for one layer at the current position.
    /// Call [`Cache::increment_len`] once all layers are updated.
    pub fn update(&mut self, layer: usize, new_k: &Array3<f32>, new_v: &Array3<f32>) -> Result<()> {
        if layer >= self.layers_k.len() {
            anyhow::bail!(
                "layer index {} out of bounds (num_layers={})",
                layer,
                self.layers_k.len()
            );
        }
        let new_tokens = new_k.shape()[1];
        let end = self.seq_length + new_tokens;
        if end > self.capacity {
            anyhow::bail!(
                "cache overflow: seq_length={} + new_tokens={} exceeds capacity={}",
                self.seq_length,
                new_tokens,
                self.capacity
            );
        }
        let target = s![.., self.seq_length..end, ..];
        self.layers_k[layer].slice_mut(target).assign(new_k);
        self.layers_v[layer].slice_mut(target).assign(new_v);
        Ok(())
    }

    /// Views of the active portion of one layer's keys and values.
    pub fn get(&self, layer: usize) -> Option<(ArrayView3<f32>, ArrayView3<f32>)> {
        if layer >= self.layers_k.len() {
            return None;
        }
        let active = s![.., 0..self.seq_length, ..];
        Some((
            self.layers_k[layer].slice(active),
            self.layers_v[layer].slice(active),
        ))
    }
}

impl Cache for BeamKvCache {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn seq_length(&self) -> usize {
        self.seq_length
    }

    fn increment_len(&mut self, new_tokens: usize) {
        let new_len = self.seq_length + new_tokens;
        assert!(
            new_len <= self.capacity,
            "cache overflow: {} exceeds capacity {}",
            new_len,
            self.capacity
        );
        self.seq_length = new_len;
    }

    fn clear(&mut self) {
        self.seq_length = 0;
    }

    fn reorder(&mut self, parents: &[usize]) -> Result<()> {
        if self.seq_length == 0 {
            // Nothing written yet; the permutation is a no-op.
            return Ok(());
        }
        if parents.len() != self.rows() {
            anyhow::bail!(
                "parent index count ({}) must match cache rows ({})",
                parents.len(),
                self.rows()
            );
        }
        let valid = self.seq_length;

        // Gather main -> scratch across layers in parallel, then swap the
        // buffer sets.
        self.layers_k
            .par_iter()
            .zip(self.layers_v.par_iter())
            .zip(self.scratch_k.par_iter_mut())
            .zip(self.scratch_v.par_iter_mut())
            .for_each(|(((src_k, src_v), dst_k), dst_v)| {
                for (dst_row, &src_row) in parents.iter().enumerate() {
                    dst_k
                        .slice_mut(s![dst_row, ..valid, ..])
                        .assign(&src_k.slice(s![src_row, ..valid, ..]));
                    dst_v
                        .slice_mut(s![dst_row, ..valid, ..])
                        .assign(&src_v.slice(s![src_row, ..valid, ..]));
                }
            });

        std::mem::swap(&mut self.layers_k, &mut self.scratch_k);
        std::mem::swap(&mut self.layers_v, &mut self.scratch_v);
        Ok(())
    }
}
