//! Backend capability interface and the CPU reference implementation.

use anyhow::Result;
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};

use crate::config::SearchConfig;
use crate::error::SearchResult;
use crate::logits::{LogitsProcessor, StepState};

/// Result of a top-k selection: values in descending order with their
/// source indices. Ties are broken by the lower index so results are
/// reproducible across runs and backends.
#[derive(Clone, Debug)]
pub struct TopK {
    pub values: Vec<f32>,
    pub indices: Vec<usize>,
}

/// Backend-injected operations the search loop depends on.
///
/// One implementation exists per execution backend, selected and bound
/// once at request setup; the orchestrator only ever sees this trait.
/// Every implementation must preserve the numeric semantics of the
/// reference [`LogitsProcessor`] and the gather/expand row layouts,
/// whatever parallel decomposition it uses internally.
pub trait DeviceCapabilities: Send + Sync {
    /// Top `k` entries of `scores` by value, ties broken by lower index.
    fn top_k(&self, scores: ArrayView1<f32>, k: usize) -> Result<TopK>;

    /// Backend-optimized variant of the logits transform pipeline.
    fn process_logits(
        &self,
        raw_logits: ArrayView2<f32>,
        state: &StepState<'_>,
        config: &SearchConfig,
    ) -> SearchResult<Array2<f32>>;

    /// Replicates each batch row `num_beams` times:
    /// `[batch, n] -> [batch * num_beams, n]`.
    fn expand_tokens(&self, tokens: ArrayView2<u32>, num_beams: usize) -> Result<Array2<u32>>;

    /// Same replication for mask rows.
    fn expand_mask(&self, mask: ArrayView2<f32>, num_beams: usize) -> Result<Array2<f32>>;

    /// Same replication for hidden-state buffers:
    /// `[batch, len, hidden] -> [batch * num_beams, len, hidden]`.
    fn expand_hidden(&self, hidden: ArrayView3<f32>, num_beams: usize) -> Result<Array3<f32>>;

    /// Gathers rows by parent index: output row `i` is `src[parents[i]]`.
    fn gather_rows_u32(&self, src: ArrayView2<u32>, parents: &[usize]) -> Result<Array2<u32>>;

    fn gather_rows_f32(&self, src: ArrayView2<f32>, parents: &[usize]) -> Result<Array2<f32>>;

    /// Moves logits to host memory for scoring. The CPU implementation is
    /// a plain copy; accelerator backends issue a device-to-host transfer.
    fn copy_to_host(&self, logits: ArrayView2<f32>) -> Result<Array2<f32>>;
}

/// Reference implementation backed by ndarray on the host.
#[derive(Clone, Copy, Debug, Default)]
pub struct CpuCapabilities;

impl CpuCapabilities {
    fn check_parents(parents: &[usize], rows: usize) -> Result<()> {
        if let Some(&bad) = parents.iter().find(|&&p| p >= rows) {
            anyhow::bail!("parent index {} out of bounds for {} rows", bad, rows);
        }
        Ok(())
    }
}

impl DeviceCapabilities for CpuCapabilities {
    fn top_k(&self, scores: ArrayView1<f32>, k: usize) -> Result<TopK> {
        let k = k.min(scores.len());
        let mut order: Vec<usize> = (0..scores.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
        order.truncate(k);
        Ok(TopK {
            values: order.iter().map(|&i| scores[i]).collect(),
            indices: order,
        })
    }

    fn process_logits(
        &self,
        raw_logits: ArrayView2<f32>,
        state: &StepState<'_>,
        config: &SearchConfig,
    ) -> SearchResult<Array2<f32>> {
        LogitsProcessor::new(config).process(raw_logits, state)
    }

    fn expand_tokens(&self, tokens: ArrayView2<u32>, num_beams: usize) -> Result<Array2<u32>> {
        let (batch, n) = tokens.dim();
        let mut out = Array2::zeros((batch * num_beams, n));
        for b in 0..batch {
            for beam in 0..num_beams {
                out.row_mut(b * num_beams + beam).assign(&tokens.row(b));
            }
        }
        Ok(out)
    }

    fn expand_mask(&self, mask: ArrayView2<f32>, num_beams: usize) -> Result<Array2<f32>> {
        let (batch, n) = mask.dim();
        let mut out = Array2::zeros((batch * num_beams, n));
        for b in 0..batch {
            for beam in 0..num_beams {
                out.row_mut(b * num_beams + beam).assign(&mask.row(b));
            }
        }
        Ok(out)
    }

    fn expand_hidden(&self, hidden: ArrayView3<f32>, num_beams: usize) -> Result<Array3<f32>> {
        let (batch, len, dim) = hidden.dim();
        let mut out = Array3::zeros((batch * num_beams, len, dim));
        for b in 0..batch {
            for beam in 0..num_beams {
                out.slice_mut(s![b * num_beams + beam, .., ..])
                    .assign(&hidden.slice(s![b, .., ..]));
            }
        }
        Ok(out)
    }

    fn gather_rows_u32(&self, src: ArrayView2<u32>, parents: &[usize]) -> Result<Array2<u32>> {
        Self::check_parents(parents, src.nrows())?;
        let mut out = Array2::zeros((parents.len(), src.ncols()));
        for (dst, &parent) in parents.iter().enumerate() {
            out.row_mut(dst).assign(&src.row(parent));
        }
        Ok(out)
    }

    fn gather_rows_f32(&self, src: ArrayView2<f32>, parents: &[usize]) -> Result<Array2<f32>> {
        Self::check_parents(parents, src.nrows())?;
        let mut out = Array2::zeros((parents.len(), src.ncols()));
        for (dst, &parent) in parents.iter().enumerate() {
            out.row_mut(dst).assign(&src.row(parent));
        }
        Ok(out)
    }

    fn copy_to_host(&self, logits: ArrayView2<f32>) -> Result<Array2<f32>> {
        Ok(logits.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::array;

    use super::*;

    #[test]
    fn test_top_k_orders_descending() {
        let caps = CpuCapabilities;
        let scores = array![-2.0_f32, -1.0, -3.0, -0.5, -4.0];
        let top = caps.top_k(scores.view(), 3).unwrap();
        assert_eq!(top.indices, vec![3, 1, 0]);
        assert_relative_eq!(top.values[0], -0.5);
    }

    #[test]
    fn test_top_k_tie_breaks_by_lower_index() {
        let caps = CpuCapabilities;
        let scores = array![1.0_f32, 5.0, 5.0, 1.0];
        let top = caps.top_k(scores.view(), 3).unwrap();
        assert_eq!(top.indices, vec![1, 2, 0]);
    }

    #[test]
    fn test_top_k_clamps_to_len() {
        let caps = CpuCapabilities;
        let scores = array![1.0_f32, 2.0];
        let top = caps.top_k(scores.view(), 10).unwrap();
        assert_eq!(top.indices.len(), 2);
    }

    #[test]
    fn test_expand_tokens_replicates_rows() {
        let caps = CpuCapabilities;
        let tokens = array![[1_u32, 2], [3, 4]];
        let out = caps.expand_tokens(tokens.view(), 2).unwrap();
        assert_eq!(out.dim(), (4, 2));
        assert_eq!(out.row(0), out.row(1));
        assert_eq!(out.row(2).to_vec(), vec![3, 4]);
    }

    #[test]
    fn test_expand_hidden_replicates_batch_items() {
        let caps = CpuCapabilities;
        let mut hidden = Array3::zeros((2, 3, 4));
        hidden[[1, 0, 0]] = 7.0;
        let out = caps.expand_hidden(hidden.view(), 3).unwrap();
        assert_eq!(out.dim(), (6, 3, 4));
        assert_eq!(out[[3, 0, 0]], 7.0);
        assert_eq!(out[[5, 0, 0]], 7.0);
        assert_eq!(out[[0, 0, 0]], 0.0);
    }

    #[test]
    fn test_gather_rows_by_parent() {
        let caps = CpuCapabilities;
        let src = array![[0_u32], [1], [2], [3]];
        let out = caps.gather_rows_u32(src.view(), &[2, 2, 0, 1]).unwrap();
        assert_eq!(
            out.column(0).to_vec(),
            vec![2, 2, 0, 1]
        );
    }

    #[test]
    fn test_gather_rejects_out_of_bounds_parent() {
        let caps = CpuCapabilities;
        let src = array![[0.0_f32], [1.0]];
        assert!(caps.gather_rows_f32(src.view(), &[0, 5]).is_err());
    }

    #[test]
    fn test_copy_to_host_is_identity_on_cpu() {
        let caps = CpuCapabilities;
        let logits = array![[1.0_f32, 2.0]];
        let copied = caps.copy_to_host(logits.view()).unwrap();
        assert_eq!(copied, logits);
    }
}
