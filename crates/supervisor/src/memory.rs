//! GPU memory estimation for a model load.
//!
//! Before launching a runner, the supervisor sizes the load: per-layer
//! weight and KV cache requirements against each GPU's free memory, a
//! greedy layer placement, and a CPU fallback when not even one layer
//! fits. The estimate is computed once and never changes for the lifetime
//! of the runner.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tokenloom_common::RunnerSettings;

/// Model geometry the estimate needs, pre-parsed by the model store.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub name: String,

    /// Weight payload size on disk.
    pub file_size: u64,

    /// Transformer block count, excluding the output layer.
    pub block_count: u32,

    pub embedding_length: u32,
    pub head_count: u32,
    pub head_count_kv: u32,

    /// Vision projector payload, zero when absent.
    pub projector_size: u64,
}

/// One GPU as reported by the inventory layer.
#[derive(Debug, Clone)]
pub struct GpuDevice {
    pub id: String,

    /// Backend library: "cuda", "rocm", "metal".
    pub library: String,

    pub compute_major: u32,
    pub compute_minor: u32,

    pub total_memory: u64,
    pub free_memory: u64,

    /// Floor the driver needs regardless of our allocations.
    pub minimum_memory: u64,
}

/// Bytes planned onto one GPU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuAllocation {
    pub id: String,
    pub size: u64,
    pub layers: u32,
}

/// The immutable sizing decision for one model load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEstimate {
    /// Layers offloaded to GPUs, output layer included.
    pub layers: u32,

    pub gpu_allocations: Vec<GpuAllocation>,

    /// Total bytes placed on GPUs.
    pub vram_size: u64,

    /// Full footprint of the load, host memory included.
    pub total_size: u64,

    /// Per-GPU proportions for the runner's tensor-split flag. Empty for
    /// zero or one GPU.
    pub tensor_split: Vec<f32>,

    pub fully_offloaded: bool,
}

impl MemoryEstimate {
    pub fn cpu_only(&self) -> bool {
        self.layers == 0
    }
}

/// Size the load and place layers onto GPUs.
///
/// Weights are treated as uniform across blocks (the output layer counts
/// as one more). KV cost per layer follows the attention geometry at f16.
/// The compute graph overhead lands on the GPU carrying the first layer.
pub fn estimate_gpu_layers(
    meta: &ModelMetadata,
    gpus: &[GpuDevice],
    settings: &RunnerSettings,
    overhead: u64,
) -> MemoryEstimate {
    let total_layers = meta.block_count + 1;

    let layer_weight = meta.file_size / u64::from(total_layers);
    let head_dim = if meta.head_count > 0 {
        meta.embedding_length / meta.head_count
    } else {
        meta.embedding_length
    };
    // K and V, f16, per resident position.
    let kv_per_layer =
        2 * settings.ctx_size as u64 * u64::from(head_dim) * u64::from(meta.head_count_kv) * 2;
    let layer_size = layer_weight + kv_per_layer;

    // Scratch for one forward pass over a full batch.
    let graph_size = settings.batch_size as u64 * u64::from(meta.embedding_length) * 8;

    let requested = if settings.n_gpu_layers < 0 {
        total_layers
    } else {
        (settings.n_gpu_layers as u32).min(total_layers)
    };

    let mut budgets: Vec<u64> = gpus
        .iter()
        .map(|g| {
            g.free_memory
                .saturating_sub(g.minimum_memory)
                .saturating_sub(overhead)
        })
        .collect();
    let mut placed: Vec<(u64, u32)> = vec![(0, 0); gpus.len()];

    let mut layers = 0;
    for layer in 0..requested {
        // First layer also carries the graph and any projector.
        let mut need = layer_size;
        if layer == 0 {
            need += graph_size + meta.projector_size;
        }

        let best = budgets
            .iter()
            .enumerate()
            .filter(|(_, &b)| b >= need)
            .max_by_key(|(_, &b)| b)
            .map(|(i, _)| i);

        match best {
            Some(i) => {
                budgets[i] -= need;
                placed[i].0 += need;
                placed[i].1 += 1;
                layers += 1;
            }
            None => break,
        }
    }

    let gpu_allocations: Vec<GpuAllocation> = gpus
        .iter()
        .zip(placed.iter())
        .filter(|(_, &(size, _))| size > 0)
        .map(|(g, &(size, n))| GpuAllocation {
            id: g.id.clone(),
            size,
            layers: n,
        })
        .collect();

    let vram_size: u64 = gpu_allocations.iter().map(|a| a.size).sum();
    let total_size =
        u64::from(total_layers) * layer_size + graph_size + meta.projector_size;

    let tensor_split = if gpu_allocations.len() > 1 {
        gpu_allocations
            .iter()
            .map(|a| a.layers as f32 / layers as f32)
            .collect()
    } else {
        Vec::new()
    };

    let estimate = MemoryEstimate {
        layers,
        gpu_allocations,
        vram_size,
        total_size,
        tensor_split,
        fully_offloaded: layers == total_layers,
    };

    if estimate.cpu_only() {
        info!(model = %meta.name, "no layers fit in VRAM, falling back to CPU");
    } else {
        debug!(
            model = %meta.name,
            layers = estimate.layers,
            vram = estimate.vram_size,
            total = estimate.total_size,
            "memory estimate"
        );
    }

    estimate
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ModelMetadata {
        ModelMetadata {
            name: "test-7b".to_string(),
            file_size: 32 * 1024 * 1024, // 1 MiB per layer with 31 blocks
            block_count: 31,
            embedding_length: 4096,
            head_count: 32,
            head_count_kv: 8,
            projector_size: 0,
        }
    }

    fn gpu(id: &str, free: u64) -> GpuDevice {
        GpuDevice {
            id: id.to_string(),
            library: "cuda".to_string(),
            compute_major: 8,
            compute_minor: 6,
            total_memory: free,
            free_memory: free,
            minimum_memory: 0,
        }
    }

    fn settings() -> RunnerSettings {
        RunnerSettings {
            ctx_size: 2048,
            batch_size: 512,
            n_gpu_layers: -1,
            ..Default::default()
        }
    }

    #[test]
    fn everything_fits_on_a_big_gpu() {
        let estimate =
            estimate_gpu_layers(&meta(), &[gpu("gpu0", 64 * 1024 * 1024 * 1024)], &settings(), 0);

        assert_eq!(estimate.layers, 32);
        assert!(estimate.fully_offloaded);
        assert_eq!(estimate.gpu_allocations.len(), 1);
        assert_eq!(estimate.vram_size, estimate.total_size);
        assert!(estimate.tensor_split.is_empty());
    }

    #[test]
    fn partial_offload_on_a_small_gpu() {
        // Room for only a handful of layers.
        let small = 40 * 1024 * 1024;
        let estimate = estimate_gpu_layers(&meta(), &[gpu("gpu0", small)], &settings(), 0);

        assert!(estimate.layers > 0);
        assert!(estimate.layers < 32);
        assert!(!estimate.fully_offloaded);
        assert!(estimate.vram_size <= small);
        assert!(estimate.total_size > estimate.vram_size);
    }

    #[test]
    fn cpu_fallback_when_nothing_fits() {
        let estimate = estimate_gpu_layers(&meta(), &[gpu("gpu0", 1024)], &settings(), 0);

        assert!(estimate.cpu_only());
        assert!(estimate.gpu_allocations.is_empty());
        assert_eq!(estimate.vram_size, 0);
        assert!(estimate.total_size > 0);
    }

    #[test]
    fn no_gpus_means_cpu_only() {
        let estimate = estimate_gpu_layers(&meta(), &[], &settings(), 0);
        assert!(estimate.cpu_only());
    }

    #[test]
    fn respects_requested_layer_count() {
        let mut s = settings();
        s.n_gpu_layers = 4;
        let estimate =
            estimate_gpu_layers(&meta(), &[gpu("gpu0", 64 * 1024 * 1024 * 1024)], &s, 0);

        assert_eq!(estimate.layers, 4);
        assert!(!estimate.fully_offloaded);
    }

    #[test]
    fn splits_across_two_gpus() {
        let big = 64 * 1024 * 1024 * 1024u64;
        let estimate = estimate_gpu_layers(
            &meta(),
            &[gpu("gpu0", big), gpu("gpu1", big)],
            &settings(),
            0,
        );

        assert!(estimate.fully_offloaded);
        assert_eq!(estimate.gpu_allocations.len(), 2);
        assert_eq!(estimate.tensor_split.len(), 2);
        let sum: f32 = estimate.tensor_split.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn driver_minimum_shrinks_the_budget() {
        let mut g = gpu("gpu0", 10 * 1024 * 1024);
        g.minimum_memory = 10 * 1024 * 1024 - 1024;
        let estimate = estimate_gpu_layers(&meta(), &[g], &settings(), 0);
        assert!(estimate.cpu_only());
    }
}
