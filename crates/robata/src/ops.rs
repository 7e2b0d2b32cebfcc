//! Op-style entry points: per-operator configuration plus thin submit
//! functions that look up or create the shared resource for a
//! `(container, shared_name)` pair, mint batch keys, and hand back
//! awaitable items. This is the boundary the surrounding invocation shell
//! would call into; tensor marshalling stays on the caller's side.

use std::sync::Arc;

use crate::backend::Backend;
use crate::batch::{
    BatchFunction, BatchIndex, BatchReply, BatchResource, BatchResourceOptions,
};
use crate::communication::Item;
use crate::error::BatchResult;
use crate::registry::ResourceRegistry;
use crate::unbatch::{UnbatchGradResource, UnbatchResource};

/// Metric label used when no model name was configured.
pub const MODEL_NAME_UNSET: &str = "model_name_unset";

/// Configuration attributes shared by the `Batch` and `BatchFunction`
/// operators.
#[derive(Debug, Clone)]
pub struct BatchOpConfig {
    pub container: String,
    /// Resource name; when empty the op's own name is used instead, so
    /// distinct unnamed ops do not collide.
    pub shared_name: String,
    /// Scheduler queue the op's inputs are routed to.
    pub batching_queue: String,
    pub num_batch_threads: usize,
    pub max_batch_size: usize,
    pub batch_timeout_micros: u64,
    pub max_enqueued_batches: usize,
    pub allowed_batch_sizes: Vec<usize>,
    /// Model name label for metrics.
    pub model_name: Option<String>,
}

impl Default for BatchOpConfig {
    fn default() -> Self {
        Self {
            container: String::new(),
            shared_name: String::new(),
            batching_queue: String::new(),
            num_batch_threads: 1,
            max_batch_size: 1,
            batch_timeout_micros: 0,
            max_enqueued_batches: 10,
            allowed_batch_sizes: Vec::new(),
            model_name: None,
        }
    }
}

/// Configuration for the `Unbatch` operator.
#[derive(Debug, Clone)]
pub struct UnbatchOpConfig {
    pub container: String,
    pub shared_name: String,
    pub timeout_micros: u64,
}

/// Configuration for the `UnbatchGrad` operator.
#[derive(Debug, Clone, Default)]
pub struct UnbatchGradOpConfig {
    pub container: String,
    pub shared_name: String,
}

fn effective_shared_name<'a>(shared_name: &'a str, op_name: &'a str) -> &'a str {
    if shared_name.is_empty() {
        op_name
    } else {
        shared_name
    }
}

fn model_name(config: &BatchOpConfig) -> String {
    config
        .model_name
        .clone()
        .unwrap_or_else(|| MODEL_NAME_UNSET.to_string())
}

fn resource_options(config: &BatchOpConfig, enable_large_batch_splitting: bool) -> BatchResourceOptions {
    BatchResourceOptions {
        num_batch_threads: config.num_batch_threads,
        max_batch_size: config.max_batch_size,
        batch_timeout_micros: config.batch_timeout_micros,
        max_enqueued_batches: config.max_enqueued_batches,
        allowed_batch_sizes: config.allowed_batch_sizes.clone(),
        enable_large_batch_splitting,
    }
}

/// Submit one invocation of the function-less `Batch` op. The reply carries
/// the concatenated tensors and index on the last call of each batch, empty
/// tensors on the others, and every caller's own batch key.
pub fn submit_batch<B: Backend>(
    registry: &ResourceRegistry,
    config: &BatchOpConfig,
    op_name: &str,
    in_tensors: Vec<B>,
) -> BatchResult<Item<BatchReply<B>>> {
    let resource = registry.lookup_or_create(
        &config.container,
        effective_shared_name(&config.shared_name, op_name),
        || BatchResource::<B>::new(resource_options(config, false), None, model_name(config)),
    )?;
    resource.register_input(rand::random(), in_tensors, Vec::new(), &config.batching_queue)
}

/// Submit one invocation of the `BatchFunction` op: outputs are the compute
/// function's outputs, scattered per caller.
pub fn submit_batch_function<B: Backend>(
    registry: &ResourceRegistry,
    config: &BatchOpConfig,
    function: Arc<dyn BatchFunction<B>>,
    enable_large_batch_splitting: bool,
    op_name: &str,
    in_tensors: Vec<B>,
    captured_tensors: Vec<B>,
) -> BatchResult<Item<BatchReply<B>>> {
    let resource = registry.lookup_or_create(
        &config.container,
        effective_shared_name(&config.shared_name, op_name),
        || {
            BatchResource::<B>::new(
                resource_options(config, enable_large_batch_splitting),
                Some(function),
                model_name(config),
            )
        },
    )?;
    resource.register_input(
        rand::random(),
        in_tensors,
        captured_tensors,
        &config.batching_queue,
    )
}

/// Submit one invocation of the `Unbatch` op.
pub fn submit_unbatch<B: Backend>(
    registry: &ResourceRegistry,
    config: &UnbatchOpConfig,
    op_name: &str,
    data: &B,
    batch_index: &BatchIndex,
    batch_key: u64,
) -> BatchResult<Item<B>> {
    let resource = registry.lookup_or_create(
        &config.container,
        effective_shared_name(&config.shared_name, op_name),
        || Ok(UnbatchResource::<B>::new(config.timeout_micros)),
    )?;
    Ok(resource.compute(data, batch_index, batch_key))
}

/// Submit one invocation of the `UnbatchGrad` op.
pub fn submit_unbatch_grad<B: Backend>(
    registry: &ResourceRegistry,
    config: &UnbatchGradOpConfig,
    op_name: &str,
    original_data: &B,
    batch_index: &BatchIndex,
    grad: &B,
    batch_key: u64,
) -> BatchResult<Item<B>> {
    let resource = registry.lookup_or_create(
        &config.container,
        effective_shared_name(&config.shared_name, op_name),
        || Ok(UnbatchGradResource::<B>::new()),
    )?;
    Ok(resource.compute(original_data, batch_index, grad, batch_key))
}
