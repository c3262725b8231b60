//! Setup path of a data-parallel x tensor-parallel training strategy.
//!
//! Covers mesh validation, process group initialization through a
//! [`ProcessGroup`] collaborator, guarded accessors and meta-device
//! materialization of the module tree. Sharding itself is left to the
//! module's `configure_model` hook.

mod mesh;
mod module;

pub use mesh::{
    ClusterEnvironment, DATA_PARALLEL, DeviceMesh, LocalProcessGroup, ProcessGroup,
    StaticEnvironment, TENSOR_PARALLEL,
};
pub use module::{
    Linear, MaterializeReport, Module, Sequential, for_each_module_mut, has_meta_tensors,
    materialize_meta_tensors, modules,
};

use crate::checkpoint::{lazy_load_with, materialize_all, save_with};
use crate::config::{LoaderConfig, MeshSize, StrategyConfig};
use crate::error::StrategyError;
use crate::pickle::Value;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::path::Path;
use tracing::{debug, info};

/// Device family the strategy runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    #[default]
    Cpu,
    Cuda,
}

impl Accelerator {
    pub fn device_type(self) -> &'static str {
        match self {
            Accelerator::Cpu => "cpu",
            Accelerator::Cuda => "cuda",
        }
    }

    pub fn process_group_backend(self) -> &'static str {
        match self {
            Accelerator::Cpu => "gloo",
            Accelerator::Cuda => "nccl",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelParallelStrategy {
    config: StrategyConfig,
    loader: LoaderConfig,
    accelerator: Accelerator,
    num_nodes: usize,
    devices_per_node: usize,
    device_mesh: Option<DeviceMesh>,
}

impl Default for ModelParallelStrategy {
    fn default() -> Self {
        Self::new(StrategyConfig::default())
    }
}

impl ModelParallelStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            loader: LoaderConfig::default(),
            accelerator: Accelerator::Cpu,
            num_nodes: 1,
            devices_per_node: 1,
            device_mesh: None,
        }
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_accelerator(mut self, accelerator: Accelerator) -> Self {
        self.accelerator = accelerator;
        self
    }

    /// Number of nodes and of parallel devices on each node.
    pub fn with_layout(mut self, num_nodes: usize, devices_per_node: usize) -> Self {
        self.num_nodes = num_nodes.max(1);
        self.devices_per_node = devices_per_node.max(1);
        self
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_processes(&self) -> usize {
        self.devices_per_node
    }

    pub fn process_group_backend(&self) -> &'static str {
        self.accelerator.process_group_backend()
    }

    /// `(data_parallel, tensor_parallel)` with `Auto` resolved to
    /// (number of nodes, devices per node).
    pub fn mesh_sizes(&self) -> (usize, usize) {
        let dp = match self.config.data_parallel_size {
            MeshSize::Auto => self.num_nodes,
            MeshSize::Fixed(n) => n,
        };
        let tp = match self.config.tensor_parallel_size {
            MeshSize::Auto => self.devices_per_node,
            MeshSize::Fixed(n) => n,
        };
        (dp, tp)
    }

    pub fn device_mesh(&self) -> Result<&DeviceMesh, StrategyError> {
        self.device_mesh.as_ref().ok_or(StrategyError::MeshNotInitialized)
    }

    /// Validate the mesh against the cluster, initialize the process group
    /// and build the device mesh.
    pub fn setup_environment(
        &mut self,
        cluster: &dyn ClusterEnvironment,
        process_group: &mut dyn ProcessGroup,
    ) -> Result<(), StrategyError> {
        let (dp, tp) = self.mesh_sizes();
        let world_size = cluster.world_size();
        let mesh = DeviceMesh::data_tensor_parallel(self.accelerator.device_type(), dp, tp, world_size)?;

        if process_group.is_initialized() {
            debug!("Process group already initialized");
        } else {
            let backend = self.process_group_backend();
            info!(
                backend,
                global_rank = cluster.global_rank(),
                world_size,
                timeout_secs = self.config.timeout_secs,
                "Initializing process group"
            );
            process_group.init(
                backend,
                cluster.global_rank(),
                world_size,
                self.config.timeout(),
            )?;
        }

        info!(data_parallel = dp, tensor_parallel = tp, "Device mesh ready");
        self.device_mesh = Some(mesh);
        Ok(())
    }

    pub fn checkpoint_io(&self) -> Result<Infallible, StrategyError> {
        Err(StrategyError::CheckpointIoUnused)
    }

    pub fn set_checkpoint_io<T>(&mut self, _plugin: T) -> Result<(), StrategyError> {
        Err(StrategyError::CheckpointIoUnsupported)
    }

    /// Prepare `module` for training: run its `configure_model` hook and
    /// allocate any tensors still on the meta device.
    pub fn setup(&mut self, module: &mut dyn Module) -> Result<MaterializeReport, StrategyError> {
        if !module.has_configure_model() {
            return Err(StrategyError::ConfigureModelRequired(
                module.type_name().to_string(),
            ));
        }
        let legacy: Vec<&str> = modules(module)
            .into_iter()
            .filter(|m| m.is_legacy_fsdp())
            .map(|m| m.type_name())
            .collect();
        if !legacy.is_empty() {
            return Err(StrategyError::LegacyFsdpModule(legacy.join(", ")));
        }

        module.configure_model()?;
        let report = materialize_meta_tensors(module)?;
        debug!(
            reset = report.reset.len(),
            uninitialized = report.uninitialized.len(),
            "Module setup complete"
        );
        Ok(report)
    }

    /// Write `checkpoint` to `path`. Storage options are not supported.
    pub fn save_checkpoint(
        &self,
        checkpoint: &Value,
        path: impl AsRef<Path>,
        storage_options: Option<&Value>,
    ) -> Result<(), StrategyError> {
        if storage_options.is_some() {
            return Err(StrategyError::StorageOptionsUnsupported);
        }
        save_with(checkpoint, path, &self.loader)?;
        Ok(())
    }

    /// Read a checkpoint and materialize every tensor in it.
    pub fn load_checkpoint(&self, path: impl AsRef<Path>) -> Result<Value, StrategyError> {
        let lazy = lazy_load_with(path, &self.loader)?;
        Ok(materialize_all(lazy)?)
    }
}
