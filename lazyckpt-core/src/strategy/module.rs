//! Module tree interface and meta-device materialization.

use crate::dtype::DType;
use crate::error::CheckpointError;
use crate::tensor::Tensor;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A node of a model: owns parameters and buffers, and may have children.
///
/// Hooks a module does not define report so through the `has_*` methods,
/// the way an optional method on a Python module would be absent.
pub trait Module {
    /// Class name used in diagnostics.
    fn type_name(&self) -> &str;

    /// Parameters and buffers owned directly by this module.
    fn tensors(&self) -> Vec<&Tensor>;

    fn tensors_mut(&mut self) -> Vec<&mut Tensor>;

    fn children(&self) -> Vec<&dyn Module> {
        Vec::new()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        Vec::new()
    }

    fn has_reset_parameters(&self) -> bool {
        false
    }

    /// Re-initialize owned tensors. Only called when `has_reset_parameters` is true.
    fn reset_parameters(&mut self) -> Result<(), CheckpointError> {
        Ok(())
    }

    fn has_configure_model(&self) -> bool {
        false
    }

    /// Build or parallelize layers. Only called when `has_configure_model` is true.
    fn configure_model(&mut self) -> Result<(), CheckpointError> {
        Ok(())
    }

    /// Whether this module is wrapped with the legacy fully-sharded API.
    fn is_legacy_fsdp(&self) -> bool {
        false
    }
}

/// Every module in the tree, depth first, root included.
pub fn modules(root: &dyn Module) -> Vec<&dyn Module> {
    let mut out = vec![root];
    for child in root.children() {
        out.extend(modules(child));
    }
    out
}

/// Visit every module in the tree mutably, depth first, root included.
pub fn for_each_module_mut(root: &mut dyn Module, f: &mut dyn FnMut(&mut dyn Module)) {
    f(&mut *root);
    for child in root.children_mut() {
        for_each_module_mut(child, f);
    }
}

pub fn has_meta_tensors(root: &dyn Module) -> bool {
    modules(root)
        .iter()
        .any(|m| m.tensors().iter().any(|t| t.is_meta()))
}

/// Outcome of [`materialize_meta_tensors`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Modules whose tensors were allocated and re-initialized.
    pub reset: Vec<String>,
    /// Types whose tensors were allocated but left uninitialized.
    pub uninitialized: BTreeSet<String>,
}

impl MaterializeReport {
    pub fn is_complete(&self) -> bool {
        self.uninitialized.is_empty()
    }
}

/// Allocate every meta tensor in the tree and run `reset_parameters` on
/// the modules that own them.
///
/// Modules without the hook keep zeroed memory and are listed in the report
/// and in a warning.
pub fn materialize_meta_tensors(root: &mut dyn Module) -> Result<MaterializeReport, CheckpointError> {
    let mut report = MaterializeReport::default();
    if !has_meta_tensors(root) {
        return Ok(report);
    }

    let mut failure = None;
    for_each_module_mut(root, &mut |module: &mut dyn Module| {
        if failure.is_some() || !module.tensors().iter().any(|t| t.is_meta()) {
            return;
        }
        for t in module.tensors_mut() {
            t.to_empty();
        }
        if module.has_reset_parameters() {
            debug!(module = module.type_name(), "Re-initializing materialized module");
            if let Err(e) = module.reset_parameters() {
                failure = Some(e);
                return;
            }
            report.reset.push(module.type_name().to_string());
        } else {
            report.uninitialized.insert(module.type_name().to_string());
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }

    if !report.uninitialized.is_empty() {
        let names: Vec<&str> = report.uninitialized.iter().map(String::as_str).collect();
        warn!(
            "Parameter initialization incomplete. The following modules have parameters or buffers with uninitialized memory because they don't define a `reset_parameters()` method for re-initialization: {}",
            names.join(", ")
        );
    }
    Ok(report)
}

/// Fully connected layer: `weight` of shape (out, in) and `bias` of shape (out,).
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Result<Self, CheckpointError> {
        let mut layer = Self::meta(in_features, out_features);
        layer.weight.to_empty();
        layer.bias.to_empty();
        layer.reset_parameters()?;
        Ok(layer)
    }

    /// Layer whose tensors live on the meta device.
    pub fn meta(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Tensor::meta(DType::F32, vec![out_features, in_features]).into_parameter(true),
            bias: Tensor::meta(DType::F32, vec![out_features]).into_parameter(true),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }
}

impl Module for Linear {
    fn type_name(&self) -> &str {
        "Linear"
    }

    fn tensors(&self) -> Vec<&Tensor> {
        vec![&self.weight, &self.bias]
    }

    fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        vec![&mut self.weight, &mut self.bias]
    }

    fn has_reset_parameters(&self) -> bool {
        true
    }

    /// Constant `1/sqrt(in_features)` weights and zero bias.
    fn reset_parameters(&mut self) -> Result<(), CheckpointError> {
        let bound = 1.0 / (self.in_features().max(1) as f64).sqrt();
        self.weight.fill(bound)?;
        self.bias.fill(0.0)
    }
}

/// Parameterless container running its children in order.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Module> {
        self.layers.get(index).map(|m| m.as_ref())
    }
}

impl Module for Sequential {
    fn type_name(&self) -> &str {
        "Sequential"
    }

    fn tensors(&self) -> Vec<&Tensor> {
        Vec::new()
    }

    fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        Vec::new()
    }

    fn children(&self) -> Vec<&dyn Module> {
        self.layers.iter().map(|m| m.as_ref()).collect()
    }

    fn children_mut(&mut self) -> Vec<&mut dyn Module> {
        self.layers.iter_mut().map(|m| m.as_mut() as &mut dyn Module).collect()
    }
}
