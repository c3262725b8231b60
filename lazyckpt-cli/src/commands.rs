//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::Context;
use lazyckpt_core::collection::for_each_tensor;
use lazyckpt_core::strategy::DeviceMesh;
use lazyckpt_core::{LazyckptConfig, ModelParallelStrategy, Value, lazy_load_with};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::Path;

/// Handle a CLI subcommand, writing results to `out`.
pub fn handle_command(
    command: Commands,
    workspace: &Path,
    config: &LazyckptConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    match command {
        Commands::Inspect { path, json } => handle_inspect(&path, json, config, out),
        Commands::Materialize { path, prefix } => {
            handle_materialize(&path, prefix.as_deref(), config, out)
        }
        Commands::Attr { path, tensor, name } => handle_attr(&path, &tensor, &name, config, out),
        Commands::Mesh { nodes, devices } => handle_mesh(nodes, devices, config, out),
        Commands::Config { action } => handle_config(action, workspace, out),
    }
}

/// One row of `inspect` output.
#[derive(Debug, Serialize, PartialEq)]
struct TensorEntry {
    path: String,
    kind: &'static str,
    dtype: String,
    shape: Vec<usize>,
    parameter: bool,
    record: Option<String>,
}

fn entry(path: &str, value: &Value) -> Option<TensorEntry> {
    let path = path.to_string();
    match value {
        Value::Lazy(t) => Some(TensorEntry {
            path,
            kind: "lazy",
            dtype: t.dtype().to_string(),
            shape: t.shape().to_vec(),
            parameter: t.is_parameter(),
            record: Some(t.storage_key().record.clone()),
        }),
        Value::Tensor(t) => Some(TensorEntry {
            path,
            kind: "tensor",
            dtype: t.dtype().to_string(),
            shape: t.shape().to_vec(),
            parameter: t.is_parameter(),
            record: t.storage().key().map(|k| k.record.clone()),
        }),
        Value::Storage(s) => Some(TensorEntry {
            path,
            kind: "storage",
            dtype: s.dtype().to_string(),
            shape: vec![s.numel()],
            parameter: false,
            record: s.key().map(|k| k.record.clone()),
        }),
        _ => None,
    }
}

fn entries(root: &Value) -> Vec<TensorEntry> {
    let mut rows = Vec::new();
    for_each_tensor(root, &mut |path, value| rows.extend(entry(path, value)));
    rows
}

fn handle_inspect(
    path: &Path,
    json: bool,
    config: &LazyckptConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let root = lazy_load_with(path, &config.loader)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let rows = entries(&root);

    if json {
        let report = serde_json::json!({
            "path": path.display().to_string(),
            "tensors": rows,
            "placeholders": root.lazy_count(),
            "resident_bytes": root.resident_bytes(),
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
        return Ok(());
    }

    if rows.is_empty() {
        writeln!(out, "No tensors found in {}", path.display())?;
        return Ok(());
    }
    let width = rows.iter().map(|r| r.path.len()).max().unwrap_or(0);
    for row in &rows {
        let shape: Vec<String> = row.shape.iter().map(usize::to_string).collect();
        writeln!(
            out,
            "{:<width$}  {:<8} {:<10} [{}]{}",
            row.path,
            row.kind,
            row.dtype,
            shape.join(", "),
            if row.parameter { "  param" } else { "" },
        )?;
    }
    writeln!(
        out,
        "{} tensors, {} bytes resident",
        rows.len(),
        root.resident_bytes()
    )?;
    Ok(())
}

fn digest(value: &Value) -> anyhow::Result<Option<String>> {
    let bytes = match value {
        Value::Lazy(t) => t.materialize()?.to_le_bytes()?,
        Value::Tensor(t) if t.is_meta() => return Ok(None),
        Value::Tensor(t) => t.to_le_bytes()?,
        Value::Storage(s) => match s.bytes() {
            Some(b) => b.to_vec(),
            None => return Ok(None),
        },
        _ => return Ok(None),
    };
    let hash = Sha256::digest(&bytes);
    Ok(Some(hash.iter().map(|b| format!("{b:02x}")).collect()))
}

fn handle_materialize(
    path: &Path,
    prefix: Option<&str>,
    config: &LazyckptConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let root = lazy_load_with(path, &config.loader)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let mut selected = Vec::new();
    for_each_tensor(&root, &mut |p, value| {
        if prefix.is_none_or(|pre| p.starts_with(pre)) {
            selected.push((p.to_string(), value.clone()));
        }
    });

    let mut count = 0;
    for (p, value) in &selected {
        match digest(value).with_context(|| format!("Failed to materialize {p}"))? {
            Some(hex) => {
                writeln!(out, "{hex}  {p}")?;
                count += 1;
            }
            None => writeln!(out, "{:<64}  {p}", "(meta)")?,
        }
    }
    tracing::info!(path = %path.display(), count, "Materialized tensors");
    Ok(())
}

fn handle_attr(
    path: &Path,
    tensor: &str,
    name: &str,
    config: &LazyckptConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let root = lazy_load_with(path, &config.loader)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let mut found = None;
    for_each_tensor(&root, &mut |p, value| {
        if found.is_none() && p == tensor {
            found = Some(value.clone());
        }
    });
    let value = found.with_context(|| format!("No tensor at '{tensor}'"))?;
    let Value::Lazy(lazy) = value else {
        anyhow::bail!("'{tensor}' is a {}, not a lazily loaded tensor", value.type_name());
    };
    writeln!(out, "{}", lazy.attribute(name)?)?;
    Ok(())
}

fn handle_mesh(
    nodes: usize,
    devices: usize,
    config: &LazyckptConfig,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let strategy = ModelParallelStrategy::new(config.strategy.clone()).with_layout(nodes, devices);
    let (dp, tp) = strategy.mesh_sizes();
    let world_size = strategy
        .num_nodes()
        .checked_mul(strategy.num_processes())
        .with_context(|| format!("{nodes} nodes with {devices} devices each overflows the world size"))?;
    let mesh = DeviceMesh::data_tensor_parallel("cpu", dp, tp, world_size)?;

    writeln!(
        out,
        "data_parallel={dp} tensor_parallel={tp} world_size={world_size} backend={}",
        strategy.process_group_backend()
    )?;
    for rank in 0..mesh.size() {
        if let Some(coord) = mesh.coordinate(rank) {
            writeln!(out, "rank {rank:>3}: dp={} tp={}", coord[0], coord[1])?;
        }
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path, out: &mut impl Write) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".lazyckpt");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                writeln!(
                    out,
                    "Configuration file already exists at: {}",
                    config_path.display()
                )?;
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&LazyckptConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            writeln!(out, "Created default configuration at: {}", config_path.display())?;
            Ok(())
        }
        ConfigAction::Show => {
            let config = lazyckpt_core::load_config(Some(workspace), None)?;
            writeln!(out, "{}", toml::to_string_pretty(&config)?)?;
            Ok(())
        }
    }
}
