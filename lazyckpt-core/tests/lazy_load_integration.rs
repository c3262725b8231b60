//! Integration tests for lazy checkpoint loading.
//!
//! Archives are written either through `save` or by hand in the exact byte
//! layout `torch.save` produces, then read back lazily and eagerly.

use lazyckpt_core::archive::ArchiveWriter;
use lazyckpt_core::lazy::dispatch::{self, TensorOperand};
use lazyckpt_core::pickle::MAX_NESTING;
use lazyckpt_core::lazy::{Deferred, Transform};
use lazyckpt_core::{
    CheckpointError, DType, LoaderConfig, Symbol, Tensor, TensorAttr, Value, lazy_load,
    lazy_load_with, load, materialize_all, save,
};
use pretty_assertions::assert_eq;
use std::path::PathBuf;
use tempfile::TempDir;

fn weight() -> Tensor {
    let values: Vec<f64> = (0..16).map(f64::from).collect();
    Tensor::from_values(DType::F32, vec![4, 4], &values)
        .unwrap()
        .into_parameter(true)
}

fn buffer() -> Tensor {
    Tensor::from_values(DType::F32, vec![2], &[0.25, -1.5]).unwrap()
}

fn checkpoint() -> Value {
    Value::dict([
        (
            "state_dict",
            Value::dict([("layer.weight", weight().into()), ("buffer", buffer().into())]),
        ),
        ("epoch", Value::Int(3)),
    ])
}

fn write(dir: &TempDir, value: &Value) -> PathBuf {
    let path = dir.path().join("model.ckpt");
    save(value, &path).unwrap();
    path
}

#[test]
fn test_end_to_end_parameter_and_buffer() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());

    let loaded = lazy_load(&path).unwrap();
    assert_eq!(loaded.resident_bytes(), 0);
    assert_eq!(loaded.lazy_count(), 2);

    let w = loaded.lookup("state_dict.layer.weight").unwrap().as_lazy().unwrap();
    let b = loaded.lookup("state_dict.buffer").unwrap().as_lazy().unwrap();
    assert_eq!(w.shape(), &[4, 4]);
    assert_eq!(b.shape(), &[2]);
    assert!(w.is_parameter());
    assert!(w.requires_grad());
    assert!(!b.is_parameter());
    assert_eq!(w.archive().storage_reads(), 0);

    let materialized = materialize_all(loaded).unwrap();
    assert_eq!(materialized.lazy_count(), 0);
    assert_eq!(materialized, checkpoint());
    assert_eq!(materialized.resident_bytes(), 16 * 4 + 2 * 4);
}

#[test]
fn test_metadata_unchanged_by_materialization() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());
    let loaded = lazy_load(&path).unwrap();
    let w = loaded.lookup("state_dict.layer.weight").unwrap().as_lazy().unwrap();

    let t = w.materialize().unwrap();
    assert_eq!(t.shape(), w.shape());
    assert_eq!(t.stride(), w.stride());
    assert_eq!(t.dtype(), w.dtype());
    assert_eq!(t.requires_grad(), w.requires_grad());
    assert!(!t.is_meta());
}

#[test]
fn test_each_materialization_reads_once_and_agrees() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());
    let loaded = lazy_load(&path).unwrap();
    let w = loaded.lookup("state_dict.layer.weight").unwrap().as_lazy().unwrap();

    let first = w.materialize().unwrap();
    assert_eq!(w.archive().storage_reads(), 1);
    let second = w.materialize().unwrap();
    assert_eq!(w.archive().storage_reads(), 2);
    assert_eq!(first, second);
    assert_eq!(first.to_f64_vec().unwrap(), (0..16).map(f64::from).collect::<Vec<_>>());
}

#[test]
fn test_typed_parameter_matches_eager_load() {
    let dir = TempDir::new().unwrap();
    let class = Symbol::new("quant.tensor", "Int8Tensor");
    let typed = Tensor::from_values(DType::I8, vec![3], &[-2.0, 0.0, 7.0])
        .unwrap()
        .into_subclass(class.clone(), Value::dict([("scale", Value::Float(0.5))]))
        .into_parameter(false);
    let path = write(&dir, &Value::dict([("q", typed.clone().into())]));

    let loaded = lazy_load(&path).unwrap();
    let lazy = loaded.get("q").unwrap().as_lazy().unwrap();
    assert!(lazy.is_parameter());
    assert!(!lazy.requires_grad());
    let steps = lazy.deferred().transforms();
    assert_eq!(steps.len(), 2);
    assert!(matches!(steps[0], Transform::FromType { class: c, .. } if *c == class));
    assert!(matches!(steps[1], Transform::Parameter { requires_grad: false, .. }));

    let materialized = lazy.materialize().unwrap();
    assert!(materialized.is_parameter());
    assert_eq!(materialized.subclass().unwrap().class, class);
    assert_eq!(materialized, typed);

    let eager = load(&path).unwrap();
    assert_eq!(eager.get("q").unwrap().as_tensor().unwrap(), &materialized);
}

#[test]
fn test_lazy_equals_eager_for_whole_graph() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());
    let eager = load(&path).unwrap();
    assert_eq!(eager.lazy_count(), 0);
    assert_eq!(materialize_all(lazy_load(&path).unwrap()).unwrap(), eager);
}

#[test]
fn test_attribute_allow_list() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());
    let loaded = lazy_load(&path).unwrap();
    let w = loaded.lookup("state_dict.layer.weight").unwrap().as_lazy().unwrap();

    assert_eq!(w.attribute("shape").unwrap(), TensorAttr::Dims(vec![4, 4]));
    assert_eq!(w.attribute("dtype").unwrap(), TensorAttr::DType(DType::F32));
    assert_eq!(w.attribute("grad").unwrap(), TensorAttr::None);
    assert_eq!(w.attribute("layout").unwrap().to_string(), "torch.strided");
    assert_eq!(w.attribute("size").unwrap().to_string(), "torch.Size([4, 4])");
    assert_eq!(w.archive().storage_reads(), 0);

    let err = w.attribute("tolist").unwrap_err();
    assert!(matches!(err, CheckpointError::AttributeNotFound { .. }));
    assert_eq!(err.to_string(), "LazyTensor does not have tolist");

    let TensorAttr::Tensor(t) = w.attribute("contiguous").unwrap() else {
        panic!("contiguous should materialize");
    };
    assert!(t.is_contiguous());
    assert_eq!(w.archive().storage_reads(), 1);
}

#[test]
fn test_shared_storage_views() {
    let dir = TempDir::new().unwrap();
    let base = Tensor::from_values(DType::F64, vec![6], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let view = Tensor::from_storage(base.storage().clone(), 1, vec![2, 2], vec![1, 2], false).unwrap();
    let path = write(
        &dir,
        &Value::List(vec![base.clone().into(), view.clone().into()]),
    );

    let loaded = lazy_load(&path).unwrap();
    let items = loaded.as_seq().unwrap();
    let (a, b) = (items[0].as_lazy().unwrap(), items[1].as_lazy().unwrap());
    assert_eq!(a.storage_key().record, b.storage_key().record);
    assert_eq!(b.rebuild_args().storage_offset, 1);
    assert_eq!(b.stride(), &[1, 2]);

    let v = b.materialize().unwrap();
    assert_eq!(v.to_f64_vec().unwrap(), vec![2.0, 4.0, 3.0, 5.0]);
    assert_eq!(v, view);
    assert_eq!(a.materialize().unwrap(), base);
}

/// `torch.save({"w": torch.arange(4.0)}, f)` as written by torch, memo ops included.
const TORCH_PICKLE: &[u8] = b"\x80\x02}q\x00X\x01\x00\x00\x00wq\x01ctorch._utils\n_rebuild_tensor_v2\nq\x02((X\x07\x00\x00\x00storageq\x03ctorch\nFloatStorage\nq\x04X\x01\x00\x00\x000q\x05X\x03\x00\x00\x00cpuq\x06K\x04tq\x07QK\x00K\x04\x85q\x08K\x01\x85q\x09\x89ccollections\nOrderedDict\nq\x0a)Rq\x0btq\x0cRq\x0ds.";

fn write_torch_archive(dir: &TempDir, with_storage: bool) -> PathBuf {
    let path = dir.path().join("arange.pt");
    let mut writer = ArchiveWriter::create(&path, "archive").unwrap();
    writer.write_record("data.pkl", TORCH_PICKLE).unwrap();
    writer.write_record("byteorder", b"little").unwrap();
    if with_storage {
        let bytes: Vec<u8> = [0.0f32, 1.0, 2.0, 3.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        writer.write_record("data/0", &bytes).unwrap();
    }
    writer.write_record("version", b"3\n").unwrap();
    writer.finish().unwrap();
    path
}

#[test]
fn test_torch_written_archive() {
    let dir = TempDir::new().unwrap();
    let path = write_torch_archive(&dir, true);
    let loaded = lazy_load(&path).unwrap();
    let w = loaded.get("w").unwrap().as_lazy().unwrap();
    assert_eq!(w.shape(), &[4]);
    assert_eq!(w.dtype(), DType::F32);
    assert_eq!(w.storage_key().storage_class, "FloatStorage");
    assert_eq!(w.storage_key().device, "cpu");
    assert_eq!(w.deferred(), &Deferred::Read);
    assert_eq!(
        w.materialize().unwrap().to_f64_vec().unwrap(),
        vec![0.0, 1.0, 2.0, 3.0]
    );
}

#[test]
fn test_missing_record_fails_only_on_materialize() {
    let dir = TempDir::new().unwrap();
    let path = write_torch_archive(&dir, false);
    let loaded = lazy_load(&path).unwrap();
    let w = loaded.get("w").unwrap().as_lazy().unwrap();
    assert!(matches!(
        w.materialize(),
        Err(CheckpointError::RecordNotFound(name)) if name == "data/0"
    ));
    assert!(load(&path).is_err());
}

#[test]
fn test_strict_globals() {
    let dir = TempDir::new().unwrap();
    let mut hparams = lazyckpt_core::Object::new(Symbol::new("argparse", "Namespace"), vec![]);
    hparams.state = Some(Box::new(Value::dict([("lr", Value::Float(0.01))])));
    let path = write(
        &dir,
        &Value::dict([("hparams", Value::Object(hparams)), ("w", buffer().into())]),
    );

    let loaded = lazy_load(&path).unwrap();
    assert!(matches!(loaded.get("hparams"), Some(Value::Object(_))));

    let strict = LoaderConfig {
        strict_globals: true,
        ..LoaderConfig::default()
    };
    assert!(matches!(
        lazy_load_with(&path, &strict),
        Err(CheckpointError::UnknownSymbol { module, .. }) if module == "argparse"
    ));
}

#[test]
fn test_save_materializes_placeholders() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, &checkpoint());
    let loaded = lazy_load(&path).unwrap();

    let copy = dir.path().join("copy.ckpt");
    save(&loaded, &copy).unwrap();
    assert_eq!(load(&copy).unwrap(), checkpoint());
}

fn difference(t: &[Tensor]) -> lazyckpt_core::Result<Vec<f64>> {
    let (lhs, rhs) = (t[0].to_f64_vec()?, t[1].to_f64_vec()?);
    Ok(lhs.iter().zip(&rhs).map(|(a, b)| a - b).collect())
}

#[test]
fn test_dispatch_materializes_operands_in_order() {
    let dir = TempDir::new().unwrap();
    let other = Tensor::from_values(DType::F32, vec![2], &[4.0, 8.0]).unwrap();
    let path = write(&dir, &Value::List(vec![buffer().into(), other.clone().into()]));
    let loaded = lazy_load(&path).unwrap();
    let items = loaded.as_seq().unwrap();

    let forward = dispatch::call(&[&items[0], &items[1]], difference).unwrap();
    assert_eq!(forward, vec![-3.75, -9.5]);
    let backward = dispatch::call(&[&items[1], &items[0]], difference).unwrap();
    assert_eq!(backward, vec![3.75, 9.5]);

    let lazy = items[0].as_lazy().unwrap();
    let mixed: [&dyn TensorOperand; 2] = [&other, lazy];
    assert_eq!(dispatch::call(&mixed, difference).unwrap(), vec![3.75, 9.5]);
    assert_eq!(lazy.archive().storage_reads(), 5);
}

#[test]
fn test_not_an_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("garbage.pt");
    std::fs::write(&path, b"definitely not a zip").unwrap();
    assert!(matches!(lazy_load(&path), Err(CheckpointError::Zip(_))));
}

#[test]
fn test_corrupt_object_graph_is_format_error() {
    let dir = TempDir::new().unwrap();
    for (name, graph) in [
        ("truncated.pt", &TORCH_PICKLE[..TORCH_PICKLE.len() / 2]),
        ("bad_opcode.pt", b"\x80\x02\xff.".as_slice()),
    ] {
        let path = dir.path().join(name);
        let mut writer = ArchiveWriter::create(&path, "archive").unwrap();
        writer.write_record("data.pkl", graph).unwrap();
        writer.finish().unwrap();
        assert!(matches!(lazy_load(&path), Err(CheckpointError::Format { .. })), "{name}");
        assert!(matches!(load(&path), Err(CheckpointError::Format { .. })), "{name}");
    }
}

#[test]
fn test_short_storage_record_is_short_read() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.pt");
    let mut writer = ArchiveWriter::create(&path, "archive").unwrap();
    writer.write_record("data.pkl", TORCH_PICKLE).unwrap();
    writer.write_record("data/0", &[0u8; 8]).unwrap();
    writer.finish().unwrap();

    let loaded = lazy_load(&path).unwrap();
    let w = loaded.get("w").unwrap().as_lazy().unwrap();
    assert!(matches!(
        w.materialize(),
        Err(CheckpointError::ShortRead { expected: 16, actual: 8, .. })
    ));
}

/// `{"w": _rebuild_tensor_v2(storage, 0, size, stride, False, OrderedDict())}`
/// with the storage element count, size tuple and stride tuple spliced in.
fn rebuild_pickle(numel: &[u8], size: &[u8], stride: &[u8]) -> Vec<u8> {
    let mut bytes = b"\x80\x02}q\x00X\x01\x00\x00\x00wq\x01ctorch._utils\n_rebuild_tensor_v2\nq\x02((X\x07\x00\x00\x00storageq\x03ctorch\nFloatStorage\nq\x04X\x01\x00\x00\x000q\x05X\x03\x00\x00\x00cpuq\x06".to_vec();
    bytes.extend_from_slice(numel);
    bytes.extend_from_slice(b"tq\x07QK\x00");
    bytes.extend_from_slice(size);
    bytes.extend_from_slice(b"\x85q\x08");
    bytes.extend_from_slice(stride);
    bytes.extend_from_slice(b"\x85q\x09");
    bytes.extend_from_slice(b"\x89ccollections\nOrderedDict\nq\x0a)Rq\x0btq\x0cRq\x0ds.");
    bytes
}

/// LONG1 encoding of 2**62.
const HUGE: &[u8] = b"\x8a\x08\x00\x00\x00\x00\x00\x00\x00\x40";

fn write_graph(dir: &TempDir, name: &str, graph: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    let mut writer = ArchiveWriter::create(&path, "archive").unwrap();
    writer.write_record("data.pkl", graph).unwrap();
    writer.write_record("data/0", &[0u8; 16]).unwrap();
    writer.finish().unwrap();
    path
}

#[test]
fn test_rebuild_pickle_matches_torch_layout() {
    assert_eq!(rebuild_pickle(b"K\x04", b"K\x04", b"K\x01"), TORCH_PICKLE);
}

#[test]
fn test_overflowing_stride_is_structure_error() {
    let dir = TempDir::new().unwrap();
    let path = write_graph(&dir, "stride.pt", &rebuild_pickle(b"K\x01", b"K\x05", HUGE));
    assert!(matches!(lazy_load(&path), Err(CheckpointError::Structure(_))));
}

#[test]
fn test_overflowing_storage_size_is_structure_error() {
    let dir = TempDir::new().unwrap();
    let path = write_graph(&dir, "numel.pt", &rebuild_pickle(HUGE, b"K\x04", b"K\x01"));

    let loaded = lazy_load(&path).unwrap();
    let w = loaded.get("w").unwrap().as_lazy().unwrap();
    assert!(matches!(w.materialize(), Err(CheckpointError::Structure(_))));
    assert_eq!(w.archive().storage_reads(), 0);
    assert!(matches!(load(&path), Err(CheckpointError::Structure(_))));
}

#[test]
fn test_nesting_depth() {
    let dir = TempDir::new().unwrap();

    let mut shallow = b"\x80\x02N".to_vec();
    shallow.extend(std::iter::repeat_n(b'\x85', 64));
    shallow.push(b'.');
    let path = write_graph(&dir, "shallow.pt", &shallow);
    let loaded = materialize_all(lazy_load(&path).unwrap()).unwrap();
    assert_eq!(loaded.lazy_count(), 0);

    let mut deep = b"\x80\x02N".to_vec();
    deep.extend(std::iter::repeat_n(b'\x85', 1_000_000));
    deep.push(b'.');
    let path = write_graph(&dir, "deep.pt", &deep);
    let err = lazy_load(&path).unwrap_err();
    assert!(matches!(err, CheckpointError::Format { .. }));
    assert!(err.to_string().contains(&MAX_NESTING.to_string()));
}
