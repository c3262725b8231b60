use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lazyckpt_core::pickle::{DefaultResolver, Pickler, Unpickler};
use lazyckpt_core::{DType, Tensor, Value, lazy_load, load, materialize_all, save};
use std::io::Cursor;
use std::path::PathBuf;
use tempfile::TempDir;

/// `layers` linear layers of `width x width` f32 weights plus biases.
fn state_dict(layers: usize, width: usize) -> Value {
    let weights: Vec<f64> = (0..width * width).map(|i| (i % 97) as f64 * 0.01).collect();
    let bias: Vec<f64> = vec![0.5; width];
    let mut entries = Vec::new();
    for i in 0..layers {
        let w = Tensor::from_values(DType::F32, vec![width, width], &weights)
            .unwrap()
            .into_parameter(true);
        let b = Tensor::from_values(DType::F32, vec![width], &bias)
            .unwrap()
            .into_parameter(true);
        entries.push((format!("layers.{i}.weight"), w.into()));
        entries.push((format!("layers.{i}.bias"), b.into()));
    }
    Value::dict([
        ("state_dict", Value::dict(entries)),
        ("global_step", Value::Int(1000)),
    ])
}

fn write_checkpoint(dir: &TempDir, layers: usize, width: usize) -> PathBuf {
    let path = dir.path().join(format!("bench_{layers}x{width}.ckpt"));
    save(&state_dict(layers, width), &path).unwrap();
    path
}

fn bench_load_modes(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let mut group = c.benchmark_group("load");
    for width in [64, 256, 512] {
        let path = write_checkpoint(&dir, 8, width);

        group.bench_with_input(BenchmarkId::new("lazy", width), &path, |b, path| {
            b.iter(|| lazy_load(black_box(path)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("eager", width), &path, |b, path| {
            b.iter(|| load(black_box(path)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("lazy_then_materialize", width), &path, |b, path| {
            b.iter(|| materialize_all(lazy_load(black_box(path)).unwrap()).unwrap())
        });
    }
    group.finish();
}

fn bench_single_tensor_access(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = write_checkpoint(&dir, 32, 256);
    let loaded = lazy_load(&path).unwrap();
    let lazy = loaded
        .lookup("state_dict")
        .and_then(|sd| sd.get("layers.17.weight"))
        .and_then(Value::as_lazy)
        .unwrap()
        .clone();

    c.bench_function("lazy_metadata_query", |b| {
        b.iter(|| black_box(&lazy).shape().iter().product::<usize>())
    });
    c.bench_function("lazy_materialize_one_of_64", |b| {
        b.iter(|| black_box(&lazy).materialize().unwrap())
    });
}

fn bench_pickle_codec(c: &mut Criterion) {
    let graph = Value::dict((0..500).map(|i| {
        (
            format!("key_{i}"),
            Value::List(vec![Value::Int(i), Value::Float(i as f64 / 3.0), Value::str("x")]),
        )
    }));

    c.bench_function("pickle_dump_500_entries", |b| {
        b.iter(|| {
            let mut pickler = Pickler::new(Vec::new());
            pickler.dump(black_box(&graph)).unwrap();
            pickler.into_parts().0
        })
    });

    let mut pickler = Pickler::new(Vec::new());
    pickler.dump(&graph).unwrap();
    let (bytes, _) = pickler.into_parts();
    c.bench_function("pickle_load_500_entries", |b| {
        b.iter(|| {
            Unpickler::new(Cursor::new(black_box(bytes.as_slice())), DefaultResolver::default())
                .load()
                .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_load_modes,
    bench_single_tensor_access,
    bench_pickle_codec,
);
criterion_main!(benches);
