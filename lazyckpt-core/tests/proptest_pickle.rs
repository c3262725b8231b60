//! Property-based tests for the object-graph codec and lazy loading.

use proptest::prelude::*;
use std::io::Cursor;

use lazyckpt_core::pickle::{DefaultResolver, Pickler, Unpickler};
use lazyckpt_core::strategy::DeviceMesh;
use lazyckpt_core::{DType, Tensor, Value, lazy_load, materialize_all, save};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        (-1e12f64..1e12).prop_map(Value::Float),
        "[a-zA-Z0-9_ .é]{0,24}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
    ]
}

fn graph() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
            // keys must be unique: a repeated key overwrites on load
            prop::collection::btree_map("[a-z]{1,8}", inner, 0..6).prop_map(Value::dict),
        ]
    })
}

fn roundtrip(value: &Value) -> Value {
    let mut pickler = Pickler::new(Vec::new());
    pickler.dump(value).unwrap();
    let (bytes, storages) = pickler.into_parts();
    assert!(storages.is_empty());
    Unpickler::new(Cursor::new(bytes), DefaultResolver::default())
        .load()
        .unwrap()
}

// --- Object graph properties ---

proptest! {
    #[test]
    fn pickled_graph_loads_back_unchanged(value in graph()) {
        prop_assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn integers_survive_every_width(i in any::<i64>()) {
        prop_assert_eq!(roundtrip(&Value::Int(i)), Value::Int(i));
    }

    #[test]
    fn truncated_stream_is_an_error(value in graph(), cut in 0usize..64) {
        let mut pickler = Pickler::new(Vec::new());
        pickler.dump(&value).unwrap();
        let (bytes, _) = pickler.into_parts();
        let end = cut.min(bytes.len() - 1);
        let result = Unpickler::new(Cursor::new(&bytes[..end]), DefaultResolver::default()).load();
        prop_assert!(result.is_err());
    }
}

// --- Lazy loading properties ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn lazy_load_reads_nothing_until_materialized(
        values in prop::collection::vec(-1000i32..1000, 1..64),
    ) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.ckpt");
        let data: Vec<f64> = values.iter().map(|v| f64::from(*v)).collect();
        let tensor = Tensor::from_values(DType::F32, vec![data.len()], &data).unwrap();
        let checkpoint = Value::dict([("t", tensor.into())]);
        save(&checkpoint, &path).unwrap();

        let loaded = lazy_load(&path).unwrap();
        let lazy = loaded.get("t").unwrap().as_lazy().unwrap();
        prop_assert_eq!(lazy.numel(), data.len());
        prop_assert_eq!(lazy.archive().storage_reads(), 0);
        prop_assert_eq!(loaded.resident_bytes(), 0);

        let materialized = materialize_all(loaded).unwrap();
        prop_assert_eq!(materialized, checkpoint);
    }
}

// --- Device mesh properties ---

proptest! {
    #[test]
    fn mesh_accepts_only_matching_world_size(dp in 1usize..9, tp in 1usize..9, world in 1usize..65) {
        let mesh = DeviceMesh::data_tensor_parallel("cpu", dp, tp, world);
        prop_assert_eq!(mesh.is_ok(), dp * tp == world);
    }

    #[test]
    fn mesh_coordinates_cover_every_rank(dp in 1usize..6, tp in 1usize..6) {
        let mesh = DeviceMesh::data_tensor_parallel("cpu", dp, tp, dp * tp).unwrap();
        for rank in 0..dp * tp {
            let coord = mesh.coordinate(rank).unwrap();
            prop_assert_eq!(coord[0] * tp + coord[1], rank);
        }
        prop_assert!(mesh.coordinate(dp * tp).is_none());
    }
}
