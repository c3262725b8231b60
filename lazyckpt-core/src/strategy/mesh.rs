//! Two-dimensional device mesh and the collaborators that set it up.

use crate::error::StrategyError;
use serde::Serialize;
use std::time::Duration;

pub const DATA_PARALLEL: &str = "data_parallel";
pub const TENSOR_PARALLEL: &str = "tensor_parallel";

/// Ranks arranged row-major over named dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceMesh {
    device_type: String,
    dims: Vec<(String, usize)>,
}

impl DeviceMesh {
    pub fn new(device_type: impl Into<String>, dims: Vec<(String, usize)>) -> Self {
        Self {
            device_type: device_type.into(),
            dims,
        }
    }

    /// `(data_parallel, tensor_parallel)` mesh over `world_size` ranks.
    pub fn data_tensor_parallel(
        device_type: &str,
        data_parallel: usize,
        tensor_parallel: usize,
        world_size: usize,
    ) -> Result<Self, StrategyError> {
        if data_parallel.checked_mul(tensor_parallel) != Some(world_size) {
            return Err(StrategyError::InvalidMeshDimensions {
                data_parallel,
                tensor_parallel,
                world_size,
            });
        }
        Ok(Self::new(
            device_type,
            vec![
                (DATA_PARALLEL.to_string(), data_parallel),
                (TENSOR_PARALLEL.to_string(), tensor_parallel),
            ],
        ))
    }

    pub fn device_type(&self) -> &str {
        &self.device_type
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dim_names(&self) -> impl Iterator<Item = &str> {
        self.dims.iter().map(|(name, _)| name.as_str())
    }

    /// Number of ranks; saturates for dimensions that overflow `usize`.
    pub fn size(&self) -> usize {
        self.dims
            .iter()
            .try_fold(1usize, |acc, (_, n)| acc.checked_mul(*n))
            .unwrap_or(usize::MAX)
    }

    pub fn dim_size(&self, name: &str) -> Option<usize> {
        self.dims.iter().find(|(n, _)| n == name).map(|(_, s)| *s)
    }

    /// Position of `rank` along every dimension.
    pub fn coordinate(&self, rank: usize) -> Option<Vec<usize>> {
        if rank >= self.size() {
            return None;
        }
        let mut rest = rank;
        let mut coord = vec![0; self.dims.len()];
        for (i, (_, n)) in self.dims.iter().enumerate().rev() {
            coord[i] = rest % n;
            rest /= n;
        }
        Some(coord)
    }

    /// Index of `rank` along dimension `name`.
    pub fn local_rank(&self, rank: usize, name: &str) -> Option<usize> {
        let dim = self.dims.iter().position(|(n, _)| n == name)?;
        self.coordinate(rank).map(|c| c[dim])
    }
}

/// Where this process sits in the cluster.
pub trait ClusterEnvironment {
    fn world_size(&self) -> usize;
    fn global_rank(&self) -> usize;
    fn local_rank(&self) -> usize;
    fn node_rank(&self) -> usize;
}

/// Cluster layout read from `WORLD_SIZE`, `RANK`, `LOCAL_RANK` and `NODE_RANK`,
/// defaulting to a single process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticEnvironment {
    pub world_size: usize,
    pub global_rank: usize,
    pub local_rank: usize,
    pub node_rank: usize,
}

impl Default for StaticEnvironment {
    fn default() -> Self {
        Self {
            world_size: 1,
            global_rank: 0,
            local_rank: 0,
            node_rank: 0,
        }
    }
}

impl StaticEnvironment {
    pub fn from_env() -> Self {
        let var = |name: &str, default: usize| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            world_size: var("WORLD_SIZE", 1),
            global_rank: var("RANK", 0),
            local_rank: var("LOCAL_RANK", 0),
            node_rank: var("NODE_RANK", 0),
        }
    }
}

impl ClusterEnvironment for StaticEnvironment {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn global_rank(&self) -> usize {
        self.global_rank
    }

    fn local_rank(&self) -> usize {
        self.local_rank
    }

    fn node_rank(&self) -> usize {
        self.node_rank
    }
}

/// Collective communication backend, initialized once per process.
pub trait ProcessGroup {
    fn is_initialized(&self) -> bool;

    fn init(
        &mut self,
        backend: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<(), StrategyError>;
}

/// Process group for a single-process run; initialization only records its arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalProcessGroup {
    pub backend: Option<String>,
    pub rank: usize,
    pub world_size: usize,
    pub timeout: Option<Duration>,
}

impl ProcessGroup for LocalProcessGroup {
    fn is_initialized(&self) -> bool {
        self.backend.is_some()
    }

    fn init(
        &mut self,
        backend: &str,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<(), StrategyError> {
        if world_size != 1 {
            return Err(StrategyError::ProcessGroup {
                message: format!("a local process group cannot span {world_size} processes"),
                timeout,
            });
        }
        self.backend = Some(backend.to_string());
        self.rank = rank;
        self.world_size = world_size;
        self.timeout = Some(timeout);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mesh_dimensions_must_match_world_size() {
        for (nodes, devices, dp, tp) in [(1, 4, 1, 1), (1, 4, 2, 3), (1, 4, 4, 2), (2, 4, 1, 4), (2, 4, 2, 1)] {
            let err = DeviceMesh::data_tensor_parallel("cpu", dp, tp, nodes * devices).unwrap_err();
            assert!(err.to_string().contains("multiplied should equal the world size"));
        }
    }

    #[test]
    fn test_overflowing_mesh_dimensions_are_rejected() {
        // the wrapped product would otherwise equal the world size
        let wrapped = usize::MAX.wrapping_mul(2);
        let err = DeviceMesh::data_tensor_parallel("cpu", usize::MAX, 2, wrapped).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidMeshDimensions { .. }));

        let mesh = DeviceMesh::new("cpu", vec![("a".into(), usize::MAX), ("b".into(), 2)]);
        assert_eq!(mesh.size(), usize::MAX);
    }

    #[test]
    fn test_mesh_coordinates() {
        let mesh = DeviceMesh::data_tensor_parallel("cuda", 2, 4, 8).unwrap();
        assert_eq!(mesh.size(), 8);
        assert_eq!(mesh.dim_names().collect::<Vec<_>>(), vec![DATA_PARALLEL, TENSOR_PARALLEL]);
        assert_eq!(mesh.coordinate(5), Some(vec![1, 1]));
        assert_eq!(mesh.local_rank(6, TENSOR_PARALLEL), Some(2));
        assert_eq!(mesh.coordinate(8), None);
    }

    #[test]
    fn test_local_process_group_records_timeout() {
        let mut pg = LocalProcessGroup::default();
        assert!(!pg.is_initialized());
        pg.init("gloo", 0, 1, Duration::from_secs(30)).unwrap();
        assert!(pg.is_initialized());
        assert_eq!(pg.timeout, Some(Duration::from_secs(30)));
        assert!(pg.init("gloo", 0, 2, Duration::from_secs(1)).is_err());
    }
}
