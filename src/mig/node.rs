use crate::k8s::annotations::SpecAnnotations;
use crate::mig::gpu::Gpu;
use crate::mig::Geometry;

/// All GPUs on the node, ordered by GPU index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeState {
    gpus: Vec<Gpu>,
}

impl NodeState {
    pub fn new(mut gpus: Vec<Gpu>) -> Self {
        gpus.sort_by_key(Gpu::index);
        Self { gpus }
    }

    pub fn gpus(&self) -> &[Gpu] {
        &self.gpus
    }

    pub fn gpu(&self, index: u32) -> Option<&Gpu> {
        self.gpus.iter().find(|gpu| gpu.index() == index)
    }

    pub fn geometry(&self, index: u32) -> Option<Geometry> {
        self.gpu(index).map(Gpu::geometry)
    }

    /// Whether the node already provides exactly the partitioning the spec
    /// asks for: for every (index, profile) entry the GPU at that index has
    /// exactly that many partitions of the profile, free and used combined.
    pub fn matches(&self, spec: &SpecAnnotations) -> bool {
        spec.iter().all(|((index, profile), count)| {
            self.gpu(*index)
                .map(|gpu| gpu.count_of(profile) == *count)
                .unwrap_or(*count == 0)
        })
    }
}
