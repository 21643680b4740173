//! Region mesh lifecycle

/// Lifecycle of a region's mesh; only ever advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeshState {
    /// Generated, waiting for a staging slot
    AwaitMeshingCompute,
    /// Meshed into a staging slot, waiting for its vertex buffer
    AwaitVertexBufferCreation,
    /// Vertex buffer materialized (possibly empty); terminal
    Completed,
}

impl MeshState {
    /// The only state this one may move to
    pub fn next(self) -> Option<MeshState> {
        match self {
            MeshState::AwaitMeshingCompute => Some(MeshState::AwaitVertexBufferCreation),
            MeshState::AwaitVertexBufferCreation => Some(MeshState::Completed),
            MeshState::Completed => None,
        }
    }

    pub fn can_advance_to(self, to: MeshState) -> bool {
        self.next() == Some(to)
    }

    pub fn is_terminal(self) -> bool {
        self == MeshState::Completed
    }
}
