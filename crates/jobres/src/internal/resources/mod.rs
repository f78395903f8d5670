pub(crate) mod jobres;
pub(crate) mod offset;
pub(crate) mod pack;

pub use jobres::{JobResources, NodeRemap};
pub use offset::{CoreLayout, CorePosition, SocketCores};
