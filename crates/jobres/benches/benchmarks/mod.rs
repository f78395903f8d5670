pub mod step;
pub mod wire;
