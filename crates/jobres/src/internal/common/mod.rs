pub(crate) mod bitmap;
pub(crate) mod buffer;
pub(crate) mod config;
pub(crate) mod data_structures;
pub(crate) mod error;
pub(crate) mod ids;
pub(crate) mod index;
pub(crate) mod rle;
pub(crate) mod utils;

pub use data_structures::{Map, Set};
