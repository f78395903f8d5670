#[macro_use]
pub(crate) mod common;
pub(crate) mod job;
pub(crate) mod plugins;
pub(crate) mod resources;
pub(crate) mod step;

#[cfg(test)]
pub mod tests;
