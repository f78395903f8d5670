#[cfg(test)]
mod test_pack;
#[cfg(test)]
mod test_picker;

pub mod utils;
