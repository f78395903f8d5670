use std::fmt::Display;

/// Checks at compile-time that the given type $ty has the corresponding $size.
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: [(); $size] = [(); ::std::mem::size_of::<$ty>()];
    };
}

pub fn format_comma_delimited<I: IntoIterator<Item = T>, T: Display>(items: I) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(",")
}
