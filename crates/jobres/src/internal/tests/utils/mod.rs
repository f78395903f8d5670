#[cfg(test)]
pub mod env;
#[cfg(test)]
pub mod nodes;
#[cfg(test)]
pub mod plugins;

pub fn sorted_vec<T: Ord>(mut vec: Vec<T>) -> Vec<T> {
    vec.sort();
    vec
}

#[allow(unused)]
#[cfg(test)]
pub fn enable_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
pub fn expect_step_error<T: std::fmt::Debug>(
    result: crate::Result<T>,
    expected: crate::internal::step::error::StepError,
) {
    match result {
        Ok(value) => panic!("Expected {expected:?}, got Ok({value:?})"),
        Err(error) => assert_eq!(
            error.as_step_error(),
            Some(&expected),
            "unexpected error {error:?}"
        ),
    }
}
