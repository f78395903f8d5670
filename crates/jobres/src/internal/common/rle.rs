use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RleError {
    #[error("Run-length arrays differ in length ({values} values, {reps} repetitions)")]
    LengthMismatch { values: usize, reps: usize },
    #[error("Run {run} has a zero repetition count")]
    ZeroRepetition { run: usize },
    #[error("Run-length sequence expands to {actual} items, expected {expected}")]
    TotalMismatch { expected: u64, actual: u64 },
}

/// Run-length encoded sequence.
///
/// Adjacent equal values are always merged into a single run, so two sequences with the same
/// expansion have the same encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLengthVec<T> {
    values: Vec<T>,
    reps: Vec<u32>,
}

impl<T> Default for RunLengthVec<T> {
    fn default() -> Self {
        RunLengthVec {
            values: Vec::new(),
            reps: Vec::new(),
        }
    }
}

/// One element of an expanded run-length sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunItem<T> {
    /// Position in the expanded sequence
    pub index: usize,
    /// Run that holds the item
    pub run: usize,
    pub value: T,
}

impl<T: Copy + PartialEq> RunLengthVec<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a sequence from wire arrays; runs are kept as given.
    pub fn from_parts(values: Vec<T>, reps: Vec<u32>) -> Result<Self, RleError> {
        if values.len() != reps.len() {
            return Err(RleError::LengthMismatch {
                values: values.len(),
                reps: reps.len(),
            });
        }
        if let Some(run) = reps.iter().position(|r| *r == 0) {
            return Err(RleError::ZeroRepetition { run });
        }
        Ok(RunLengthVec { values, reps })
    }

    pub fn push(&mut self, value: T) {
        self.push_run(value, 1);
    }

    pub fn push_run(&mut self, value: T, count: u32) {
        if count == 0 {
            return;
        }
        if let (Some(last), Some(reps)) = (self.values.last(), self.reps.last_mut()) {
            if *last == value {
                *reps += count;
                return;
            }
        }
        self.values.push(value);
        self.reps.push(count);
    }

    #[inline]
    pub fn values(&self) -> &[T] {
        &self.values
    }

    #[inline]
    pub fn reps(&self) -> &[u32] {
        &self.reps
    }

    #[inline]
    pub fn run_count(&self) -> usize {
        self.values.len()
    }

    /// Length of the expanded sequence.
    pub fn total(&self) -> u64 {
        self.reps.iter().map(|r| *r as u64).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn check_total(&self, expected: u64) -> Result<(), RleError> {
        let actual = self.total();
        if actual != expected {
            return Err(RleError::TotalMismatch { expected, actual });
        }
        Ok(())
    }

    pub fn runs(&self) -> impl Iterator<Item = (T, u32)> + '_ {
        self.values.iter().copied().zip(self.reps.iter().copied())
    }

    pub fn iter(&self) -> RunLengthIter<'_, T> {
        RunLengthIter {
            rle: self,
            run: 0,
            in_run: 0,
            index: 0,
        }
    }

    /// Returns the run holding the item at `index` and the expanded index of its first item.
    pub fn locate(&self, index: usize) -> Option<(usize, usize)> {
        let mut first = 0;
        for (run, reps) in self.reps.iter().enumerate() {
            let next = first + *reps as usize;
            if index < next {
                return Some((run, first));
            }
            first = next;
        }
        None
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.locate(index).map(|(run, _)| self.values[run])
    }

    pub fn expand(&self) -> Vec<T> {
        self.iter().map(|item| item.value).collect()
    }
}

impl<T: Copy + PartialEq> FromIterator<T> for RunLengthVec<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut rle = RunLengthVec::new();
        for value in iter {
            rle.push(value);
        }
        rle
    }
}

pub struct RunLengthIter<'a, T> {
    rle: &'a RunLengthVec<T>,
    run: usize,
    in_run: u32,
    index: usize,
}

impl<T: Copy + PartialEq> Iterator for RunLengthIter<'_, T> {
    type Item = RunItem<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.run < self.rle.reps.len() && self.in_run >= self.rle.reps[self.run] {
            self.run += 1;
            self.in_run = 0;
        }
        let value = *self.rle.values.get(self.run)?;
        let item = RunItem {
            index: self.index,
            run: self.run,
            value,
        };
        self.in_run += 1;
        self.index += 1;
        Some(item)
    }
}
