use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A unit of data tagged with its position in the input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequenced<T> {
    pub seq: u64,
    pub data: T,
}

impl<T> Sequenced<T> {
    pub fn new(seq: u64, data: T) -> Self {
        Self { seq, data }
    }
}

/// One input in, zero or more outputs out.
///
/// Implementations must be callable from many worker threads at once.
pub trait Transform: Sync {
    type Input;
    type Output;
    type Iter: Iterator<Item = Self::Output>;

    fn transform(&self, input: Self::Input) -> Self::Iter;
}

/// Cooperative cancellation flag shared between the caller and a running pipeline.
///
/// Cancelling is sticky: once set the token stays cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
