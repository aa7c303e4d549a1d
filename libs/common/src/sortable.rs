use parking_lot::Mutex;
use ulid::{Generator, Ulid};

/// Process-wide generator of lexicographically sortable IDs.
///
/// Wraps `ulid::Generator`, which increments the random part for IDs minted
/// within the same millisecond, so IDs strictly increase in creation order.
pub struct SortableIdGenerator {
    inner: Mutex<Generator>,
}

impl SortableIdGenerator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Generator::new()),
        }
    }

    /// Mint the next ID as its canonical 26-character string.
    pub fn generate(&self) -> String {
        self.next_ulid().to_string()
    }

    fn next_ulid(&self) -> Ulid {
        let mut gen = self.inner.lock();
        // The random part only overflows after 2^80 IDs in one millisecond.
        gen.generate().unwrap_or_else(|_| Ulid::new())
    }
}

impl Default for SortableIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
