//! Caller-supplied predicates carried inside otherwise plain data models.

use serde::{Serialize, Serializer};
use std::sync::Arc;

/// A shareable, thread-safe boolean test over `T`.
pub struct Predicate<T: ?Sized>(Arc<dyn Fn(&T) -> bool + Send + Sync>);

impl<T: ?Sized> Predicate<T> {
    /// Wrap a closure.
    pub fn new(f: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Evaluate the predicate.
    pub fn test(&self, value: &T) -> bool {
        (self.0)(value)
    }
}

impl<T: ?Sized> Clone for Predicate<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ?Sized> std::fmt::Debug for Predicate<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Predicate(..)")
    }
}

// Closures have no data representation; snapshots only record that one is set.
impl<T: ?Sized> Serialize for Predicate<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("<predicate>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_evaluates_and_clones() {
        let even = Predicate::new(|n: &i32| n % 2 == 0);
        let copy = even.clone();
        assert!(even.test(&4));
        assert!(!copy.test(&3));
        assert_eq!(serde_json::to_string(&even).unwrap(), "\"<predicate>\"");
    }
}
