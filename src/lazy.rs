use std::sync::{Arc, Mutex, PoisonError};

use crate::Result;

type Init<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

enum State<T> {
    Uncomputed,
    Computed(Arc<T>),
}

/// Compute-once cell with an explicit {uncomputed | computed} state.
///
/// The first `get()` runs the initialiser while holding the cell lock, so
/// concurrent first readers wait and then observe the same value. A failed
/// initialisation leaves the cell uncomputed.
pub struct Lazy<T> {
    init: Init<T>,
    state: Mutex<State<T>>,
}

impl<T> Lazy<T> {
    pub fn new(init: impl Fn() -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            init: Box::new(init),
            state: Mutex::new(State::Uncomputed),
        }
    }

    /// A cell that is already computed.
    pub fn ready(value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let fallback = value.clone();
        Self {
            init: Box::new(move || Ok(fallback.clone())),
            state: Mutex::new(State::Computed(Arc::new(value))),
        }
    }

    pub fn get(&self) -> Result<Arc<T>> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let State::Computed(value) = &*state {
            return Ok(value.clone());
        }
        let value = Arc::new((self.init)()?);
        *state = State::Computed(value.clone());
        Ok(value)
    }

    pub fn is_computed(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Computed(_)
        )
    }

    /// Drop the cached value; the next `get()` recomputes it.
    pub fn invalidate(&self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = State::Uncomputed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SensorError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_computes_once_across_threads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = Arc::new(Lazy::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(vec![1, 2, 3])
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.get().unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for r in &results {
            assert!(Arc::ptr_eq(r, &results[0]));
        }
    }

    #[test]
    fn test_failure_leaves_uncomputed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cell = Lazy::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(SensorError::Backend("enumeration failed".into()))
            } else {
                Ok(7u32)
            }
        });

        assert!(cell.get().is_err());
        assert!(!cell.is_computed());
        assert_eq!(*cell.get().unwrap(), 7);
        assert!(cell.is_computed());
    }

    #[test]
    fn test_invalidate_recomputes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cell = Lazy::new(move || Ok(counter.fetch_add(1, Ordering::SeqCst)));
        assert_eq!(*cell.get().unwrap(), 0);
        assert_eq!(*cell.get().unwrap(), 0);
        cell.invalidate();
        assert_eq!(*cell.get().unwrap(), 1);
    }
}
