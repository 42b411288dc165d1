/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }

    /// Disarms the guard, the callback will not be called.
    pub fn disarm(&mut self) {
        self.f = None;
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_call_on_drop() {
        let called = Arc::new(AtomicBool::new(false));
        let guard = CallOnDrop::new({
            let called = Arc::clone(&called);
            move || called.store(true, Ordering::Relaxed)
        });
        assert!(!called.load(Ordering::Relaxed));
        drop(guard);
        assert!(called.load(Ordering::Relaxed));
    }

    #[test]
    fn test_disarm() {
        let called = Arc::new(AtomicBool::new(false));
        let mut guard = CallOnDrop::new({
            let called = Arc::clone(&called);
            move || called.store(true, Ordering::Relaxed)
        });
        guard.disarm();
        drop(guard);
        assert!(!called.load(Ordering::Relaxed));
    }
}
