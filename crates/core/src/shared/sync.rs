use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, taking over the data if a previous holder panicked.
///
/// Guarded state is only ever replaced wholesale, so a poisoned value is
/// still consistent.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_recovers_poisoned_mutex() {
        let shared = Arc::new(Mutex::new(5));
        let clone = shared.clone();
        let _ = thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(shared.is_poisoned());
        assert_eq!(*lock(&shared), 5);
    }
}
