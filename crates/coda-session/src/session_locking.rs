//! In-process serialization of appends per session id.
use super::*;

#[derive(Debug, Default)]
pub(super) struct SessionLockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLockRegistry {
    pub(super) fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = lock_or_recover(&self.locks);
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(super) fn forget(&self, session_id: &str) {
        lock_or_recover(&self.locks).remove(session_id);
    }

    #[cfg(test)]
    pub(super) fn tracked(&self) -> usize {
        lock_or_recover(&self.locks).len()
    }
}

pub(super) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
