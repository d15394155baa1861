//! Striped per-sheet locks.
//!
//! Lifecycle commands hold the lock for their sheet for the whole
//! command, which enforces per-sheet ordering without serializing
//! unrelated sheets. The map grows one entry per sheet and entries
//! are never evicted; at the expected scale (one mutex per sheet)
//! that is cheaper than reference counting evictions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Lock map keyed by `sheet_id`.
#[derive(Default)]
pub struct SheetLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SheetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for a sheet, creating it on first use.
    ///
    /// Callers hold the returned `Arc` and lock it for the duration
    /// of the command:
    ///
    /// ```ignore
    /// let lock = locks.for_sheet("SHEET_1");
    /// let _guard = lock.lock().expect("sheet lock poisoned");
    /// ```
    pub fn for_sheet(&self, sheet_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("sheet lock map poisoned");
        map.entry(sheet_id.to_string()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn same_sheet_returns_same_lock() {
        let locks = SheetLocks::new();
        let a = locks.for_sheet("SHEET_1");
        let b = locks.for_sheet("SHEET_1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_sheets_do_not_share_locks() {
        let locks = SheetLocks::new();
        let a = locks.for_sheet("SHEET_1");
        let b = locks.for_sheet("SHEET_2");
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn per_sheet_mutual_exclusion() {
        let locks = Arc::new(SheetLocks::new());
        let counter = Arc::new(Mutex::new(0u32));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                let lock = locks.for_sheet("SHEET_SHARED");
                let _guard = lock.lock().expect("lock");
                let mut c = counter.lock().expect("counter");
                *c += 1;
            }));
        }
        for h in handles {
            h.join().expect("thread panicked");
        }

        assert_eq!(*counter.lock().expect("counter"), 8);
    }
}
