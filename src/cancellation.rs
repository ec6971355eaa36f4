use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Entry {
    session_uid: String,
    flag: CancelFlag,
}

/// Cooperative cancellation flags for in-flight runs and snapshots. Workers poll
/// their flag at checkpoints; nothing here interrupts a call already in progress.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the flag for `uid`, creating it on first use.
    pub fn register(&self, session_uid: &str, uid: &str) -> CancelFlag {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(uid.to_string())
            .or_insert_with(|| Entry {
                session_uid: session_uid.to_string(),
                flag: CancelFlag::default(),
            })
            .flag
            .clone()
    }

    pub fn cancel(&self, uid: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.get(uid) {
            Some(entry) => {
                entry.flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels and forgets every entry of the session. Holders keep their flags.
    pub fn cancel_session(&self, session_uid: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| {
            if entry.session_uid == session_uid {
                entry.flag.cancel();
                false
            } else {
                true
            }
        });
        before - entries.len()
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn release(&self, uid: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(uid);
    }
}
