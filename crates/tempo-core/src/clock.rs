use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

/// Wall clock shared by the timetable and the scheduler.
///
/// A pinned clock only moves when told to, so tree building and the
/// "window is still live" checks can be driven deterministically.
#[derive(Debug, Clone, Default)]
pub struct Clock {
    pinned: Option<Arc<RwLock<DateTime<Utc>>>>,
}

impl Clock {
    pub fn system() -> Self {
        Self { pinned: None }
    }

    pub fn pinned(at: DateTime<Utc>) -> Self {
        Self {
            pinned: Some(Arc::new(RwLock::new(at))),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        match &self.pinned {
            Some(at) => *at.read().unwrap_or_else(PoisonError::into_inner),
            None => Utc::now(),
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Move a pinned clock to `at`. Ignored by the system clock.
    pub fn set(&self, at: DateTime<Utc>) {
        if let Some(pinned) = &self.pinned {
            *pinned.write().unwrap_or_else(PoisonError::into_inner) = at;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Some(pinned) = &self.pinned {
            let mut guard = pinned.write().unwrap_or_else(PoisonError::into_inner);
            *guard += by;
        }
    }
}
