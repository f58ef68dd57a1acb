use parking_lot::{Condvar, Mutex};

// one-shot: once notified it stays set, a second notify is a bug
pub struct CpuEvent {
    cond_var: Condvar,
    mutex: Mutex<bool>,
}

impl CpuEvent {
    pub fn new() -> Self {
        Self {
            cond_var: Condvar::new(),
            mutex: Mutex::new(false),
        }
    }

    pub fn notify(&self) {
        let mut notified = self.mutex.lock();
        debug_assert!(!*notified, "CpuEvent notified twice");
        *notified = true;
        self.cond_var.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.mutex.lock()
    }

    pub fn wait(&self) {
        let mut notified = self.mutex.lock();
        while !*notified {
            self.cond_var.wait(&mut notified);
        }
    }
}

impl Default for CpuEvent {
    fn default() -> Self {
        Self::new()
    }
}
