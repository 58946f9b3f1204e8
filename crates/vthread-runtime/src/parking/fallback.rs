//! Condvar parker for targets without futex

use super::Park;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct CondvarParker {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl CondvarParker {
    pub const fn new() -> Self {
        CondvarParker {
            permit: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl Default for CondvarParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Park for CondvarParker {
    fn park(&self, timeout: Option<Duration>) -> bool {
        let mut permit = self.permit.lock().unwrap_or_else(|e| e.into_inner());
        if !*permit {
            permit = match timeout {
                Some(t) => self.cond.wait_timeout(permit, t).unwrap_or_else(|e| e.into_inner()).0,
                None => self.cond.wait(permit).unwrap_or_else(|e| e.into_inner()),
            };
        }
        std::mem::replace(&mut *permit, false)
    }

    fn unpark(&self) {
        *self.permit.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_one();
    }
}
