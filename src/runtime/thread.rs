//! Managed threads as generated code sees them, and the pause gate native
//! code must pass on its way back into managed code.
//!
//! The safepoint protocol itself is not implemented here. [`SafepointGate`]
//! is only the blocking point: whoever coordinates pauses calls
//! [`SafepointGate::begin_pause`] / [`SafepointGate::end_pause`].

use std::mem::offset_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Thread states stored in [`ManagedThread::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    New = 0,
    InJava = 1,
    InNative = 2,
    /// Returned from native code, not yet allowed back in.
    InNativeTrans = 3,
    Blocked = 4,
}

impl ThreadState {
    fn from_raw(raw: u32) -> ThreadState {
        match raw {
            1 => ThreadState::InJava,
            2 => ThreadState::InNative,
            3 => ThreadState::InNativeTrans,
            4 => ThreadState::Blocked,
            _ => ThreadState::New,
        }
    }
}

/// Blocks threads returning from native code while a pause is in progress.
#[derive(Debug, Default)]
pub struct SafepointGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl SafepointGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn begin_pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    pub fn end_pause(&self) {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until no pause is in progress.
    pub fn block_while_paused(&self) {
        let mut paused = self.paused.lock().unwrap_or_else(PoisonError::into_inner);
        while *paused {
            paused = self
                .resumed
                .wait(paused)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Per-thread block addressed through the thread register by generated code.
///
/// Only the `#[repr(C)]` prefix is read from machine code; offsets are
/// exported below.
#[repr(C)]
#[derive(Debug)]
pub struct ManagedThread {
    state: AtomicU32,
    _pad: u32,
    /// Native interface pointer. Native methods receive its address.
    env: u64,
    /// Stack pointer of the last managed frame while the thread is outside
    /// managed code, zero otherwise.
    last_java_sp: AtomicU64,
    pending_exception: AtomicU64,
    gate: Arc<SafepointGate>,
}

pub const THREAD_STATE_OFFSET: i32 = offset_of!(ManagedThread, state) as i32;
pub const THREAD_ENV_OFFSET: i32 = offset_of!(ManagedThread, env) as i32;
pub const THREAD_LAST_JAVA_SP_OFFSET: i32 = offset_of!(ManagedThread, last_java_sp) as i32;

impl ManagedThread {
    /// Threads are boxed so that their address stays fixed while generated
    /// code holds it.
    pub fn new(gate: Arc<SafepointGate>, env: u64) -> Box<Self> {
        Box::new(Self {
            state: AtomicU32::new(ThreadState::New as u32),
            _pad: 0,
            env,
            last_java_sp: AtomicU64::new(0),
            pending_exception: AtomicU64::new(0),
            gate,
        })
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn env_address(&self) -> u64 {
        &self.env as *const u64 as u64
    }

    pub fn last_java_sp(&self) -> u64 {
        self.last_java_sp.load(Ordering::Acquire)
    }

    pub fn pending_exception(&self) -> u64 {
        self.pending_exception.load(Ordering::Acquire)
    }

    pub fn set_pending_exception(&self, exception: u64) {
        self.pending_exception.store(exception, Ordering::Release);
    }

    /// Leave native code: announce the transition, wait out any pause, and
    /// re-enter managed code.
    pub fn return_from_native(&self) {
        self.set_state(ThreadState::InNativeTrans);
        if self.gate.is_paused() {
            self.set_state(ThreadState::Blocked);
            self.gate.block_while_paused();
        }
        self.set_state(ThreadState::InJava);
    }
}

/// Called by native wrappers after the native function returns.
///
/// # Safety
/// `thread` must point to a live [`ManagedThread`] owned by the caller.
pub unsafe extern "C" fn transition_from_native(thread: *mut ManagedThread) {
    if let Some(thread) = unsafe { thread.as_ref() } {
        thread.return_from_native();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_offsets_are_stable() {
        assert_eq!(THREAD_STATE_OFFSET, 0);
        assert_eq!(THREAD_ENV_OFFSET, 8);
        assert_eq!(THREAD_LAST_JAVA_SP_OFFSET, 16);
    }

    #[test]
    fn test_return_from_native_without_pause() {
        let thread = ManagedThread::new(SafepointGate::new(), 0);
        thread.set_state(ThreadState::InNative);
        unsafe { transition_from_native(&*thread as *const _ as *mut _) };
        assert_eq!(thread.state(), ThreadState::InJava);
    }

    #[test]
    fn test_return_from_native_blocks_during_pause() {
        let gate = SafepointGate::new();
        let thread = ManagedThread::new(gate.clone(), 0);
        thread.set_state(ThreadState::InNative);
        gate.begin_pause();

        let handle = thread::spawn(move || {
            thread.return_from_native();
            thread.state()
        });

        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        gate.end_pause();
        assert_eq!(handle.join().unwrap(), ThreadState::InJava);
    }

    #[test]
    fn test_env_address_points_into_thread() {
        let thread = ManagedThread::new(SafepointGate::new(), 0xABCD);
        let base = &*thread as *const ManagedThread as u64;
        assert_eq!(thread.env_address(), base + THREAD_ENV_OFFSET as u64);
    }
}
