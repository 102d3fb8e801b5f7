//! Condition variable shared between processes.
//!
//! One semaphore plus a 64-bit set of notification indices. A notifier sets
//! its bit and posts; a listener waits on the semaphore and then takes the
//! whole set at once. Several notifications may collapse into one wake-up
//! and a wake-up may find the set empty (its bits were taken by an earlier
//! call), so listeners always re-check their condition.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use shm_primitives::{
    RelativePointerData, SegmentOwner, SegmentRegistry, SemaphoreWait, ShmSemaphore,
};

/// Number of distinct notification indices.
pub const MAX_NOTIFIERS: u32 = 64;

/// Condition variable state in shared memory (64 bytes).
#[repr(C, align(64))]
pub struct ConditionVariableData {
    semaphore: ShmSemaphore,
    active_notifications: AtomicU64,
    to_be_destroyed: AtomicU32,
    _pad: [u8; 44],
}

static_assertions::const_assert_eq!(size_of::<ConditionVariableData>(), 64);

impl Default for ConditionVariableData {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionVariableData {
    pub const fn new() -> Self {
        Self {
            semaphore: ShmSemaphore::new(0),
            active_notifications: AtomicU64::new(0),
            to_be_destroyed: AtomicU32::new(0),
            _pad: [0; 44],
        }
    }

    /// Initialize in place.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes and unused by anyone else.
    pub unsafe fn init(this: *mut Self) {
        unsafe { this.write(Self::new()) };
    }
}

/// Set of fired notification indices.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationSet(u64);

impl NotificationSet {
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub const fn contains(self, index: u32) -> bool {
        index < MAX_NOTIFIERS && self.0 & (1 << index) != 0
    }

    /// Fired indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros();
            bits &= bits - 1;
            Some(index)
        })
    }
}

impl fmt::Debug for NotificationSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Outcome of [`ConditionListener::timed_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified(NotificationSet),
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionError {
    /// Notification index not below [`MAX_NOTIFIERS`].
    IndexOutOfRange { index: u32 },
    /// The relative pointer does not name a condition variable.
    Unresolvable,
    /// The underlying semaphore wait failed.
    Wait(std::io::ErrorKind),
}

impl fmt::Display for ConditionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexOutOfRange { index } => {
                write!(f, "notification index {index} exceeds {}", MAX_NOTIFIERS - 1)
            }
            Self::Unresolvable => write!(f, "condition variable pointer does not resolve"),
            Self::Wait(kind) => write!(f, "semaphore wait failed: {kind}"),
        }
    }
}

impl std::error::Error for ConditionError {}

/// A condition variable living in a mapped segment. Keeps the segment
/// mapped while it exists.
#[derive(Clone)]
pub struct ConditionVariable {
    data: NonNull<ConditionVariableData>,
    relative: RelativePointerData,
    _owner: Option<SegmentOwner>,
}

// SAFETY: the shared state is only touched through atomics.
unsafe impl Send for ConditionVariable {}
unsafe impl Sync for ConditionVariable {}

impl ConditionVariable {
    /// Resolve a condition variable by relative pointer.
    ///
    /// # Safety
    ///
    /// `relative` must name an initialized [`ConditionVariableData`]. If its
    /// segment was registered without an owner, it must also stay mapped
    /// while the returned view is used.
    pub unsafe fn from_relative(
        registry: &SegmentRegistry,
        relative: RelativePointerData,
    ) -> Result<Self, ConditionError> {
        let owner = registry
            .owner(relative.id())
            .map_err(|_| ConditionError::Unresolvable)?;
        let data = registry
            .resolve::<ConditionVariableData>(relative)
            .ok_or(ConditionError::Unresolvable)?;
        Ok(Self {
            data,
            relative,
            _owner: owner,
        })
    }

    #[inline]
    fn data(&self) -> &ConditionVariableData {
        unsafe { self.data.as_ref() }
    }

    #[inline]
    pub fn relative(&self) -> RelativePointerData {
        self.relative
    }

    pub fn notifier(&self, index: u32) -> Result<ConditionNotifier<'_>, ConditionError> {
        ConditionNotifier::new(self.data(), index)
    }

    pub fn listener(&self) -> ConditionListener<'_> {
        ConditionListener::new(self.data())
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("relative", &self.relative)
            .finish()
    }
}

/// Signals one notification index.
pub struct ConditionNotifier<'a> {
    data: &'a ConditionVariableData,
    index: u32,
}

impl<'a> ConditionNotifier<'a> {
    pub fn new(data: &'a ConditionVariableData, index: u32) -> Result<Self, ConditionError> {
        if index >= MAX_NOTIFIERS {
            return Err(ConditionError::IndexOutOfRange { index });
        }
        Ok(Self { data, index })
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Mark the index fired and wake the listener.
    pub fn notify(&self) {
        self.data
            .active_notifications
            .fetch_or(1 << self.index, Ordering::Release);
        // A saturated semaphore already guarantees the next wait returns.
        if self.data.semaphore.post().is_err() {
            tracing::trace!(index = self.index, "condition semaphore saturated");
        }
    }
}

/// Waits for notifications. One listener per condition variable.
pub struct ConditionListener<'a> {
    data: &'a ConditionVariableData,
}

impl<'a> ConditionListener<'a> {
    pub fn new(data: &'a ConditionVariableData) -> Self {
        Self { data }
    }

    #[inline]
    fn take(&self) -> NotificationSet {
        NotificationSet(self.data.active_notifications.swap(0, Ordering::AcqRel))
    }

    #[inline]
    fn is_destroyed(&self) -> bool {
        self.data.to_be_destroyed.load(Ordering::Acquire) != 0
    }

    /// Whether any notification is pending, without consuming it.
    pub fn was_notified(&self) -> bool {
        self.data.active_notifications.load(Ordering::Acquire) != 0
    }

    /// Block until notified and take the fired set, possibly empty.
    ///
    /// Returns an empty set right away once [`destroy`](Self::destroy) was
    /// called.
    pub fn wait(&self) -> Result<NotificationSet, ConditionError> {
        if self.is_destroyed() {
            return Ok(NotificationSet::default());
        }
        self.data
            .semaphore
            .wait()
            .map_err(|e| ConditionError::Wait(e.kind()))?;
        Ok(self.take())
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn timed_wait(&self, timeout: Duration) -> Result<WaitOutcome, ConditionError> {
        if self.is_destroyed() {
            return Ok(WaitOutcome::Notified(NotificationSet::default()));
        }
        match self
            .data
            .semaphore
            .timed_wait(timeout)
            .map_err(|e| ConditionError::Wait(e.kind()))?
        {
            SemaphoreWait::Acquired => Ok(WaitOutcome::Notified(self.take())),
            SemaphoreWait::TimedOut => {
                // Bits set by a notifier whose post raced the deadline.
                let pending = self.take();
                if pending.is_empty() {
                    Ok(WaitOutcome::Timeout)
                } else {
                    Ok(WaitOutcome::Notified(pending))
                }
            }
        }
    }

    /// Block until at least one index fired, absorbing spurious wake-ups.
    /// Returns an empty set only after [`destroy`](Self::destroy).
    pub fn wait_for_notification(&self) -> Result<NotificationSet, ConditionError> {
        loop {
            let fired = self.wait()?;
            if !fired.is_empty() || self.is_destroyed() {
                return Ok(fired);
            }
        }
    }

    /// Take pending notifications without blocking.
    pub fn try_take(&self) -> NotificationSet {
        if self.data.semaphore.try_wait() || self.was_notified() {
            self.take()
        } else {
            NotificationSet::default()
        }
    }

    /// Wake a blocked waiter and make every later wait return immediately.
    pub fn destroy(&self) {
        self.data.to_be_destroyed.store(1, Ordering::Release);
        // A saturated semaphore still wakes the waiter, which then sees the flag.
        if let Err(e) = self.data.semaphore.post() {
            tracing::warn!(error = %e, "condition destroy could not post");
        }
    }
}
