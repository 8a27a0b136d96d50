//! Per-buffer reservation: access-window lock, poll edge and fences
//!
//! States are Unlocked, LockedRead(n) and LockedWrite. Readers share, a
//! writer is exclusive. Callers that wait take a ticket and are granted
//! strictly in ticket order; readers at the head of the queue are granted
//! together. A non-waiting request is refused while anyone is queued, so a
//! steady stream of readers cannot starve a queued writer.
//!
//! Windows taken through a fence belong to that fence: only releasing the
//! fence gives them back, a plain unlock cannot.

use crate::access::DmaBufAccess;
use crate::fence::{FenceEntry, FenceHandle, FenceTable, DEFAULT_FENCE_CAPACITY};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::ops::BitOr;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Poll readiness bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollMask(u16);

impl PollMask {
    pub const POLLIN: PollMask = PollMask(0x0001);
    pub const POLLOUT: PollMask = PollMask(0x0004);
    pub const POLLERR: PollMask = PollMask(0x0008);

    /// Nothing ready yet
    pub const fn empty() -> Self {
        PollMask(0)
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, other: PollMask) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PollMask {
    type Output = PollMask;

    fn bitor(self, rhs: PollMask) -> PollMask {
        PollMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Held {
    Read(usize),
    Write,
}

struct Waiter {
    ticket: u64,
    access: DmaBufAccess,
}

struct ResvState {
    held: Option<Held>,
    poll_event: bool,
    polled: bool,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
    fences: FenceTable,
    /// Held windows owned by fences
    fenced: usize,
}

impl ResvState {
    fn can_grant(&self, access: DmaBufAccess) -> bool {
        matches!(
            (self.held, access),
            (None, _) | (Some(Held::Read(_)), DmaBufAccess::Read)
        )
    }

    fn grant(&mut self, access: DmaBufAccess) {
        self.held = match (self.held, access) {
            (Some(Held::Read(n)), DmaBufAccess::Read) => Some(Held::Read(n + 1)),
            (_, DmaBufAccess::Read) => Some(Held::Read(1)),
            (_, DmaBufAccess::Write) => Some(Held::Write),
        };
    }

    /// Undo a grant nobody used; no poll edge
    fn ungrant(&mut self) {
        self.held = match self.held {
            Some(Held::Read(n)) if n > 1 => Some(Held::Read(n - 1)),
            _ => None,
        };
    }

    fn windows(&self) -> usize {
        match self.held {
            Some(Held::Read(n)) => n,
            Some(Held::Write) => 1,
            None => 0,
        }
    }

    fn poll(&mut self) -> PollMask {
        self.polled = true;
        if self.poll_event {
            self.poll_event = false;
            return PollMask::POLLIN | PollMask::POLLOUT;
        }
        if self.held.is_none() {
            return PollMask::POLLERR;
        }
        PollMask::empty()
    }
}

/// Reservation state owned by one buffer
pub struct Reservation {
    state: Mutex<ResvState>,
    cond: Condvar,
}

impl Reservation {
    /// Unlocked, no pending edge, no waiters
    pub fn new() -> Self {
        Self::with_fence_capacity(DEFAULT_FENCE_CAPACITY)
    }

    /// Like [`Reservation::new`], with room for `capacity` outstanding fences
    pub fn with_fence_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(ResvState {
                held: None,
                poll_event: false,
                polled: false,
                next_ticket: 0,
                waiters: VecDeque::new(),
                fences: FenceTable::with_capacity(capacity),
                fenced: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Whether any access window is held
    pub fn is_locked(&self) -> bool {
        self.state.lock().held.is_some()
    }

    /// Access type currently held
    pub fn access(&self) -> Option<DmaBufAccess> {
        match self.state.lock().held {
            Some(Held::Read(_)) => Some(DmaBufAccess::Read),
            Some(Held::Write) => Some(DmaBufAccess::Write),
            None => None,
        }
    }

    /// Number of read windows held
    pub fn readers(&self) -> usize {
        match self.state.lock().held {
            Some(Held::Read(n)) => n,
            _ => 0,
        }
    }

    /// Number of callers queued for the lock
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether someone polled since the last unlock
    pub fn is_polled(&self) -> bool {
        self.state.lock().polled
    }

    /// Number of outstanding fences
    pub fn fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Take an access window
    ///
    /// With `wait` false a busy buffer fails with `WouldBlock`; otherwise the
    /// caller sleeps until its turn.
    pub fn lock(&self, access: DmaBufAccess, wait: bool) -> Result<()> {
        let mut st = self.state.lock();
        if st.waiters.is_empty() && st.can_grant(access) {
            st.grant(access);
            return Ok(());
        }
        if !wait {
            return Err(Error::WouldBlock);
        }
        self.wait_for_grant(&mut st, access, None)
    }

    /// Take an access window, giving up after `timeout`
    ///
    /// A timed-out caller leaves the queue without affecting anyone else.
    pub fn lock_timeout(&self, access: DmaBufAccess, timeout: Duration) -> Result<()> {
        self.lock_until(access, Instant::now() + timeout)
    }

    pub(crate) fn lock_until(&self, access: DmaBufAccess, deadline: Instant) -> Result<()> {
        let mut st = self.state.lock();
        if st.waiters.is_empty() && st.can_grant(access) {
            st.grant(access);
            return Ok(());
        }
        self.wait_for_grant(&mut st, access, Some(deadline))
    }

    fn wait_for_grant(
        &self,
        st: &mut MutexGuard<'_, ResvState>,
        access: DmaBufAccess,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.waiters.push_back(Waiter { ticket, access });

        loop {
            let at_head = st.waiters.front().map(|w| w.ticket) == Some(ticket);
            if at_head && st.can_grant(access) {
                st.waiters.pop_front();
                st.grant(access);
                // the next waiter may be a reader that can share
                self.cond.notify_all();
                return Ok(());
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    st.waiters.retain(|w| w.ticket != ticket);
                    self.cond.notify_all();
                    debug!("lock wait for {:?} timed out", access);
                    return Err(Error::TimedOut);
                }
                Some(deadline) => {
                    self.cond.wait_until(st, deadline);
                }
                None => self.cond.wait(st),
            }
        }
    }

    /// Release one access window and signal the poll edge
    ///
    /// Windows owned by fences are refused with `InvalidState`; they go back
    /// through [`Reservation::release_fence`].
    pub fn unlock(&self) -> Result<()> {
        let mut st = self.state.lock();
        if st.held.is_some() && st.windows() <= st.fenced {
            warn!("unlock of a window held by {} fence(s)", st.fenced);
            return Err(Error::InvalidState("window is held by a fence".into()));
        }
        self.release_locked(&mut st)
    }

    fn release_locked(&self, st: &mut MutexGuard<'_, ResvState>) -> Result<()> {
        st.held = match st.held {
            None => {
                error!("unlock of unlocked reservation");
                return Err(Error::InvalidState("reservation is not locked".into()));
            }
            Some(Held::Read(n)) if n > 1 => Some(Held::Read(n - 1)),
            Some(_) => None,
        };
        st.poll_event = true;
        st.polled = false;
        self.cond.notify_all();
        Ok(())
    }

    /// Edge-triggered readiness
    ///
    /// Reports `POLLIN | POLLOUT` once after each unlock, `POLLERR` when
    /// nothing holds the buffer and no edge is pending, and empty while a
    /// window is held.
    pub fn poll(&self) -> PollMask {
        self.state.lock().poll()
    }

    /// Like [`Reservation::poll`], but sleep up to `timeout` for an edge
    pub fn poll_wait(&self, timeout: Duration) -> PollMask {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        loop {
            let mask = st.poll();
            if !mask.is_empty() || Instant::now() >= deadline {
                return mask;
            }
            self.cond.wait_until(&mut st, deadline);
        }
    }

    /// Take a window (waiting) and bind it to a new fence handle
    pub fn acquire_fence(&self, access: DmaBufAccess, owner: &'static str) -> Result<FenceHandle> {
        let mut st = self.state.lock();
        if !st.fences.has_room() {
            warn!("fence table full");
            return Err(Error::ResourceExhausted);
        }
        if !(st.waiters.is_empty() && st.can_grant(access)) {
            self.wait_for_grant(&mut st, access, None)?;
        } else {
            st.grant(access);
        }
        // the table may have filled while this caller slept
        match st.fences.insert(FenceEntry { access, owner }) {
            Ok(handle) => {
                st.fenced += 1;
                debug!("{} acquired {:?} fence {:#x}", owner, access, handle.raw());
                Ok(handle)
            }
            Err(e) => {
                warn!("{}: fence table filled while waiting", owner);
                st.ungrant();
                self.cond.notify_all();
                Err(e)
            }
        }
    }

    /// Release the window bound to `raw` and drop the fence
    pub fn release_fence(&self, raw: u64) -> Result<()> {
        let handle = FenceHandle::from_raw(raw).ok_or(Error::Fault)?;
        let mut st = self.state.lock();
        if st.fences.remove(handle).is_none() {
            warn!("release of unknown fence {:#x}", raw);
            return Err(Error::Fault);
        }
        st.fenced = st.fenced.saturating_sub(1);
        self.release_locked(&mut st)?;
        debug!("released fence {:#x}", raw);
        Ok(())
    }

    /// Teardown check when the owning buffer goes away
    pub(crate) fn fini(&self, buf_id: u64) {
        let st = self.state.lock();
        if st.held.is_some() {
            warn!("dma-buf {}: released while locked ({:?})", buf_id, st.held);
        }
        if !st.fences.is_empty() {
            warn!("dma-buf {}: released with {} fence(s)", buf_id, st.fences.len());
        }
    }
}

impl Default for Reservation {
    fn default() -> Self {
        Self::new()
    }
}
