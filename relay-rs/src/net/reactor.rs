//! Readiness-driven event loop
//!
//! The reactor wraps one `mio::Poll` and a table of handlers keyed by raw
//! descriptor. Registration is edge-triggered: a handler told its
//! descriptor is readable must read until `WouldBlock`, because no further
//! notification arrives for data that is already waiting.
//!
//! ```text
//!   poll(100ms) ──→ events ──→ take handler out of table
//!        ↑                          │ on_ready(reactor, fd, readiness)
//!        │                          ↓
//!        └──── stop flag? ←── put it back unless it deregistered itself
//! ```
//!
//! A handler is owned by the table. While it runs it is taken out, so it
//! receives `&mut Reactor` and can register, modify or deregister any
//! descriptor including its own. Deregistering its own descriptor removes
//! the table slot; the reactor then drops the handler after the callback
//! returns, which closes its socket only after epoll has forgotten it.

use crate::error::{RelayError, Result};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Upper bound on a single poll so the stop flag is observed promptly
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const MAX_EVENTS: usize = 256;

/// Interest and readiness bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(2);
    pub const ERROR: Interest = Interest(4);

    pub const fn empty() -> Self {
        Interest(0)
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    /// mio always reports errors and cannot register an empty set, so an
    /// interest without READABLE or WRITABLE is registered as READABLE
    fn to_mio(self) -> mio::Interest {
        match (self.is_readable(), self.is_writable()) {
            (_, false) => mio::Interest::READABLE,
            (false, true) => mio::Interest::WRITABLE,
            (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }

    fn from_event(event: &Event) -> Interest {
        let mut readiness = Interest::empty();
        if event.is_readable() || event.is_read_closed() {
            readiness = readiness | Interest::READABLE;
        }
        if event.is_writable() {
            readiness = readiness | Interest::WRITABLE;
        }
        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            readiness = readiness | Interest::ERROR;
        }
        readiness
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Readiness reported to a handler uses the same bits as interest
pub type Readiness = Interest;

/// Callback target for one registered descriptor
pub trait EventHandler {
    fn on_ready(&mut self, reactor: &mut Reactor, fd: RawFd, readiness: Readiness);
}

struct Slot {
    interest: Interest,
    /// `None` while the handler is running
    handler: Option<Box<dyn EventHandler>>,
}

/// Thread-safe handle that makes [`Reactor::run`] return
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct Reactor {
    poll: Poll,
    table: HashMap<RawFd, Slot>,
    stop: StopHandle,
}

impl Reactor {
    pub fn new(stop: StopHandle) -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            table: HashMap::new(),
            stop,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.table.contains_key(&fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.table.get(&fd).map(|slot| slot.interest)
    }

    /// Start watching `fd` with edge-triggered semantics
    ///
    /// # Errors
    /// [`RelayError::AlreadyRegistered`] if `fd` is in the table already;
    /// registering twice never yields duplicate notifications.
    pub fn register(
        &mut self,
        fd: RawFd,
        interest: Interest,
        handler: Box<dyn EventHandler>,
    ) -> Result<()> {
        if self.table.contains_key(&fd) {
            return Err(RelayError::AlreadyRegistered(fd));
        }

        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token(fd), interest.to_mio())?;
        self.table.insert(
            fd,
            Slot {
                interest,
                handler: Some(handler),
            },
        );
        trace!("Registered fd {} with {:?}", fd, interest);
        Ok(())
    }

    /// Change the interest set of a registered descriptor
    pub fn modify(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        let slot = self
            .table
            .get_mut(&fd)
            .ok_or(RelayError::NotRegistered(fd))?;
        if slot.interest == interest {
            return Ok(());
        }

        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), token(fd), interest.to_mio())?;
        slot.interest = interest;
        trace!("Modified fd {} to {:?}", fd, interest);
        Ok(())
    }

    /// Stop watching `fd`
    ///
    /// Unknown descriptors are not an error. Returns the handler unless it
    /// is the one currently running, in which case the reactor drops it once
    /// its callback returns.
    pub fn deregister(&mut self, fd: RawFd) -> Option<Box<dyn EventHandler>> {
        let slot = self.table.remove(&fd)?;
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!("Deregistering fd {} failed: {}", fd, e);
            }
        }
        trace!("Deregistered fd {}", fd);
        slot.handler
    }

    /// Dispatch events until [`StopHandle::stop`] is called
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut ready: Vec<(RawFd, Readiness)> = Vec::with_capacity(MAX_EVENTS);

        debug!("Reactor running");
        while !self.stop.is_stopped() {
            self.turn(&mut events, &mut ready, Some(POLL_TIMEOUT))?;
        }
        debug!("Reactor stopped");
        Ok(())
    }

    /// Poll once and dispatch whatever is ready
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut ready = Vec::new();
        self.turn(&mut events, &mut ready, timeout)
    }

    fn turn(
        &mut self,
        events: &mut Events,
        ready: &mut Vec<(RawFd, Readiness)>,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        ready.clear();
        ready.extend(
            events
                .iter()
                .map(|event| (event.token().0 as RawFd, Interest::from_event(event))),
        );

        let count = ready.len();
        for (fd, readiness) in ready.drain(..) {
            self.dispatch(fd, readiness);
        }
        Ok(count)
    }

    fn dispatch(&mut self, fd: RawFd, readiness: Readiness) {
        // A handler earlier in this batch may have deregistered `fd`
        let Some(mut handler) = self.table.get_mut(&fd).and_then(|slot| slot.handler.take())
        else {
            trace!("Dropping stale event for fd {}", fd);
            return;
        };

        handler.on_ready(self, fd, readiness);

        match self.table.get_mut(&fd) {
            Some(slot) if slot.handler.is_none() => slot.handler = Some(handler),
            _ => drop(handler),
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let fds: Vec<RawFd> = self.table.keys().copied().collect();
        for fd in fds {
            drop(self.deregister(fd));
        }
    }
}

fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}
