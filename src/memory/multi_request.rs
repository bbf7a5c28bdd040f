//! Per-fault holders for the different kinds of request a fault can end in.
//!
//! A single fault attempt ends in at most one of: waiting for free memory,
//! waiting for a read, or waiting for a dirty transition. The fault path
//! picks the matching request, populates it, and the caller waits on the
//! whole [`MultiPageRequest`] without having to know which one it was.

use alloc::sync::Arc;

use super::page_request::PageRequest;
use super::status::{Error, Result, EINVAL};

/// Blocks a thread until retrying a failed page allocation is worthwhile.
pub trait FreeMemoryWait: Send + Sync {
    fn wait_till_should_retry(&self) -> Result<()>;
}

/// Request to wait for free memory. Only records that the wait is needed.
#[derive(Default)]
pub struct AnonymousPageRequest {
    waiter: Option<Arc<dyn FreeMemoryWait>>,
}

impl AnonymousPageRequest {
    pub fn new() -> AnonymousPageRequest {
        AnonymousPageRequest::default()
    }

    pub fn make_active(&mut self, waiter: Arc<dyn FreeMemoryWait>) {
        debug_assert!(!self.is_active());
        self.waiter = Some(waiter);
    }

    pub fn is_active(&self) -> bool {
        self.waiter.is_some()
    }

    pub fn cancel(&mut self) {
        self.waiter = None;
    }

    /// Wait for memory to free up. Deactivates the request either way.
    pub fn wait(&mut self) -> Result<()> {
        match self.waiter.take() {
            Some(waiter) => waiter.wait_till_should_retry(),
            None => {
                debug_assert!(false, "waiting on an inactive anonymous request");
                Err(Error::new(EINVAL))
            }
        }
    }
}

/// A [`PageRequest`] that is only constructed once somebody asks for it.
pub struct LazyPageRequest {
    early_wake: bool,
    request: Option<PageRequest>,
}

impl LazyPageRequest {
    pub fn new(early_wake: bool) -> LazyPageRequest {
        LazyPageRequest {
            early_wake,
            request: None,
        }
    }

    pub fn get(&mut self) -> &mut PageRequest {
        let early_wake = self.early_wake;
        self.request.get_or_insert_with(|| PageRequest::new(early_wake))
    }

    pub fn is_initialized(&self) -> bool {
        self.request.is_some()
    }

    fn get_initialized(&mut self) -> Option<&mut PageRequest> {
        self.request.as_mut()
    }
}

pub struct MultiPageRequest {
    anonymous: AnonymousPageRequest,
    read: PageRequest,
    read_active: bool,
    dirty: LazyPageRequest,
    dirty_active: bool,
}

impl MultiPageRequest {
    pub fn new(early_wake: bool) -> MultiPageRequest {
        MultiPageRequest {
            anonymous: AnonymousPageRequest::new(),
            read: PageRequest::new(early_wake),
            read_active: false,
            dirty: LazyPageRequest::new(early_wake),
            dirty_active: false,
        }
    }

    pub fn get_anonymous(&mut self) -> &mut AnonymousPageRequest {
        debug_assert!(self.no_request_active());
        &mut self.anonymous
    }

    pub fn get_read_request(&mut self) -> &mut PageRequest {
        debug_assert!(self.no_request_active());
        self.read_active = true;
        &mut self.read
    }

    /// The dirty request is only counted once [`MultiPageRequest::made_dirty_request`]
    /// says it was populated; asking for it is not enough.
    pub fn get_lazy_dirty_request(&mut self) -> &mut LazyPageRequest {
        debug_assert!(self.no_request_active());
        &mut self.dirty
    }

    pub fn made_dirty_request(&mut self) {
        debug_assert!(self.dirty.is_initialized());
        debug_assert!(self.no_request_active());
        self.dirty_active = true;
    }

    /// Wait on whichever request the fault populated.
    pub fn wait(&mut self, suspendable: bool) -> Result<()> {
        if self.anonymous.is_active() {
            debug_assert!(!self.read_active && !self.dirty_active);
            return self.anonymous.wait();
        }
        if self.dirty_active {
            debug_assert!(!self.read_active);
            self.dirty_active = false;
            return match self.dirty.get_initialized() {
                Some(request) => request.wait(suspendable),
                None => Err(Error::new(EINVAL)),
            };
        }
        debug_assert!(self.read_active, "waiting on a multi-page request nothing populated");
        self.read_active = false;
        self.read.wait(suspendable)
    }

    pub fn cancel_requests(&mut self) {
        self.anonymous.cancel();
        self.read.cancel_request();
        self.read_active = false;
        if let Some(dirty) = self.dirty.get_initialized() {
            dirty.cancel_request();
        }
        self.dirty_active = false;
    }

    pub fn no_request_active(&self) -> bool {
        !self.anonymous.is_active() && !self.read_active && !self.dirty_active
    }
}
