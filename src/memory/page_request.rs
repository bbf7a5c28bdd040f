use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;
use core::sync::atomic::Ordering;

use super::page_source::PageSource;
use super::status::{Error, Result, EINVAL};
use crate::sync::Event;

int_like!(RequestId, AtomicRequestId, u64, AtomicU64);

static NEXT_REQUEST_ID: AtomicRequestId = AtomicRequestId::new(RequestId::new(1));

impl RequestId {
    /// Every activation of a [`PageRequest`] gets a fresh id, so a stale link
    /// can never be mistaken for whatever reuses its slot later.
    pub fn next() -> RequestId {
        NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageRequestType {
    /// Fetch missing content.
    Read = 0,
    /// Ask permission to let clean pages become dirty.
    Dirty = 1,
    /// Flush dirty content back to the backing store.
    Writeback = 2,
}

impl PageRequestType {
    pub const COUNT: usize = 3;
    pub const ALL: [PageRequestType; PageRequestType::COUNT] = [
        PageRequestType::Read,
        PageRequestType::Dirty,
        PageRequestType::Writeback,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Identifies the VM object behind a request, for diagnostics only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmoDebugInfo {
    pub vmo_id: u64,
}

/// What a [`PageRequest`] needs from whatever is tracking it.
///
/// Both calls may be made without holding any lock; implementations take the
/// locks they need themselves.
pub trait PageRequestInterface: Send + Sync {
    /// Stop tracking `request`. Returns false if it was no longer tracked,
    /// typically because a resolution got to it first.
    fn cancel_request(&self, request: &PageRequest) -> bool;

    /// Block until `request` is resolved or the waiting thread is interrupted.
    fn wait_on_request(&self, request: &PageRequest, suspendable: bool) -> Result<()>;
}

/// Where an active request lives. Written only by its owner, from inside the
/// page source calls it passes the request to.
#[derive(Clone)]
pub(crate) struct RequestLink {
    pub(crate) src: Arc<dyn PageRequestInterface>,
    pub(crate) key: usize,
    pub(crate) id: RequestId,
    pub(crate) ty: PageRequestType,
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

impl RequestLink {
    pub(crate) fn is_from(&self, src: &PageSource) -> bool {
        Arc::as_ptr(&self.src) as *const () == src as *const PageSource as *const ()
    }
}

/// A caller-owned request for a range of pages.
///
/// Usually lives on the stack of a faulting thread. It is populated by
/// [`PageSource::get_pages`] and friends, waited on, and then reused or
/// dropped; dropping an active request cancels it. The page source never
/// holds on to the request itself, only to its event.
pub struct PageRequest {
    early_wake: bool,
    event: Arc<Event>,
    link: Option<RequestLink>,
}

impl PageRequest {
    /// With `early_wake`, [`PageRequest::wait`] returns as soon as the pages
    /// at the request's current wake offset are available, rather than when
    /// the whole range is.
    pub fn new(early_wake: bool) -> PageRequest {
        PageRequest {
            early_wake,
            event: Arc::new(Event::new()),
            link: None,
        }
    }

    pub fn early_wake(&self) -> bool {
        self.early_wake
    }

    /// Whether the request was populated and not cancelled since. A request
    /// that completed stays linked until it is reused or cancelled, so this
    /// is only a hint; the page source checks for real under its lock.
    pub fn is_active_hint(&self) -> bool {
        self.link.is_some()
    }

    pub fn request_type(&self) -> Option<PageRequestType> {
        self.link.as_ref().map(|link| link.ty)
    }

    /// Range as last populated, after any trimming the page source applied.
    ///
    /// This is the part the caller is waiting for. If the request it rode on
    /// is cancelled, this request takes over that request's whole round trip
    /// with the provider, but the range reported here does not grow with it.
    pub fn range(&self) -> Option<Range<u64>> {
        self.link.as_ref().map(|link| link.offset..link.offset + link.len)
    }

    pub fn offset(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.offset)
    }

    pub fn len(&self) -> Option<u64> {
        self.link.as_ref().map(|link| link.len)
    }

    /// Block until the request is resolved.
    ///
    /// `Ok` means some or all of the range was supplied; the caller has to
    /// look at the object again to find out how much. Otherwise this returns
    /// the provider's failure code, `INTR_KILLED`, or `INTR_RETRY` if the
    /// thread got suspended and `suspendable` is set. On anything that is not
    /// a provider failure the request is cancelled before returning.
    pub fn wait(&mut self, suspendable: bool) -> Result<()> {
        let src = match self.link.as_ref() {
            Some(link) => Arc::clone(&link.src),
            None => {
                debug_assert!(false, "waiting on a page request that was never populated");
                return Err(Error::new(EINVAL));
            }
        };

        let status = src.wait_on_request(self, suspendable);
        if let Err(ref err) = status {
            if !PageSource::is_valid_internal_failure_code(err.errno) {
                self.cancel_request();
            }
        }
        status
    }

    /// Abort the request. Safe to race with a resolution on another thread;
    /// returns true if the cancellation took effect, false if the request had
    /// already been resolved (or was never active).
    pub fn cancel_request(&mut self) -> bool {
        let src = self.link.as_ref().map(|link| Arc::clone(&link.src));
        let cancelled = match src {
            Some(src) => src.cancel_request(self),
            None => false,
        };
        self.link = None;
        cancelled
    }

    pub(crate) fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub(crate) fn link(&self) -> Option<&RequestLink> {
        self.link.as_ref()
    }

    pub(crate) fn set_link(&mut self, link: RequestLink) {
        self.link = Some(link);
    }

    pub(crate) fn clear_link(&mut self) {
        self.link = None;
    }
}

impl Drop for PageRequest {
    fn drop(&mut self) {
        self.cancel_request();
    }
}

impl fmt::Debug for PageRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.link.as_ref() {
            Some(link) => write!(
                f,
                "PageRequest({:?} {:?} {:#x}..{:#x})",
                link.id,
                link.ty,
                link.offset,
                link.offset + link.len
            ),
            None => write!(f, "PageRequest(inactive)"),
        }
    }
}
