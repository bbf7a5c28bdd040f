//! Tracking of outstanding page requests.
//!
//! A [`PageSource`] sits between VM objects that need pages and the
//! [`PageProvider`] that produces them. Faulting threads populate their own
//! [`PageRequest`]s through it; the source makes sure that any byte range is
//! only ever in flight at the provider once, chains latecomers onto the
//! request that is already in flight, and wakes everybody when the provider
//! reports the range resolved.
//!
//! Requests the provider owns are kept in one ordered map per request type,
//! keyed by their *end* offset. The first entry with a key greater than some
//! offset is then the only candidate that can contain it, which is what both
//! the overlap check and resolution rely on. Outstanding requests of one type
//! never overlap each other.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cmp;
use core::mem;
use core::ops::Bound::{Excluded, Unbounded};
use slab::Slab;
use spin::Mutex;

use super::page_provider::{PageProvider, PageSourceProperties, ProviderRequest};
use super::page_request::{
    PageRequest, PageRequestInterface, PageRequestType, RequestId, RequestLink, VmoDebugInfo,
};
use super::status::{
    should_wait, Error, Result, EBADFD, EBADMSG, EINVAL, EIO, ENOBUFS, ENOENT, ENOMEM, ENOSPC,
    EOPNOTSUPP, REQUEST_CANCELED,
};
use super::{is_page_aligned, Frame};

/// Lifecycle of a page source. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourcePhase {
    Attached,
    /// No more reads or dirty transitions; writebacks may still drain.
    Detached,
    /// Nothing is admitted any more.
    Closed,
}

/// How a new range relates to what is already outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ContinuationType {
    /// Nothing outstanding overlaps the range.
    NotContinuation,
    /// The outstanding request `head` already covers the start of the range.
    SameRequest { head: usize },
    /// The start is new, but an outstanding request begins `novel_len` bytes in.
    SameSource { novel_len: u64 },
}

/// How a caller's request relates to the one it is about to populate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reuse {
    /// Not active here. Populate from scratch.
    Fresh,
    /// Still active and the new offset is where it is due to wake next.
    Continue,
    /// Still active here, but for something else.
    Restart,
}

struct TrackedRequest {
    id: RequestId,
    event: Arc<crate::sync::Event>,
    early_wake: bool,
    ty: PageRequestType,
    offset: u64,
    len: u64,
    /// Absolute offset of the next early wake.
    wake_offset: u64,
    /// Bytes still expected from the provider. Only meaningful on heads.
    pending_size: u64,
    vmo_debug_info: VmoDebugInfo,
    /// Set while riding on another request's provider round trip.
    head: Option<usize>,
    /// Requests riding on this one.
    overlap: VecDeque<usize>,
}

impl TrackedRequest {
    fn end(&self) -> u64 {
        self.offset + self.len
    }

    fn provider_view(&self) -> ProviderRequest {
        ProviderRequest {
            id: self.id,
            ty: self.ty,
            offset: self.offset,
            len: self.len,
            vmo_debug_info: self.vmo_debug_info,
        }
    }

    /// Wake an early-wake request whose wake offset falls in `[start, end)`,
    /// and move the wake offset past what was just resolved.
    fn early_wake(&mut self, start: u64, end: u64) {
        if !self.early_wake || self.wake_offset >= self.end() {
            return;
        }
        if start <= self.wake_offset && end > self.wake_offset {
            self.wake_offset = cmp::min(end, self.end());
            self.event.signal(Ok(()));
        }
    }
}

struct SourceState {
    phase: SourcePhase,
    requests: Slab<TrackedRequest>,
    outstanding: [BTreeMap<u64, usize>; PageRequestType::COUNT],
}

impl SourceState {
    fn new() -> SourceState {
        SourceState {
            phase: SourcePhase::Attached,
            requests: Slab::new(),
            outstanding: [BTreeMap::new(), BTreeMap::new(), BTreeMap::new()],
        }
    }

    fn lookup(&self, key: usize, id: RequestId) -> Option<&TrackedRequest> {
        self.requests.get(key).filter(|tracked| tracked.id == id)
    }

    /// First outstanding request of `ty` ending after `offset`.
    fn first_ending_after(&self, ty: PageRequestType, offset: u64) -> Option<usize> {
        self.outstanding[ty.index()]
            .range((Excluded(offset), Unbounded))
            .next()
            .map(|(_, &key)| key)
    }

    fn request_continuation_type_locked(
        &self,
        ty: PageRequestType,
        offset: u64,
        len: u64,
    ) -> ContinuationType {
        let Some(key) = self.first_ending_after(ty, offset) else {
            return ContinuationType::NotContinuation;
        };
        let overlap = &self.requests[key];
        if overlap.offset <= offset {
            ContinuationType::SameRequest { head: key }
        } else if overlap.offset < offset + len {
            ContinuationType::SameSource {
                novel_len: overlap.offset - offset,
            }
        } else {
            ContinuationType::NotContinuation
        }
    }

    fn reuse_locked(&self, request: &PageRequest, ty: PageRequestType, offset: u64) -> Reuse {
        let Some(link) = request.link() else {
            return Reuse::Fresh;
        };
        match self.lookup(link.key, link.id) {
            None => Reuse::Fresh,
            Some(tracked)
                if tracked.ty == ty && offset >= tracked.wake_offset && offset < tracked.end() =>
            {
                Reuse::Continue
            }
            Some(_) => Reuse::Restart,
        }
    }

    /// Run early wake over a head and everything riding on it.
    fn early_wake_request_locked(&mut self, key: usize, start: u64, end: u64) {
        self.requests[key].early_wake(start, end);
        for i in 0..self.requests[key].overlap.len() {
            let waiter = self.requests[key].overlap[i];
            self.requests[waiter].early_wake(start, end);
        }
    }
}

/// Requests [`PageSource::dump`] lists for one type, and how many it leaves out.
fn dump_window(
    tree: &BTreeMap<u64, usize>,
    max_items: usize,
) -> (impl Iterator<Item = usize> + '_, usize) {
    (
        tree.values().copied().take(max_items),
        tree.len().saturating_sub(max_items),
    )
}

fn completion_status(error: Option<i32>) -> Result<()> {
    match error {
        None => Ok(()),
        Some(errno) => Err(Error::new(errno)),
    }
}

pub struct PageSource {
    this: Weak<PageSource>,
    provider: Arc<dyn PageProvider>,
    properties: PageSourceProperties,
    state: Mutex<SourceState>,
    paged_vmo_lock: Mutex<()>,
}

impl PageSource {
    pub fn new(provider: Arc<dyn PageProvider>) -> Arc<PageSource> {
        let properties = provider.properties();
        Arc::new_cyclic(|this| PageSource {
            this: this.clone(),
            provider,
            properties,
            state: Mutex::new(SourceState::new()),
            paged_vmo_lock: Mutex::new(()),
        })
    }

    /// Failure codes an untrusted party (a user pager) may report.
    pub fn is_valid_external_failure_code(error_status: i32) -> bool {
        matches!(error_status, EIO | EBADMSG | EBADFD | ENOSPC | ENOBUFS)
    }

    /// Failure codes a provider inside the kernel may report. Out of memory
    /// is reserved for the kernel and never accepted from outside.
    pub fn is_valid_internal_failure_code(error_status: i32) -> bool {
        error_status == ENOMEM || Self::is_valid_external_failure_code(error_status)
    }

    pub fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    pub fn phase(&self) -> SourcePhase {
        self.state.lock().phase
    }

    /// Lock the owning VMO hierarchy keeps here for its own use. The page
    /// source never takes it.
    pub fn paged_vmo_lock(&self) -> &Mutex<()> {
        &self.paged_vmo_lock
    }

    /// Request `[offset, offset + len)` be read in.
    ///
    /// Returns `SHOULD_WAIT` with `request` populated, possibly for less than
    /// the full range, or `ENOENT` once the source is detached.
    pub fn get_pages(
        &self,
        offset: u64,
        len: u64,
        request: &mut PageRequest,
        vmo_debug_info: VmoDebugInfo,
    ) -> Result<()> {
        self.request_pages(request, offset, len, vmo_debug_info, PageRequestType::Read)
    }

    /// Request permission for `[offset, offset + len)` to become dirty.
    ///
    /// The caller passes only pages that are not dirty yet. Any part of the
    /// range that already has a dirty request in flight is not asked for
    /// again; `request` ends up covering just the part that needs the
    /// provider.
    pub fn request_dirty_transition(
        &self,
        request: &mut PageRequest,
        offset: u64,
        len: u64,
        vmo_debug_info: VmoDebugInfo,
    ) -> Result<()> {
        self.request_pages(request, offset, len, vmo_debug_info, PageRequestType::Dirty)
    }

    /// Request `[offset, offset + len)` be written back. Unlike reads, these
    /// are still admitted after [`PageSource::detach`].
    pub fn request_writeback(
        &self,
        request: &mut PageRequest,
        offset: u64,
        len: u64,
        vmo_debug_info: VmoDebugInfo,
    ) -> Result<()> {
        self.request_pages(request, offset, len, vmo_debug_info, PageRequestType::Writeback)
    }

    fn request_pages(
        &self,
        request: &mut PageRequest,
        offset: u64,
        len: u64,
        vmo_debug_info: VmoDebugInfo,
        ty: PageRequestType,
    ) -> Result<()> {
        debug_assert!(is_page_aligned(offset));
        debug_assert!(is_page_aligned(len));
        if len == 0 || offset.checked_add(len).is_none() {
            return Err(Error::new(EINVAL));
        }
        if !self.properties.supports(ty) {
            return Err(Error::new(EOPNOTSUPP));
        }

        // Still linked to another source: that source's lock has to be taken
        // to cancel it, and never while holding ours.
        if request.link().map_or(false, |link| !link.is_from(self)) {
            request.cancel_request();
        }

        let mut state = self.state.lock();
        let admitted = match ty {
            PageRequestType::Writeback => state.phase != SourcePhase::Closed,
            _ => state.phase == SourcePhase::Attached,
        };
        if !admitted {
            return Err(Error::new(ENOENT));
        }

        match state.reuse_locked(request, ty, offset) {
            Reuse::Continue => {
                log::trace!("page source: {:?} continues at {:#x}", request, offset);
                return Err(should_wait());
            }
            Reuse::Restart => {
                if let Some(link) = request.link() {
                    self.cancel_request_locked(&mut state, link.key, link.id);
                }
                request.clear_link();
            }
            Reuse::Fresh => request.clear_link(),
        }

        self.populate_request_locked(&mut state, request, offset, len, vmo_debug_info, ty)
    }

    fn populate_request_locked(
        &self,
        state: &mut SourceState,
        request: &mut PageRequest,
        offset: u64,
        len: u64,
        vmo_debug_info: VmoDebugInfo,
        ty: PageRequestType,
    ) -> Result<()> {
        debug_assert!(request.link().is_none());
        let src: Arc<dyn PageRequestInterface> =
            self.this.upgrade().ok_or(Error::new(EBADFD))?;

        let id = RequestId::next();
        request.event().unsignal();
        let mut tracked = TrackedRequest {
            id,
            event: Arc::clone(request.event()),
            early_wake: request.early_wake(),
            ty,
            offset,
            len,
            wake_offset: offset,
            pending_size: 0,
            vmo_debug_info,
            head: None,
            overlap: VecDeque::new(),
        };

        let key = match state.request_continuation_type_locked(ty, offset, len) {
            ContinuationType::SameRequest { head } => {
                tracked.len = cmp::min(offset + len, state.requests[head].end()) - offset;
                tracked.head = Some(head);
                log::trace!(
                    "page source: {:?} {:#x}..{:#x} rides on {:?}",
                    ty,
                    offset,
                    tracked.end(),
                    state.requests[head].id
                );
                let key = state.requests.insert(tracked);
                state.requests[head].overlap.push_back(key);
                key
            }
            ContinuationType::SameSource { novel_len } => {
                tracked.len = novel_len;
                self.send_request_to_provider_locked(state, tracked)
            }
            ContinuationType::NotContinuation => {
                self.send_request_to_provider_locked(state, tracked)
            }
        };

        let len = state.requests[key].len;
        request.set_link(RequestLink {
            src,
            key,
            id,
            ty,
            offset,
            len,
        });
        Err(should_wait())
    }

    fn send_request_to_provider_locked(
        &self,
        state: &mut SourceState,
        mut tracked: TrackedRequest,
    ) -> usize {
        debug_assert!(self.properties.supports(tracked.ty));
        tracked.pending_size = tracked.len;
        let view = tracked.provider_view();
        let key = state.requests.insert(tracked);
        let previous = state.outstanding[view.ty.index()].insert(view.end(), key);
        debug_assert!(previous.is_none());

        log::trace!("page source: sending {:?}", view);
        self.provider.send_async_request(view);
        key
    }

    /// Finish a provider-owned request and everything riding on it.
    fn complete_request_locked(&self, state: &mut SourceState, key: usize, error: Option<i32>) {
        let tracked = state.requests.remove(key);
        debug_assert!(tracked.head.is_none());
        debug_assert!(self.properties.supports(tracked.ty));
        state.outstanding[tracked.ty.index()].remove(&tracked.end());

        // Take the request back from the provider before anybody wakes up
        // and starts reusing it.
        self.provider.clear_async_request(tracked.provider_view());

        for waiter in tracked.overlap.iter() {
            let waiter = state.requests.remove(*waiter);
            waiter.event.signal(completion_status(error));
        }
        log::trace!(
            "page source: completed {:?} {:#x}..{:#x} with {:?}",
            tracked.ty,
            tracked.offset,
            tracked.end(),
            error
        );
        tracked.event.signal(completion_status(error));
    }

    fn cancel_request_locked(&self, state: &mut SourceState, key: usize, id: RequestId) -> bool {
        let head = match state.lookup(key, id) {
            Some(tracked) => tracked.head,
            None => return false,
        };

        if let Some(head) = head {
            state.requests[head].overlap.retain(|&waiter| waiter != key);
            state.requests.remove(key);
            return true;
        }

        let mut old = state.requests.remove(key);
        let old_view = old.provider_view();
        match old.overlap.pop_front() {
            Some(successor) => {
                // The first request riding on this one takes over the provider
                // round trip, along with everybody else riding on it.
                let waiters = mem::take(&mut old.overlap);
                for &waiter in waiters.iter() {
                    state.requests[waiter].head = Some(successor);
                }
                let next = &mut state.requests[successor];
                next.head = None;
                next.offset = old.offset;
                next.len = old.len;
                next.pending_size = old.pending_size;
                next.overlap = waiters;
                let new_view = next.provider_view();

                state.outstanding[old.ty.index()].insert(old.end(), successor);
                log::debug!("page source: {:?} hands over to {:?}", old_view, new_view.id);
                self.provider.swap_async_request(old_view, new_view);
            }
            None => {
                state.outstanding[old.ty.index()].remove(&old.end());
                self.provider.clear_async_request(old_view);
            }
        }
        true
    }

    pub fn on_pages_supplied(&self, offset: u64, len: u64) {
        self.resolve_requests(PageRequestType::Read, offset, len);
    }

    pub fn on_pages_dirtied(&self, offset: u64, len: u64) {
        self.resolve_requests(PageRequestType::Dirty, offset, len);
    }

    pub fn on_pages_written_back(&self, offset: u64, len: u64) {
        self.resolve_requests(PageRequestType::Writeback, offset, len);
    }

    /// Count `[offset, offset + len)` as resolved for requests of `ty`.
    ///
    /// Only a remaining byte count is kept per request, so reporting the same
    /// bytes twice completes a request early. Callers retry anyway, so that
    /// costs a redundant round trip and nothing else.
    fn resolve_requests(&self, ty: PageRequestType, offset: u64, len: u64) {
        debug_assert!(len > 0);
        let Some(end) = offset.checked_add(len) else {
            debug_assert!(false, "resolved range overflows");
            return;
        };

        let mut state = self.state.lock();
        let mut cursor = offset;
        while let Some(key) = state.first_ending_after(ty, cursor) {
            let tracked = &mut state.requests[key];
            if tracked.offset >= end {
                break;
            }
            cursor = tracked.end();

            let req_start = cmp::max(offset, tracked.offset);
            let req_end = cmp::min(end, tracked.end());
            let fulfilled = req_end - req_start;

            #[cfg(feature = "trace_requests")]
            log::trace!(
                "page source: {:?} {:#x}..{:#x} resolves {:#x} of {:#x} pending",
                ty,
                req_start,
                req_end,
                fulfilled,
                tracked.pending_size
            );

            if fulfilled < tracked.pending_size {
                tracked.pending_size -= fulfilled;
                state.early_wake_request_locked(key, req_start, req_end);
                continue;
            } else if fulfilled > tracked.pending_size {
                // Part of the range was resolved twice, or decommitted and
                // supplied again. Not an error.
                log::trace!("page source: excessive resolution of {:?}", tracked.id);
            }

            self.complete_request_locked(&mut state, key, None);
        }
    }

    /// Fail every request of any type that intersects `[offset, offset + len)`.
    ///
    /// A failure takes out whole requests, not just the failed part: there is
    /// no way to consume half of one. Rejects codes that
    /// [`PageSource::is_valid_internal_failure_code`] does not admit.
    pub fn on_pages_failed(&self, offset: u64, len: u64, error_status: i32) -> Result<()> {
        if !Self::is_valid_internal_failure_code(error_status) {
            log::warn!(
                "page source: rejecting failure code {} for {:#x}+{:#x}",
                error_status,
                offset,
                len
            );
            return Err(Error::new(EINVAL));
        }
        let end = offset.checked_add(len).ok_or(Error::new(EINVAL))?;

        let mut state = self.state.lock();
        for ty in PageRequestType::ALL {
            if !self.properties.supports(ty) {
                continue;
            }
            while let Some(key) = state.first_ending_after(ty, offset) {
                if state.requests[key].offset >= end {
                    break;
                }
                self.complete_request_locked(&mut state, key, Some(error_status));
            }
        }
        Ok(())
    }

    /// Failure reported from outside the kernel, e.g. by a user pager.
    pub fn fail_pages_external(&self, offset: u64, len: u64, error_status: i32) -> Result<()> {
        if !Self::is_valid_external_failure_code(error_status) {
            return Err(Error::new(EINVAL));
        }
        self.on_pages_failed(offset, len, error_status)
    }

    /// Stop admitting reads and dirty transitions.
    ///
    /// Nothing can supply pages any more, so pending reads and dirty requests
    /// fail right away. Writebacks stay: their data still has to go out.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        self.detach_locked(&mut state);
    }

    fn detach_locked(&self, state: &mut SourceState) {
        if state.phase != SourcePhase::Attached {
            return;
        }
        log::debug!("page source: detaching");
        state.phase = SourcePhase::Detached;

        for ty in [PageRequestType::Read, PageRequestType::Dirty] {
            if self.properties.supports(ty) {
                self.fail_all_locked(state, ty);
            }
        }
        self.provider.on_detach();
    }

    /// Detach if needed, then fail whatever is left.
    pub fn close(&self) {
        let mut state = self.state.lock();
        self.detach_locked(&mut state);
        if state.phase == SourcePhase::Closed {
            return;
        }
        log::debug!("page source: closing");
        state.phase = SourcePhase::Closed;

        for ty in PageRequestType::ALL {
            self.fail_all_locked(&mut state, ty);
        }
        self.provider.on_close();
    }

    fn fail_all_locked(&self, state: &mut SourceState, ty: PageRequestType) {
        while let Some(key) = state.outstanding[ty.index()].values().next().copied() {
            self.complete_request_locked(state, key, Some(REQUEST_CANCELED));
        }
    }

    pub fn free_pages(&self, pages: &mut Vec<Frame>) {
        debug_assert!(self.properties.is_providing_specific_physical_pages);
        self.provider.free_pages(pages);
    }

    pub fn debug_is_page_ok(&self, page: Frame, offset: u64) -> bool {
        self.provider.debug_is_page_ok(page, offset)
    }

    pub fn dump(&self, depth: usize, max_items: usize) {
        let indent = depth * 2;
        let state = self.state.lock();
        log::info!(
            "{:indent$}page_source {:p} {:?} {:?}",
            "",
            self,
            state.phase,
            self.properties,
            indent = indent
        );
        for ty in PageRequestType::ALL {
            let tree = &state.outstanding[ty.index()];
            if tree.is_empty() {
                continue;
            }
            log::info!("{:indent$}  {:?}: {} outstanding", "", ty, tree.len(), indent = indent);
            let (listed, hidden) = dump_window(tree, max_items);
            for key in listed {
                let tracked = &state.requests[key];
                log::info!(
                    "{:indent$}    {:?} {:#x}..{:#x} pending {:#x} vmo {} waiters {}",
                    "",
                    tracked.id,
                    tracked.offset,
                    tracked.end(),
                    tracked.pending_size,
                    tracked.vmo_debug_info.vmo_id,
                    tracked.overlap.len(),
                    indent = indent
                );
            }
            if hidden > 0 {
                log::info!("{:indent$}    ... {} more", "", hidden, indent = indent);
            }
        }
        self.provider.dump(depth + 1, max_items);
    }

    #[cfg(test)]
    pub(crate) fn outstanding_count(&self, ty: PageRequestType) -> usize {
        self.state.lock().outstanding[ty.index()].len()
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Ids [`PageSource::dump`] would list for `ty`, and the count it would
    /// summarize as "more".
    #[cfg(test)]
    pub(crate) fn dump_listing(
        &self,
        ty: PageRequestType,
        max_items: usize,
    ) -> (Vec<RequestId>, usize) {
        let state = self.state.lock();
        let (listed, hidden) = dump_window(&state.outstanding[ty.index()], max_items);
        let ids = listed.map(|key| state.requests[key].id).collect();
        (ids, hidden)
    }

    /// Wake offset of an active request, relative to its start.
    #[cfg(test)]
    pub(crate) fn wake_progress(&self, request: &PageRequest) -> Option<(u64, u64)> {
        let link = request.link()?;
        let state = self.state.lock();
        state
            .lookup(link.key, link.id)
            .map(|tracked| (tracked.wake_offset - tracked.offset, tracked.len))
    }
}

impl PageRequestInterface for PageSource {
    fn cancel_request(&self, request: &PageRequest) -> bool {
        let Some(link) = request.link() else {
            return false;
        };
        debug_assert!(link.is_from(self));
        let mut state = self.state.lock();
        self.cancel_request_locked(&mut state, link.key, link.id)
    }

    fn wait_on_request(&self, request: &PageRequest, suspendable: bool) -> Result<()> {
        self.provider.wait_on_event(request.event(), suspendable)
    }
}
