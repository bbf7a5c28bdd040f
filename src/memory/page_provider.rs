use alloc::vec::Vec;
use core::fmt;

use super::page_request::{PageRequestType, RequestId, VmoDebugInfo};
use super::status::Result;
use super::Frame;
use crate::sync::Event;

/// Static capabilities of a provider. A provider's properties never change,
/// so the page source reads them once and caches them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageSourceProperties {
    /// The provider forwards requests to a user-mode pager.
    pub is_user_pager: bool,
    /// Content supplied by the provider must be preserved, so supplied pages
    /// can never simply be dropped and re-zeroed.
    pub is_preserving_page_content: bool,
    /// The provider decides which physical pages back which offsets, and
    /// takes them back through [`PageProvider::free_pages`].
    pub is_providing_specific_physical_pages: bool,
    /// Indexed by [`PageRequestType::index`].
    pub supports_request_type: [bool; PageRequestType::COUNT],
}

impl PageSourceProperties {
    pub fn supports(&self, ty: PageRequestType) -> bool {
        self.supports_request_type[ty.index()]
    }
}

/// Provider's view of a tracked request.
///
/// Handed out by value: while the provider owns a request its type, offset
/// and length do not change, and the page source refers back to it by `id`
/// in [`PageProvider::clear_async_request`] and
/// [`PageProvider::swap_async_request`].
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProviderRequest {
    pub id: RequestId,
    pub ty: PageRequestType,
    pub offset: u64,
    pub len: u64,
    pub vmo_debug_info: VmoDebugInfo,
}

impl ProviderRequest {
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

impl fmt::Debug for ProviderRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:?} {:?} {:#x}..{:#x} (vmo {})",
            self.id,
            self.ty,
            self.offset,
            self.end(),
            self.vmo_debug_info.vmo_id
        )
    }
}

/// Backend that fulfills page requests asynchronously.
///
/// Every hook except [`PageProvider::wait_on_event`] runs with the page
/// source lock held. Implementations must not call back into the page source
/// from them; resolutions have to arrive later, from another context.
pub trait PageProvider: Send + Sync {
    /// Must return the same value for the whole life of the provider.
    fn properties(&self) -> PageSourceProperties;

    /// Take ownership of `request` until it is cleared or swapped. Unless
    /// that happens first, the provider must eventually resolve the range
    /// through one of the page source's `on_pages_*` calls.
    fn send_async_request(&self, request: ProviderRequest);

    /// Ownership of `request` is ending; forget about it.
    fn clear_async_request(&self, request: ProviderRequest);

    /// Ownership moves from `old` to `new`, which covers exactly the same
    /// type, offset and length.
    fn swap_async_request(&self, old: ProviderRequest, new: ProviderRequest);

    /// Return pages to the provider's own pool. Only ever called when
    /// `is_providing_specific_physical_pages` is set.
    fn free_pages(&self, pages: &mut Vec<Frame>) {
        let _ = pages;
        unimplemented!("free_pages on a provider that does not supply specific physical pages");
    }

    /// Debug check that `page` may back `offset`. Providers without placement
    /// restrictions return true.
    fn debug_is_page_ok(&self, page: Frame, offset: u64) -> bool;

    /// Called once, when the page source is detached.
    fn on_detach(&self);

    /// Called once, after [`PageProvider::on_detach`], when the page source is
    /// closed.
    fn on_close(&self);

    /// Block the current thread on `event`. See [`Event::wait`] for the
    /// expected interruption semantics.
    fn wait_on_event(&self, event: &Event, suspendable: bool) -> Result<()>;

    /// Log provider state, at most `max_items` pending requests.
    fn dump(&self, depth: usize, max_items: usize);
}
