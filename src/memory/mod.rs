//! Page requests, page sources and the providers behind them.

use core::fmt;
use core::num::NonZeroUsize;

pub mod multi_request;
pub mod page_provider;
pub mod page_request;
pub mod page_source;
pub mod status;

pub use self::multi_request::{
    AnonymousPageRequest, FreeMemoryWait, LazyPageRequest, MultiPageRequest,
};
pub use self::page_provider::{PageProvider, PageSourceProperties, ProviderRequest};
pub use self::page_request::{
    PageRequest, PageRequestInterface, PageRequestType, RequestId, VmoDebugInfo,
};
pub use self::page_source::{PageSource, SourcePhase};

/// Size of a page, in bytes.
pub const PAGE_SIZE: usize = 4096;
const PAGE_MASK: usize = PAGE_SIZE - 1;

/// How many requests of each type [`PageSource::dump`] lists unless told otherwise.
pub const DEFAULT_DUMP_MAX_ITEMS: usize = 16;

/// Round down to the nearest multiple of page size
pub fn round_down_pages(number: usize) -> usize {
    number - number % PAGE_SIZE
}
/// Round up to the nearest multiple of page size
pub fn round_up_pages(number: usize) -> usize {
    round_down_pages(number + PAGE_SIZE - 1)
}
/// Like [`round_up_pages`], but `None` past the last page boundary
pub fn checked_round_up_pages(number: usize) -> Option<usize> {
    number.checked_add(PAGE_SIZE - 1).map(round_down_pages)
}

pub fn is_page_aligned(offset: u64) -> bool {
    offset % PAGE_SIZE as u64 == 0
}

/// A physical page, as handed between page sources and their providers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Frame {
    // Frame 0x0 is never handed out, so the niche keeps Option<Frame> small.
    physaddr: NonZeroUsize,
}

impl Frame {
    /// Frame containing `address`, if that is not the reserved frame 0x0.
    pub fn containing(address: usize) -> Option<Frame> {
        NonZeroUsize::new(address & !PAGE_MASK).map(|physaddr| Frame { physaddr })
    }

    pub fn start_address(self) -> usize {
        self.physaddr.get()
    }

    pub fn next_by(self, n: usize) -> Option<Frame> {
        n.checked_mul(PAGE_SIZE)
            .and_then(|bytes| self.physaddr.get().checked_add(bytes))
            .and_then(NonZeroUsize::new)
            .map(|physaddr| Frame { physaddr })
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[frame at {:p}]", self.start_address() as *const u8)
    }
}
