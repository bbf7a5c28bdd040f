//! Address spaces and the page fault loop.
//!
//! An address space only knows which [`VmMapping`] covers which range. The
//! mappings resolve faults themselves; when one of them needs pages that are
//! not there yet it populates a [`MultiPageRequest`], and the loop here waits
//! on it without the address space lock held, then tries again.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use spin::Mutex;

use crate::memory::status::{Error, Result, EEXIST, EFAULT, EINVAL, ETIMEDOUT, SHOULD_WAIT};
use crate::memory::{checked_round_up_pages, round_down_pages, MultiPageRequest, PAGE_SIZE};

pub use self::fault::PageFaultFlags;

pub mod fault;

/// A range of an address space backed by something that can resolve faults.
pub trait VmMapping: Send + Sync {
    fn base(&self) -> usize;

    /// Size in bytes. Always a non-zero multiple of the page size.
    fn size(&self) -> usize;

    fn end(&self) -> usize {
        self.base() + self.size()
    }

    fn occupies(&self, address: usize) -> bool {
        address >= self.base() && address < self.end()
    }

    /// Resolve a fault at the page `va`, and map up to `additional_pages`
    /// pages after it if that comes cheap.
    ///
    /// Called with the address space lock held. Returns the status with the
    /// number of pages mapped from `va` on, which on `SHOULD_WAIT` are the
    /// pages mapped before reaching the one `request` was populated for.
    fn page_fault_locked(
        &self,
        va: usize,
        flags: PageFaultFlags,
        additional_pages: usize,
        request: &mut MultiPageRequest,
    ) -> (Result<()>, usize);

    fn dump(&self, depth: usize);
}

struct AspaceInner {
    mappings: BTreeMap<usize, Arc<dyn VmMapping>>,
    /// Mapping that took the last fault. Faults tend to come in runs.
    last_fault: Option<Arc<dyn VmMapping>>,
}

impl AspaceInner {
    fn contains(&self, address: usize) -> Option<&Arc<dyn VmMapping>> {
        self.mappings
            .range(..=address)
            .next_back()
            .map(|(_, mapping)| mapping)
            .filter(|mapping| mapping.occupies(address))
    }

    fn find_fault_mapping(&mut self, address: usize) -> Option<Arc<dyn VmMapping>> {
        if let Some(last) = self.last_fault.as_ref().filter(|last| last.occupies(address)) {
            return Some(Arc::clone(last));
        }
        let mapping = Arc::clone(self.contains(address)?);
        self.last_fault = Some(Arc::clone(&mapping));
        Some(mapping)
    }
}

/// `va` moved forward by `pages`. A mapping reporting more pages than the
/// address space can hold is `EINVAL`.
fn advance_pages(va: usize, pages: usize) -> Result<usize> {
    pages
        .checked_mul(PAGE_SIZE)
        .and_then(|len| va.checked_add(len))
        .ok_or(Error::new(EINVAL))
}

pub struct VmAspace {
    name: String,
    inner: Mutex<AspaceInner>,
}

impl VmAspace {
    pub fn new(name: &str) -> VmAspace {
        VmAspace {
            name: String::from(name),
            inner: Mutex::new(AspaceInner {
                mappings: BTreeMap::new(),
                last_fault: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_mapping(&self, mapping: Arc<dyn VmMapping>) -> Result<()> {
        let (base, size) = (mapping.base(), mapping.size());
        if size == 0 || base % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Error::new(EINVAL));
        }
        let end = base.checked_add(size).ok_or(Error::new(EINVAL))?;

        let mut inner = self.inner.lock();
        let before = inner.mappings.range(..end).next_back();
        if before.map_or(false, |(_, existing)| existing.end() > base) {
            return Err(Error::new(EEXIST));
        }
        inner.mappings.insert(base, mapping);
        Ok(())
    }

    pub fn remove_mapping(&self, base: usize) -> Option<Arc<dyn VmMapping>> {
        let mut inner = self.inner.lock();
        let mapping = inner.mappings.remove(&base)?;
        if inner
            .last_fault
            .as_ref()
            .map_or(false, |last| Arc::ptr_eq(last, &mapping))
        {
            inner.last_fault = None;
        }
        Some(mapping)
    }

    pub fn find_mapping(&self, address: usize) -> Option<Arc<dyn VmMapping>> {
        self.inner.lock().contains(address).cloned()
    }

    /// Resolve a fault at `va`.
    pub fn page_fault(&self, va: usize, flags: PageFaultFlags) -> Result<()> {
        self.fault_loop(va, flags, 0).map(|_| ())
    }

    /// Fault in every page of `[va, va + len)`, as if each were touched.
    pub fn soft_fault_in_range(&self, va: usize, flags: PageFaultFlags, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = va
            .checked_add(len)
            .and_then(checked_round_up_pages)
            .ok_or(Error::new(EINVAL))?;
        let flags = flags | PageFaultFlags::SW_FAULT;

        let mut va = round_down_pages(va);
        while va < end {
            let additional_pages = (end - va) / PAGE_SIZE - 1;
            va = self.fault_loop(va, flags, additional_pages)?;
        }
        Ok(())
    }

    /// Run faults at `va` until it is resolved. Returns the end of what got
    /// mapped in the last round.
    fn fault_loop(
        &self,
        va: usize,
        flags: PageFaultFlags,
        mut additional_pages: usize,
    ) -> Result<usize> {
        if !flags.is_consistent() {
            return Err(Error::new(EINVAL));
        }
        let suspendable = flags.suspendable();
        let mut va = round_down_pages(va);

        // Fault-ahead wants to hear about partial progress: every page that
        // comes in is one more it can map.
        let mut request = MultiPageRequest::new(additional_pages > 0);

        loop {
            let (status, pages_mapped) = {
                let mut inner = self.inner.lock();
                let mapping = inner.find_fault_mapping(va).ok_or(Error::new(EFAULT))?;
                mapping.page_fault_locked(va, flags, additional_pages, &mut request)
            };

            match status {
                Ok(()) => return advance_pages(va, cmp::max(pages_mapped, 1)),
                Err(ref err) if err.errno == SHOULD_WAIT => (),
                Err(err) => return Err(self.fault_failed(va, err)),
            }

            va = advance_pages(va, pages_mapped)?;
            additional_pages = additional_pages.saturating_sub(pages_mapped);

            if let Err(err) = request.wait(suspendable) {
                return Err(self.fault_failed(va, err));
            }
        }
    }

    fn fault_failed(&self, va: usize, err: Error) -> Error {
        if err.errno == ETIMEDOUT {
            log::warn!("{}: timed out faulting in {:#x}", self.name, va);
            self.dump();
        } else {
            log::debug!("{}: fault at {:#x} failed: {:?}", self.name, va, err);
        }
        err
    }

    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::info!("aspace {}: {} mappings", self.name, inner.mappings.len());
        for mapping in inner.mappings.values() {
            mapping.dump(1);
        }
    }

    /// Tear the address space down. Mappings go away once the last fault
    /// holding on to them is done.
    pub fn destroy(self) {
        let mut inner = self.inner.into_inner();
        inner.last_fault = None;
        let mappings: Vec<_> = core::mem::take(&mut inner.mappings).into_values().collect();
        log::debug!("aspace {}: destroyed with {} mappings", self.name, mappings.len());
    }
}
