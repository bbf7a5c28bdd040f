//! Shared test support, plus scenarios that need several threads.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::relax::RelaxStrategy;
use spin::Mutex;

use crate::memory::status::Result;
use crate::memory::{
    Frame, PageProvider, PageRequestType, PageSourceProperties, ProviderRequest, RequestId,
};
use crate::sync::{Event, ThreadSignals};

/// Gives the time slice back to the host scheduler while spinning.
pub struct YieldNow;

impl RelaxStrategy for YieldNow {
    fn relax() {
        std::thread::yield_now();
    }
}

#[derive(Default)]
struct ProviderLog {
    outstanding: BTreeMap<RequestId, ProviderRequest>,
    sent: Vec<ProviderRequest>,
    cleared: Vec<ProviderRequest>,
    swapped: Vec<(ProviderRequest, ProviderRequest)>,
}

/// Provider that only records what it is asked to do. Tests play the pager
/// by calling the page source's `on_pages_*` methods themselves.
pub struct TestProvider {
    properties: PageSourceProperties,
    log: Mutex<ProviderLog>,
    signals: ThreadSignals,
    detached: AtomicUsize,
    closed: AtomicUsize,
}

impl TestProvider {
    fn with_properties(properties: PageSourceProperties) -> Arc<TestProvider> {
        Arc::new(TestProvider {
            properties,
            log: Mutex::new(ProviderLog::default()),
            signals: ThreadSignals::new(),
            detached: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    /// Supports reads and writebacks.
    pub fn new() -> Arc<TestProvider> {
        Self::with_properties(PageSourceProperties {
            is_user_pager: true,
            is_preserving_page_content: true,
            is_providing_specific_physical_pages: false,
            supports_request_type: [true, false, true],
        })
    }

    /// Supports every request type.
    pub fn with_dirty() -> Arc<TestProvider> {
        Self::with_properties(PageSourceProperties {
            is_user_pager: true,
            is_preserving_page_content: true,
            is_providing_specific_physical_pages: false,
            supports_request_type: [true; PageRequestType::COUNT],
        })
    }

    /// Interruption state shared by every thread waiting through this provider.
    pub fn signals(&self) -> &ThreadSignals {
        &self.signals
    }

    pub fn sent(&self, ty: PageRequestType) -> usize {
        self.log.lock().sent.iter().filter(|req| req.ty == ty).count()
    }

    pub fn sent_requests(&self) -> Vec<ProviderRequest> {
        self.log.lock().sent.clone()
    }

    pub fn outstanding(&self) -> usize {
        self.log.lock().outstanding.len()
    }

    pub fn cleared(&self) -> usize {
        self.log.lock().cleared.len()
    }

    pub fn swapped(&self) -> Vec<(ProviderRequest, ProviderRequest)> {
        self.log.lock().swapped.clone()
    }

    pub fn detach_calls(&self) -> usize {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PageProvider for TestProvider {
    fn properties(&self) -> PageSourceProperties {
        self.properties
    }

    fn send_async_request(&self, request: ProviderRequest) {
        let mut log = self.log.lock();
        assert!(log.outstanding.insert(request.id, request).is_none());
        log.sent.push(request);
    }

    fn clear_async_request(&self, request: ProviderRequest) {
        let mut log = self.log.lock();
        assert_eq!(log.outstanding.remove(&request.id), Some(request));
        log.cleared.push(request);
    }

    fn swap_async_request(&self, old: ProviderRequest, new: ProviderRequest) {
        let mut log = self.log.lock();
        assert_eq!(log.outstanding.remove(&old.id), Some(old));
        assert_eq!((old.ty, old.offset, old.len), (new.ty, new.offset, new.len));
        log.outstanding.insert(new.id, new);
        log.swapped.push((old, new));
    }

    fn debug_is_page_ok(&self, _page: Frame, _offset: u64) -> bool {
        true
    }

    fn on_detach(&self) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn on_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn wait_on_event(&self, event: &Event, suspendable: bool) -> Result<()> {
        event.wait::<YieldNow>(&self.signals, suspendable)
    }

    fn dump(&self, depth: usize, max_items: usize) {
        let log = self.log.lock();
        for request in log.outstanding.values().take(max_items) {
            log::info!("{:indent$}test provider: {:?}", "", request, indent = depth * 2);
        }
    }
}

mod threaded {
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use std::vec::Vec;

    use test_log::test;

    use super::TestProvider;
    use crate::memory::status::{is_should_wait, Error, EBADMSG, INTR_KILLED, INTR_RETRY};
    use crate::memory::{PageRequest, PageRequestType, PageSource, VmoDebugInfo, PAGE_SIZE};

    const PAGE: u64 = PAGE_SIZE as u64;

    fn wait_for_sends(provider: &TestProvider, count: usize) {
        while provider.outstanding() < count {
            thread::yield_now();
        }
    }

    #[test]
    fn concurrent_readers_share_one_round_trip() {
        const READERS: usize = 8;
        let provider = TestProvider::new();
        let src = PageSource::new(provider.clone());
        let barrier = Arc::new(Barrier::new(READERS));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let (src, barrier) = (src.clone(), barrier.clone());
                thread::spawn(move || {
                    let mut request = PageRequest::new(false);
                    barrier.wait();
                    let status = src.get_pages(0, 4 * PAGE, &mut request, VmoDebugInfo::default());
                    assert!(is_should_wait(&status));
                    request.wait(false)
                })
            })
            .collect();

        // Every reader is tracked once all of them are, either as the head or
        // riding on it.
        while src.tracked_count() < READERS {
            thread::yield_now();
        }
        assert_eq!(provider.sent(PageRequestType::Read), 1);

        src.on_pages_failed(0, 4 * PAGE, EBADMSG).unwrap();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), Err(Error::new(EBADMSG)));
        }
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn cancel_races_completion() {
        for _ in 0..64 {
            let provider = TestProvider::new();
            let src = PageSource::new(provider.clone());
            let mut request = PageRequest::new(false);
            let status = src.get_pages(0, PAGE, &mut request, VmoDebugInfo::default());
            assert!(is_should_wait(&status));

            let supplier = {
                let src = src.clone();
                thread::spawn(move || src.on_pages_supplied(0, PAGE))
            };
            let cancelled = request.cancel_request();
            supplier.join().unwrap();

            // Whichever side lost left nothing behind, and the waiter saw
            // completion only if cancellation did not take effect.
            assert_eq!(provider.outstanding(), 0);
            assert_eq!(src.tracked_count(), 0);
            assert_eq!(request.event().is_signaled(), !cancelled);
        }
    }

    #[test]
    fn killed_waiter_cancels_its_request() {
        let provider = TestProvider::new();
        let src = PageSource::new(provider.clone());

        let waiter = {
            let src = src.clone();
            thread::spawn(move || {
                let mut request = PageRequest::new(false);
                let status = src.get_pages(0, PAGE, &mut request, VmoDebugInfo::default());
                assert!(is_should_wait(&status));
                let status = request.wait(true);
                (status, request.is_active_hint())
            })
        };
        wait_for_sends(&provider, 1);
        provider.signals().kill();

        let (status, active) = waiter.join().unwrap();
        assert_eq!(status, Err(Error::new(INTR_KILLED)));
        assert!(!active);
        assert_eq!(provider.outstanding(), 0);
    }

    #[test]
    fn suspension_only_interrupts_suspendable_waits() {
        let provider = TestProvider::new();
        let src = PageSource::new(provider.clone());
        provider.signals().suspend();

        let mut request = PageRequest::new(false);
        let status = src.get_pages(0, PAGE, &mut request, VmoDebugInfo::default());
        assert!(is_should_wait(&status));
        assert_eq!(request.wait(true), Err(Error::new(INTR_RETRY)));
        assert_eq!(provider.outstanding(), 0);

        let waiter = {
            let src = src.clone();
            thread::spawn(move || {
                let mut request = PageRequest::new(false);
                let status = src.get_pages(0, PAGE, &mut request, VmoDebugInfo::default());
                assert!(is_should_wait(&status));
                request.wait(false)
            })
        };
        wait_for_sends(&provider, 1);
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        src.on_pages_supplied(0, PAGE);
        assert_eq!(waiter.join().unwrap(), Ok(()));
        provider.signals().resume();
    }
}
