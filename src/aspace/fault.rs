use bitflags::bitflags;

bitflags! {
    /// Why a page fault happened and where it came from.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageFaultFlags: u32 {
        const WRITE = 1 << 0;
        /// Raised by user-mode code. Such faults may be suspended while they wait.
        const USER = 1 << 1;
        const GUEST = 1 << 2;
        const INSTRUCTION = 1 << 3;
        const NOT_PRESENT = 1 << 4;
        const HW_FAULT = 1 << 5;
        /// Raised by software, e.g. to fault a range in ahead of time.
        const SW_FAULT = 1 << 6;
    }
}

impl PageFaultFlags {
    /// Kernel-mode faults cannot be interrupted by suspension: the faulting
    /// thread may be in the middle of something it cannot back out of.
    pub fn suspendable(self) -> bool {
        self.contains(PageFaultFlags::USER)
    }

    /// A fault is a write, an instruction fetch, or a read. Never two.
    pub fn is_consistent(self) -> bool {
        !self.contains(PageFaultFlags::WRITE | PageFaultFlags::INSTRUCTION)
    }
}
