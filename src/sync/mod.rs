pub use self::event::{Event, ThreadSignals};

pub mod event;
