//! # vm-pager
//!
//! Page fault resolution and asynchronous page supply for a virtual memory
//! kernel: page requests, the page sources that track them, the provider
//! interface that fulfills them, and the address space loop that waits on
//! them.

// Not implementing default is sometimes useful in the case something has significant cost
// to allocate.
#![allow(clippy::new_without_default)]
// Used to make it nicer to return errors, for example, .ok_or(Error::new(EINVAL))
#![allow(clippy::or_fun_call)]
// This is usually a serious issue - a missing import of a define where it is interpreted
// as a catch-all variable in a match, for example
#![deny(unreachable_patterns)]
// Ensure that all must_use results are used
#![deny(unused_must_use)]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
/// Shared data structures
pub mod common;

/// Address spaces and the page fault loop
pub mod aspace;

/// Page requests, page sources and providers
pub mod memory;

/// Blocking primitives
pub mod sync;

#[cfg(test)]
mod tests;
