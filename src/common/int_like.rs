//! Opaque id types backed by an integer.
//!
//! ```ignore
//! int_like!(RequestId, AtomicRequestId, u64, AtomicU64);
//!
//! static NEXT: AtomicRequestId = AtomicRequestId::new(RequestId::new(1));
//! let id = NEXT.fetch_add(1, Ordering::Relaxed);
//! ```

#[macro_export]
macro_rules! int_like {
    ($new_type_name:ident, $backing_type:ident) => {
        #[derive(Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
        pub struct $new_type_name($backing_type);

        impl $new_type_name {
            #[inline]
            pub const fn get(self) -> $backing_type {
                self.0
            }
            #[inline]
            pub const fn new(x: $backing_type) -> Self {
                $new_type_name(x)
            }
        }

        impl ::core::convert::From<$backing_type> for $new_type_name {
            #[inline]
            fn from(inner: $backing_type) -> Self {
                Self::new(inner)
            }
        }
        impl ::core::convert::From<$new_type_name> for $backing_type {
            #[inline]
            fn from(wrapped: $new_type_name) -> Self {
                wrapped.get()
            }
        }
    };

    ($new_type_name:ident, $new_atomic_type_name:ident, $backing_type:ident, $backing_atomic_type:ident) => {
        int_like!($new_type_name, $backing_type);

        /// Atomic holder for the id type, for counters shared between threads.
        pub struct $new_atomic_type_name {
            container: ::core::sync::atomic::$backing_atomic_type,
        }

        impl $new_atomic_type_name {
            #[inline]
            pub const fn new(x: $new_type_name) -> Self {
                $new_atomic_type_name {
                    container: ::core::sync::atomic::$backing_atomic_type::new(x.get()),
                }
            }
            #[inline]
            pub fn load(&self, order: ::core::sync::atomic::Ordering) -> $new_type_name {
                $new_type_name::from(self.container.load(order))
            }
            /// Returns the previous value, like the atomic it wraps.
            #[inline]
            pub fn fetch_add(
                &self,
                with: $backing_type,
                order: ::core::sync::atomic::Ordering,
            ) -> $new_type_name {
                $new_type_name::from(self.container.fetch_add(with, order))
            }
        }
    };
}

#[test]
fn test() {
    use core::mem::size_of;
    use core::sync::atomic::Ordering;

    int_like!(U64Like, AtomicU64Like, u64, AtomicU64);
    assert_eq!(size_of::<U64Like>(), size_of::<u64>());

    let counter = AtomicU64Like::new(U64Like::new(7));
    assert_eq!(counter.fetch_add(1, Ordering::Relaxed), U64Like::new(7));
    assert_eq!(counter.load(Ordering::Relaxed).get(), 8);
}
