//! Internal logging shim.
//!
//! Forwards to the [`log`](https://docs.rs/log) facade when the `log` feature is
//! enabled and expands to nothing otherwise. The latter matters when the heap is
//! the global allocator: a logger that allocates would re-enter the lock.

#[cfg(feature = "log")]
macro_rules! heap_log {
    ($level:ident, $($arg:tt)+) => {
        ::log::$level!(target: "brkheap", $($arg)+)
    };
}

#[cfg(not(feature = "log"))]
macro_rules! heap_log {
    ($level:ident, $($arg:tt)+) => {{
        if false {
            let _ = ::core::format_args!($($arg)+);
        }
    }};
}

pub(crate) use heap_log;
