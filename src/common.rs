/// Serial number identifying one logical stream inside a physical Ogg stream.
pub type Serial = u32;

/// Raw granule position as stored in a page header.
pub type GranulePos = i64;

/// Value of a page or packet granule position that carries no timing information.
pub const GRANULE_UNSET: GranulePos = -1;

/// Checks at compile time that an error type can cross thread boundaries and be boxed.
macro_rules! assert_error_traits {
    ($to_test:ty) => {
        const _: () = {
            const fn assert_error<T: ::std::error::Error + ::std::marker::Send + ::std::marker::Sync + 'static>() {}
            assert_error::<$to_test>();
        };
    };
}
pub(crate) use assert_error_traits;

macro_rules! log_warn {
    ($($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::warn!($($arg)+);
        #[cfg(not(feature = "tracing"))]
        eprintln!($($arg)+);
    }};
}
pub(crate) use log_warn;

macro_rules! log_debug {
    ($($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::debug!($($arg)+);
        #[cfg(not(feature = "tracing"))]
        let _ = format_args!($($arg)+);
    }};
}
pub(crate) use log_debug;

macro_rules! log_trace {
    ($($arg:tt)+) => {{
        #[cfg(feature = "tracing")]
        tracing::trace!($($arg)+);
        #[cfg(not(feature = "tracing"))]
        let _ = format_args!($($arg)+);
    }};
}
pub(crate) use log_trace;
