/// Log a protection-scheme violation and abort the process.
///
/// Used for conditions that mean this layer or its caller has already
/// corrupted memory: signature mismatches, foreign handles, failed `mprotect`
/// calls and misaligned protection requests. Unwinding is not an option here;
/// the process must stop at the point of detection.
macro_rules! die {
    ($($arg:tt)+) => {{
        ::tracing::error!($($arg)+);
        eprintln!("[pageward] fatal: {}", format_args!($($arg)+));
        ::std::process::abort()
    }};
}
pub(crate) use die;
