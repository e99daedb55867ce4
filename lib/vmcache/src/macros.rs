/// Reports a broken invariant and halts the current context.
///
/// Corruption of the cache graph is never recovered from: the message is
/// logged at error level and the context panics.
macro_rules! fatal {
    ($($arg:tt)+) => {{
        log::error!($($arg)+);
        panic!($($arg)+)
    }};
}
