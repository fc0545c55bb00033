//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```no_run
/// use vrmeta::pf_trace;
/// let msg = "hello";
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::trace!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```no_run
/// use vrmeta::pf_debug;
/// let msg = "hello";
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::debug!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log INFO message.
///
/// Example:
/// ```no_run
/// use vrmeta::pf_info;
/// let msg = "hello";
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::info!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log WARN message.
///
/// Example:
/// ```no_run
/// use vrmeta::pf_warn;
/// let msg = "hello";
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::warn!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```no_run
/// use vrmeta::pf_error;
/// let msg = "hello";
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal $(, $fmt_arg:expr)* $(,)?) => {
        log::error!($fmt_str $(, $fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `MetaError` containing
/// the string, wrapped in `Err()`.
///
/// Example:
/// ```no_run
/// use vrmeta::{logged_err, pf_error};
/// use vrmeta::MetaError;
/// fn example(msg: &str) -> Result<(), MetaError> {
///     return logged_err!("got {} to print", msg);
/// }
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {{
        pf_error!($fmt_str);
        Err($crate::MetaError::msg($fmt_str))
    }};

    ($fmt_str:literal, $($fmt_arg:tt)*) => {{
        pf_error!($fmt_str, $($fmt_arg)*);
        Err($crate::MetaError::msg(format!(
            $fmt_str,
            $($fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::MetaError;

    #[test]
    fn error_no_args() {
        assert_eq!(
            logged_err!("interesting message"),
            Err::<(), MetaError>(MetaError::msg("interesting message"))
        );
    }

    #[test]
    fn error_with_args() {
        assert_eq!(
            logged_err!("got {} to print", 777),
            Err::<(), MetaError>(MetaError::msg("got 777 to print"))
        );
    }
}
