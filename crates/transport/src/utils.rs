//! Helper macros shared by the transport modules.

/// Returns early with `$error` unless `$predicate` holds.
///
/// ```ignore
/// ensure!(!self.closed, TransportError::invalid_operation("output is closed"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
