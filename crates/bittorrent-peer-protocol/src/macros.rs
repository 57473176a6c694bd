/// Fails with [crate::Error::BadLength] if `$v` is shorter than `$e`
macro_rules! check_length {
    ($v:expr, $e:expr) => {
        if $v < $e {
            return Err($crate::Error::BadLength($v, $e));
        }
    };
}

/// Fails with [crate::Error::BadLength] unless `$v` is exactly `$e`
macro_rules! check_exact_length {
    ($v:expr, $e:expr) => {
        if $v != $e {
            return Err($crate::Error::BadLength($v, $e));
        }
    };
}
