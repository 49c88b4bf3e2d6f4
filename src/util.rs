use crate::error::ConfigError;

/// Checks that a hyperparameter lies in the interval `[a,b]`, or `(a,b]` when
/// written with a leading `>`, and returns a [`ConfigError`] naming it if not
///
/// ### Example
/// ```ignore
/// let alpha = 0.0;
/// check_interval!(alpha, > 0.0, 1.0)?;
/// ```
/// This fails with the message "invalid value for \`alpha\`: 0. Must be in the interval (0, 1]".
macro_rules! check_interval {
    ($var:ident, > $a:expr, $b:expr) => {
        $crate::util::check_range(stringify!($var), $var, $a, $b, true)
    };
    ($var:ident, $a:expr, $b:expr) => {
        $crate::util::check_range(stringify!($var), $var, $a, $b, false)
    };
}

pub(crate) use check_interval;

pub(crate) fn check_range(
    name: &'static str,
    value: f64,
    min: f64,
    max: f64,
    open_min: bool,
) -> Result<(), ConfigError> {
    let above_min = if open_min { value > min } else { value >= min };
    if above_min && value <= max {
        Ok(())
    } else {
        let open = if open_min { '(' } else { '[' };
        Err(ConfigError::OutOfRange {
            name,
            value,
            interval: format!("{open}{min}, {max}]"),
        })
    }
}

/// Fails with [`ConfigError::EmptyDimension`] when a table dimension is zero
pub(crate) fn check_dimension(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::EmptyDimension(name))
    } else {
        Ok(())
    }
}
