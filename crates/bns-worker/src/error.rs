//! Call-site context for fatal errors

use std::fmt;
use std::panic::Location;

/// Where a fatal broker failure was observed
///
/// Rendered as `file:line (function)` in front of the error message so the
/// single diagnostic line an operator sees points at the failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
}

impl CallSite {
    /// Capture the location of the caller
    #[track_caller]
    pub fn capture(function: &'static str) -> Self {
        let location = Location::caller();
        Self {
            file: location.file(),
            line: location.line(),
            function,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.file, self.line, self.function)
    }
}
