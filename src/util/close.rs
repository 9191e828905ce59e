//! Provides the [Close] trait for writers whose finalization may fail.

use std::io;

/// A trait for types that need to be finalized.
///
/// Only [Close::close] commits the value. Dropping it without closing discards whatever was
/// written.
pub trait Close {
    fn close(self) -> io::Result<()>;
}
