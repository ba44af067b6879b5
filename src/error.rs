use thiserror::Error;

use crate::platform::MachineType;

macro_rules! consistency_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Consistency {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Consistency {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every failure in the layout engine falls into one of four categories. None of them is
/// retryable: a build either completes or aborts with the first error raised.
///
/// # Error Categories
///
/// ## Configuration Errors
/// - [`Error::Config`] - A required collaborator is missing or a build parameter is invalid
///   (e.g. a non power-of-two alignment). Raised at construction time.
///
/// ## Consistency Errors
/// - [`Error::Consistency`] - An internal invariant of the caller was violated: a token or
///   address was queried before finalization, a symbol was never assigned an address, or a
///   deduplicating table was asked to overwrite a row with a colliding value. These indicate
///   a missing dependency edge in the build, not bad user input, and carry the source
///   location where the violation was detected.
///
/// ## Capability Errors
/// - [`Error::NotSupported`] - An architecture-specific code generation operation was
///   requested from a platform that cannot express it. Never a silent no-op.
///
/// ## Format-Limit Errors
/// - [`Error::FormatLimit`] - A value exceeds the width of the binary field that must hold
///   it (e.g. a relocation offset above 0xFFF). Rejected at the point of construction.
///
/// # Examples
///
/// ```rust
/// use peforge::{Error, relocations::{RelocationEntry, RelocationType}};
///
/// match RelocationEntry::new(RelocationType::HighLow, 0x1234) {
///     Err(Error::FormatLimit { message }) => {
///         eprintln!("rejected: {}", message);
///     }
///     _ => unreachable!("offsets above 0xFFF do not fit a relocation entry"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A required collaborator is missing, or a build parameter is invalid.
    ///
    /// Raised at construction time, before any layout work starts. Typical causes are
    /// alignments that are not powers of two or an empty section list.
    #[error("Invalid configuration - {message}")]
    Config {
        /// Description of the invalid configuration
        message: String,
    },

    /// An internal consistency invariant was violated by the caller.
    ///
    /// This error surfaces programming errors in the build pipeline immediately instead of
    /// silently producing wrong bytes: querying a sorted table's token before finalization,
    /// resolving a symbol that was never placed into the segment tree, or colliding updates
    /// in a deduplicating table.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of the violated invariant
    /// * `file` - Source file in which the violation was detected
    /// * `line` - Source line in which the violation was detected
    #[error("Consistency - {file}:{line}: {message}")]
    Consistency {
        /// The message to be printed for the Consistency error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The requested code generation operation is not available on the target platform.
    ///
    /// Thunk-stub or address-table-initializer generation was requested from an
    /// architecture that does not implement it. The operation name identifies what was
    /// attempted so the caller can report a precise root cause.
    #[error("{operation} is not supported for {machine} platforms")]
    NotSupported {
        /// The target machine the operation was requested for
        machine: MachineType,
        /// The operation that is unavailable on this machine
        operation: &'static str,
    },

    /// A value exceeds the width of the binary field that must encode it.
    #[error("Format limit exceeded - {message}")]
    FormatLimit {
        /// Description of the field and the offending value
        message: String,
    },

    /// File I/O error.
    ///
    /// Wraps standard I/O errors raised by the output sink during serialization.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}
