use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every stage of a mapping attempt reports its failure through one of these variants. The
/// orchestrator logs the stage that failed and propagates the error unchanged, so callers can
/// match on the precise cause.
///
/// # Error Categories
///
/// ## Image Parsing Errors
/// - [`Error::Malformed`] - Corrupted or inconsistent PE structure
/// - [`Error::OutOfBounds`] - Attempted to read or write beyond a buffer boundary
/// - [`Error::NotSupported`] - The image is not a 64-bit (PE32+) executable
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::GoblinErr`] - Header parsing errors from the goblin crate
///
/// ## Resource Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::StagingAllocation`] - The local staging buffer could not be allocated
/// - [`Error::AllocationFailed`] - The target allocation was refused by the channel
///
/// ## Linking Errors
/// - [`Error::RelocationsStripped`] - Relocations are required but were stripped
/// - [`Error::ModuleNotFound`] - An imported module is not resident in the target space
/// - [`Error::ExportNotFound`] - An imported symbol is missing from a resident module
///
/// ## Channel Errors
/// - [`Error::TransferFailed`] - The bulk write into the target allocation failed
/// - [`Error::InvocationFailed`] - The entry point could not be called
/// - [`Error::Channel`] - Any other failure reported by a channel implementation
///
/// # Examples
///
/// ```rust,no_run
/// use pemap::{Error, Mapper, SimulatedChannel, StaticRegistry};
///
/// let mut mapper = Mapper::new(SimulatedChannel::new(), StaticRegistry::new());
/// match mapper.map_file("driver.sys") {
///     Ok(mapped) => println!("mapped at {:#x}", mapped.base),
///     Err(Error::ModuleNotFound(module)) => eprintln!("dependency {module} is not loaded"),
///     Err(Error::ExportNotFound { module, symbol }) => {
///         eprintln!("{symbol} is not exported by {module}");
///     }
///     Err(e) => eprintln!("mapping failed: {e}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Image parsing Errors
    /// The image is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    #[error("Out of Bound access would have occurred!")]
    OutOfBounds,

    /// This image type is not supported.
    ///
    /// Only PE32+ images can be mapped; PE32 images are rejected before anything is
    /// allocated.
    #[error("Image is not a 64-bit PE")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Error from the goblin crate during header parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    // Resource Errors
    /// The local staging buffer of the given size could not be allocated.
    #[error("Failed to allocate a local staging buffer of {0:#x} bytes")]
    StagingAllocation(usize),

    /// The channel could not allocate target memory of the given size.
    #[error("Failed to allocate {0:#x} bytes in the target space")]
    AllocationFailed(usize),

    // Linking Errors
    /// The relocation table is empty and the header marks relocations as stripped.
    ///
    /// Such an image can only run at its preferred base, which the target allocation
    /// cannot guarantee.
    #[error("Image has no relocations and IMAGE_FILE_RELOCS_STRIPPED is set")]
    RelocationsStripped,

    /// An imported module is not resident in the target space.
    #[error("Dependency {0} wasn't found")]
    ModuleNotFound(String),

    /// An imported symbol could not be resolved within a resident module.
    #[error("Failed to resolve import {symbol} ({module})")]
    ExportNotFound {
        /// Name of the module the symbol was imported from
        module: String,
        /// Name of the unresolved symbol
        symbol: String,
    },

    // Channel Errors
    /// Writing the staged image into the target allocation failed.
    #[error("Failed to write {size:#x} bytes to {address:#x}")]
    TransferFailed {
        /// Target address of the write
        address: u64,
        /// Number of bytes that should have been written
        size: usize,
    },

    /// The entry point at the given address could not be invoked.
    #[error("Failed to call entry point at {0:#x}")]
    InvocationFailed(u64),

    /// A channel implementation reported a failure.
    #[error("Channel failure - {0}")]
    Channel(String),
}
