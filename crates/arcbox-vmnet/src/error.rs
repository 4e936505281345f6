//! Error types and native status classification.
//!
//! vmnet reports every outcome as a `vmnet_return_t` status. [`classify`]
//! maps those codes to an [`ErrorKind`]; codes this crate does not know about
//! degrade to [`ErrorKind::Unknown`] instead of failing, so newer host
//! releases that introduce statuses keep working.

use thiserror::Error;

/// Result type alias for vmnet operations.
pub type Result<T> = std::result::Result<T, VmnetError>;

/// Native status code for a successful operation.
pub const VMNET_SUCCESS: u32 = 1000;
/// Generic failure.
pub const VMNET_FAILURE: u32 = 1001;
/// Memory allocation failure.
pub const VMNET_MEM_FAILURE: u32 = 1002;
/// Invalid argument.
pub const VMNET_INVALID_ARGUMENT: u32 = 1003;
/// Interface setup is not complete.
pub const VMNET_SETUP_INCOMPLETE: u32 = 1004;
/// Permission denied for the operation.
pub const VMNET_INVALID_ACCESS: u32 = 1005;
/// Packet exceeds the maximum packet size.
pub const VMNET_PACKET_TOO_BIG: u32 = 1006;
/// Kernel buffers are temporarily exhausted.
pub const VMNET_BUFFER_EXHAUSTED: u32 = 1007;
/// Too many packets passed in a single call.
pub const VMNET_TOO_MANY_PACKETS: u32 = 1008;
/// The internet sharing service is busy.
pub const VMNET_SHARING_SERVICE_BUSY: u32 = 1009;
/// The caller is not authorized to start the interface.
pub const VMNET_NOT_AUTHORIZED: u32 = 1010;

/// Classified native status.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic failure.
    #[error("operation failed")]
    Failure,
    /// Memory allocation failure.
    #[error("memory allocation failed")]
    MemFailure,
    /// Invalid argument.
    #[error("invalid argument")]
    InvalidArgument,
    /// Setup incomplete.
    #[error("setup incomplete")]
    SetupIncomplete,
    /// Invalid access.
    #[error("invalid access")]
    InvalidAccess,
    /// Packet too big.
    #[error("packet too big")]
    PacketTooBig,
    /// Buffer exhausted.
    #[error("buffer exhausted")]
    BufferExhausted,
    /// Too many packets.
    #[error("too many packets")]
    TooManyPackets,
    /// Sharing service busy.
    #[error("sharing service busy")]
    SharingServiceBusy,
    /// Not authorized.
    #[error("not authorized")]
    NotAuthorized,
    /// A status code outside the known table.
    #[error("unknown status {0}")]
    Unknown(u32),
}

impl ErrorKind {
    /// Returns the native status code for this kind.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Failure => VMNET_FAILURE,
            Self::MemFailure => VMNET_MEM_FAILURE,
            Self::InvalidArgument => VMNET_INVALID_ARGUMENT,
            Self::SetupIncomplete => VMNET_SETUP_INCOMPLETE,
            Self::InvalidAccess => VMNET_INVALID_ACCESS,
            Self::PacketTooBig => VMNET_PACKET_TOO_BIG,
            Self::BufferExhausted => VMNET_BUFFER_EXHAUSTED,
            Self::TooManyPackets => VMNET_TOO_MANY_PACKETS,
            Self::SharingServiceBusy => VMNET_SHARING_SERVICE_BUSY,
            Self::NotAuthorized => VMNET_NOT_AUTHORIZED,
            Self::Unknown(code) => code,
        }
    }
}

/// Maps a native status code to its [`ErrorKind`].
///
/// Never fails: unrecognized codes (including `VMNET_SUCCESS`, which is not
/// an error) become [`ErrorKind::Unknown`].
#[must_use]
pub const fn classify(code: u32) -> ErrorKind {
    match code {
        VMNET_FAILURE => ErrorKind::Failure,
        VMNET_MEM_FAILURE => ErrorKind::MemFailure,
        VMNET_INVALID_ARGUMENT => ErrorKind::InvalidArgument,
        VMNET_SETUP_INCOMPLETE => ErrorKind::SetupIncomplete,
        VMNET_INVALID_ACCESS => ErrorKind::InvalidAccess,
        VMNET_PACKET_TOO_BIG => ErrorKind::PacketTooBig,
        VMNET_BUFFER_EXHAUSTED => ErrorKind::BufferExhausted,
        VMNET_TOO_MANY_PACKETS => ErrorKind::TooManyPackets,
        VMNET_SHARING_SERVICE_BUSY => ErrorKind::SharingServiceBusy,
        VMNET_NOT_AUTHORIZED => ErrorKind::NotAuthorized,
        other => ErrorKind::Unknown(other),
    }
}

/// Converts a native status into a `Result`.
///
/// # Errors
///
/// Returns the classified status as [`VmnetError::Native`] unless it is
/// `VMNET_SUCCESS`.
pub fn check(code: u32) -> Result<()> {
    if code == VMNET_SUCCESS {
        Ok(())
    } else {
        Err(VmnetError::Native(classify(code)))
    }
}

/// Errors that can occur during vmnet operations.
#[derive(Debug, Error)]
pub enum VmnetError {
    /// The host service reported a failure status.
    #[error("vmnet: {0}")]
    Native(ErrorKind),

    /// The process lacks the privilege required to create interfaces.
    #[error("permission denied: vmnet requires root or the com.apple.vm.networking entitlement")]
    PermissionDenied,

    /// The capability does not exist on this host version.
    #[error("API not supported by this host: {0}")]
    ApiNotSupported(&'static str),

    /// The host dropped a completion without ever invoking it.
    #[error("host dropped a pending completion")]
    CompletionAbandoned,

    /// A read buffer is shorter than the interface's maximum packet size.
    #[error("buffer too small: {len} < {required}")]
    BufferTooSmall {
        /// Supplied buffer length.
        len: usize,
        /// Required minimum (the maximum packet size).
        required: usize,
    },

    /// `wait_for_packets` was used before the event bridge was installed.
    #[error("event bridge not installed")]
    EventsNotInstalled,

    /// The event bridge was installed twice.
    #[error("event bridge already installed")]
    EventsAlreadyInstalled,

    /// The interface has been stopped.
    #[error("interface stopped")]
    Stopped,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmnetError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns the native status kind, if this is a native error.
    #[must_use]
    pub const fn native_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Native(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if this is the given native error.
    #[must_use]
    pub fn is_native(&self, kind: ErrorKind) -> bool {
        self.native_kind() == Some(kind)
    }
}

impl From<ErrorKind> for VmnetError {
    fn from(kind: ErrorKind) -> Self {
        Self::Native(kind)
    }
}

impl From<figment::Error> for VmnetError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
