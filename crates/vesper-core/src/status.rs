//! NT status codes carried in response headers.
//!
//! Only the codes the engine itself emits or branches on are named; any
//! 32-bit value round-trips through the codec untouched, so application
//! handlers are free to use the full status space.

use core::fmt;

/// A 32-bit NT status code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    /// The operation completed successfully.
    pub const SUCCESS: NtStatus = NtStatus(0x0000_0000);
    /// The operation is still in progress (async interim response).
    pub const PENDING: NtStatus = NtStatus(0x0000_0103);
    /// More authentication round trips are required.
    pub const MORE_PROCESSING_REQUIRED: NtStatus = NtStatus(0xC000_0016);
    /// A parameter (or message structure) was invalid.
    pub const INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D);
    /// The message was not a valid SMB message.
    pub const INVALID_SMB: NtStatus = NtStatus(0x0001_0002);
    /// Access denied.
    pub const ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022);
    /// The authentication attempt failed.
    pub const LOGON_FAILURE: NtStatus = NtStatus(0xC000_006D);
    /// The request is not supported (no common dialect, unknown command).
    pub const NOT_SUPPORTED: NtStatus = NtStatus(0xC000_00BB);
    /// The request was cancelled.
    pub const CANCELLED: NtStatus = NtStatus(0xC000_0120);
    /// The referenced session has been logged off or deleted.
    pub const USER_SESSION_DELETED: NtStatus = NtStatus(0xC000_0203);
    /// Insufficient server resources (credit exhaustion).
    pub const INSUFF_SERVER_RESOURCES: NtStatus = NtStatus(0xC000_0205);
    /// The referenced session has expired and must re-authenticate.
    pub const NETWORK_SESSION_EXPIRED: NtStatus = NtStatus(0xC000_035C);

    /// Whether the severity bits mark this status as an error.
    pub fn is_error(self) -> bool {
        self.0 >> 30 == 0b11
    }

    /// Symbolic name, for diagnostics.
    pub fn name(self) -> Option<&'static str> {
        match self {
            Self::SUCCESS => Some("STATUS_SUCCESS"),
            Self::PENDING => Some("STATUS_PENDING"),
            Self::MORE_PROCESSING_REQUIRED => Some("STATUS_MORE_PROCESSING_REQUIRED"),
            Self::INVALID_PARAMETER => Some("STATUS_INVALID_PARAMETER"),
            Self::INVALID_SMB => Some("STATUS_INVALID_SMB"),
            Self::ACCESS_DENIED => Some("STATUS_ACCESS_DENIED"),
            Self::LOGON_FAILURE => Some("STATUS_LOGON_FAILURE"),
            Self::NOT_SUPPORTED => Some("STATUS_NOT_SUPPORTED"),
            Self::CANCELLED => Some("STATUS_CANCELLED"),
            Self::USER_SESSION_DELETED => Some("STATUS_USER_SESSION_DELETED"),
            Self::INSUFF_SERVER_RESOURCES => Some("STATUS_INSUFF_SERVER_RESOURCES"),
            Self::NETWORK_SESSION_EXPIRED => Some("STATUS_NETWORK_SESSION_EXPIRED"),
            _ => None,
        }
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "NtStatus(0x{:08X})", self.0),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
