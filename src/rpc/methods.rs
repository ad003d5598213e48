//! The two symmetric method dictionaries (spec component 4.2).
//!
//! Modeled as non-overlapping enums rather than stringly-typed maps so the
//! dispatch `match` in [`super::RpcClient`] is exhaustiveness-checked by the
//! compiler: adding a new peer-callable method without handling it is a
//! build failure, not a runtime `METHOD_UNKNOWN`.

use std::fmt;

/// Methods the host may call on the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMethod {
    InitializeHost,
    BeginHostShutdown,
    SendIoCall,
    SendPage,
    SendLoadingCall,
    SendLog,
    SendRedirect,
    MarkTransactionComplete,
}

impl HostMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InitializeHost => "INITIALIZE_HOST",
            Self::BeginHostShutdown => "BEGIN_HOST_SHUTDOWN",
            Self::SendIoCall => "SEND_IO_CALL",
            Self::SendPage => "SEND_PAGE",
            Self::SendLoadingCall => "SEND_LOADING_CALL",
            Self::SendLog => "SEND_LOG",
            Self::SendRedirect => "SEND_REDIRECT",
            Self::MarkTransactionComplete => "MARK_TRANSACTION_COMPLETE",
        }
    }
}

impl fmt::Display for HostMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Methods the orchestrator may call on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdkMethod {
    StartTransaction,
    IoResponse,
    CloseTransaction,
    OpenPage,
    ClosePage,
}

impl SdkMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartTransaction => "START_TRANSACTION",
            Self::IoResponse => "IO_RESPONSE",
            Self::CloseTransaction => "CLOSE_TRANSACTION",
            Self::OpenPage => "OPEN_PAGE",
            Self::ClosePage => "CLOSE_PAGE",
        }
    }

    /// Parse a wire method name back into an [`SdkMethod`]; unrecognized
    /// names surface as `METHOD_UNKNOWN` by the caller.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "START_TRANSACTION" => Some(Self::StartTransaction),
            "IO_RESPONSE" => Some(Self::IoResponse),
            "CLOSE_TRANSACTION" => Some(Self::CloseTransaction),
            "OPEN_PAGE" => Some(Self::OpenPage),
            "CLOSE_PAGE" => Some(Self::ClosePage),
            _ => None,
        }
    }
}

impl fmt::Display for SdkMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
