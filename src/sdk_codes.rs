//! Stable diagnostic codes included in lifecycle log messages.
//!
//! The codes are shared with the other feature-flag SDKs so that operators can grep for the same
//! `SDKCODE:nnnn` across languages.
use std::fmt;

/// A lifecycle event with a stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum SdkCode {
    InitOk,
    InitAuthFailed,
    InitMissingKey,
    InitWaiting,
    AuthOk,
    AuthFailed,
    AuthRetriesExceeded,
    CloseStarted,
    CloseOk,
    PollingStarted,
    PollingStopped,
    StreamConnected,
    StreamDisconnected,
    StreamEvent,
    StreamRetrying,
    StreamStopped,
    DefaultServed,
    MetricsStarted,
}

impl SdkCode {
    /// Numeric code.
    pub fn code(self) -> u16 {
        match self {
            SdkCode::InitOk => 1000,
            SdkCode::InitAuthFailed => 1001,
            SdkCode::InitMissingKey => 1002,
            SdkCode::InitWaiting => 1003,
            SdkCode::AuthOk => 2000,
            SdkCode::AuthFailed => 2001,
            SdkCode::AuthRetriesExceeded => 2003,
            SdkCode::CloseStarted => 3000,
            SdkCode::CloseOk => 3001,
            SdkCode::PollingStarted => 4000,
            SdkCode::PollingStopped => 4001,
            SdkCode::StreamConnected => 5000,
            SdkCode::StreamDisconnected => 5001,
            SdkCode::StreamEvent => 5002,
            SdkCode::StreamRetrying => 5003,
            SdkCode::StreamStopped => 5004,
            SdkCode::DefaultServed => 6001,
            SdkCode::MetricsStarted => 7000,
        }
    }

    /// Human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            SdkCode::InitOk => "The SDK has successfully initialized",
            SdkCode::InitAuthFailed => {
                "The SDK has failed to initialize due to an authentication error - defaults will be served"
            }
            SdkCode::InitMissingKey => {
                "The SDK has failed to initialize due to a missing or empty API key - defaults will be served"
            }
            SdkCode::InitWaiting => "The SDK is waiting for initialization to complete",
            SdkCode::AuthOk => "Authentication was successful",
            SdkCode::AuthFailed => "Authentication failed with a non-recoverable error",
            SdkCode::AuthRetriesExceeded => {
                "Authentication failed and max retries have been exceeded"
            }
            SdkCode::CloseStarted => "Closing SDK",
            SdkCode::CloseOk => "SDK Closed successfully",
            SdkCode::PollingStarted => "Polling started, interval:",
            SdkCode::PollingStopped => "Polling stopped, reason:",
            SdkCode::StreamConnected => "SSE stream successfully connected",
            SdkCode::StreamDisconnected => "SSE stream disconnected, reason:",
            SdkCode::StreamEvent => "SSE event received:",
            SdkCode::StreamRetrying => "SSE retrying to connect in",
            SdkCode::StreamStopped => "SSE stopped",
            SdkCode::DefaultServed => "Default variation was served",
            SdkCode::MetricsStarted => "Metrics processor started",
        }
    }
}

impl fmt::Display for SdkCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDKCODE:{}: {}", self.code(), self.message())
    }
}
