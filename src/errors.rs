use thiserror::Error;

/// Template-level and startup-level failures. These surface to the caller of
/// `ScanController::start_scan` before any address is probed.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid range token {token}: {reason}")]
    RangeSyntax { token: String, reason: String },

    #[error("template expands to {count} addresses, above the limit of {limit}")]
    MaxRangeExceeded { count: u128, limit: u64 },

    #[error("failed to start scan thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failures confined to one address. They never escalate past "this address
/// is invalid" and end up as the `error` text of a `ProbeResult`.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timeout after {0}s")]
    Timeout(f64),

    #[error("{0}")]
    Process(String),

    #[error("unparsable inspector output: {0}")]
    Parse(String),

    #[error("unreachable: {0}")]
    Reachability(String),

    #[error("probe cancelled")]
    Cancelled,

    #[error("failed to launch inspector: {0}")]
    Io(#[from] std::io::Error),
}
