use std::fmt;

/// Error kinds the core distinguishes, per the error handling design.
#[derive(Debug)]
#[allow(dead_code)]
pub enum BuffyError {
    /// Bad upstream URL, missing config file, unknown `proxy_mode`, or a
    /// proxy-type endpoint with no resolvable upstream. Fatal at startup.
    Configuration(String),
    /// Unknown response template name or an unreadable `file://` body.
    Template(String),
    /// Admin operation against an unknown upstream id or invalid gate action.
    Admin(String),
}

impl fmt::Display for BuffyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuffyError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            BuffyError::Template(msg) => write!(f, "buffy[yaml]: {}", msg),
            BuffyError::Admin(msg) => write!(f, "admin error: {}", msg),
        }
    }
}

impl std::error::Error for BuffyError {}
