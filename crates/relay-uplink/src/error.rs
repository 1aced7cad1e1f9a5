//! Uplink error types

use std::fmt;

use thiserror::Error;

/// What an uplink reported as missing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Package,
    File,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Package => write!(f, "package doesn't exist on uplink"),
            Missing::File => write!(f, "file doesn't exist on uplink"),
        }
    }
}

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("uplink is offline")]
    Offline,

    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("bad status code: {status}")]
    BadStatus { status: u16 },

    /// Non-2xx answer to a tarball transfer
    #[error("bad uplink status code: {status}")]
    BadUplinkStatus { status: u16 },

    #[error("{0}")]
    NotFound(Missing),

    #[error("Malformed response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    #[error("Uplink returned error: {0}")]
    Upstream(String),

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Unsupported uplink URL: {0}")]
    UnsupportedUrl(String),

    #[error("Invalid proxy {proxy}: {source}")]
    InvalidProxy {
        proxy: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("Invalid CA bundle: {0}")]
    InvalidCertificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tarball stream is closed")]
    StreamClosed,
}

impl UplinkError {
    /// Status an outer server should answer with when relaying this error
    pub fn http_status(&self) -> u16 {
        match self {
            UplinkError::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Status received from the uplink, if the error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            UplinkError::BadStatus { status } | UplinkError::BadUplinkStatus { status } => {
                Some(*status)
            }
            UplinkError::NotFound(_) => Some(404),
            UplinkError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, UplinkError::NotFound(_))
    }
}
