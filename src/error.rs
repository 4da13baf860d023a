use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum ProxyCacheError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Http(hyper::http::Error),
    /// The request line could not be parsed from the first read.
    MalformedRequest,
    InvalidUri(String),
    /// The request carries no usable `Host` header.
    MissingHost,
    /// The cache path exceeds the supported path length.
    NotCacheable(PathBuf),
    UpstreamStatus(hyper::StatusCode, String),
    Timeout(Duration),
}

impl std::fmt::Display for ProxyCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::HyperUtil(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::MalformedRequest => f.write_str("Malformed request line"),
            Self::InvalidUri(uri) => write!(f, "Invalid URI `{uri}`"),
            Self::MissingHost => f.write_str("Request has no Host header"),
            Self::NotCacheable(path) => {
                write!(f, "Cache path `{}` is too long", path.display())
            }
            Self::UpstreamStatus(status, uri) => {
                write!(f, "Upstream returned status {status} for `{uri}`")
            }
            Self::Timeout(duration) => {
                write!(f, "Operation timed out after {}s", duration.as_secs_f32())
            }
        }
    }
}

impl std::error::Error for ProxyCacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Hyper(e) => Some(e),
            Self::HyperUtil(e) => Some(e),
            Self::Http(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProxyCacheError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for ProxyCacheError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyCacheError {
    fn from(value: hyper_util::client::legacy::Error) -> Self {
        Self::HyperUtil(value)
    }
}

impl From<hyper::http::Error> for ProxyCacheError {
    fn from(value: hyper::http::Error) -> Self {
        Self::Http(value)
    }
}

impl ProxyCacheError {
    /// Errors after which the request is still served by relaying it unchanged.
    #[must_use]
    pub(crate) const fn is_fallback(&self) -> bool {
        matches!(self, Self::NotCacheable(_))
    }
}
