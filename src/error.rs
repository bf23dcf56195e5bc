use std::result::Result as StdResult;

use hyper::http::uri::InvalidUri;
use thiserror::Error;

pub type Result<O> = StdResult<O, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not a magnet uri")]
    NotAMagnet,

    #[error("info hash must be 40 hex or 32 base32 characters")]
    InvalidInfoHash,

    #[error("invalid web seed uri")]
    InvalidSeedUri(InvalidUri),

    #[error("malformed http request")]
    HttpRequest(hyper::http::Error),

    #[error("http transport error")]
    Http(hyper::Error),

    #[error("web seed answered with status {0}")]
    SeedStatus(hyper::StatusCode),

    #[error("tracker sent an invalid response")]
    InvalidTrackerResp { failure_reason: Option<String> },

    #[error("cache io error")]
    CacheIo(std::io::Error),
}

impl From<InvalidUri> for Error {
    fn from(e: InvalidUri) -> Self {
        Error::InvalidSeedUri(e)
    }
}

impl From<hyper::http::Error> for Error {
    fn from(e: hyper::http::Error) -> Self {
        Error::HttpRequest(e)
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Self {
        Error::Http(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::CacheIo(e)
    }
}
