use std::fmt;

/// A basic error type from this library.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Like a classic EAGAIN. The receiver should retry.
    Again,

    /// A generic error message.
    Msg(String),

    /// Error during parsing of ip address
    ParseIpAddr(String),

    /// A host, service, instance or subtype name that mDNS cannot carry.
    InvalidName(String),

    /// The service instance is already published by this responder.
    AlreadyPublished(String),

    /// A media or IP version bitmask with no meaning.
    UnsupportedMedia(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(s) => write!(f, "{}", s),
            Error::ParseIpAddr(s) => write!(f, "parsing of ip addr failed, reason: {}", s),
            Error::Again => write!(f, "try again"),
            Error::InvalidName(s) => write!(f, "invalid name: {}", s),
            Error::AlreadyPublished(s) => write!(f, "already published: {}", s),
            Error::UnsupportedMedia(bits) => write!(f, "unsupported media bits: {:#x}", bits),
        }
    }
}

impl std::error::Error for Error {}

/// One and only `Result` type from this library crate.
pub type Result<T> = core::result::Result<T, Error>;

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

pub(crate) use e_fmt;
