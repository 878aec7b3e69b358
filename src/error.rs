use axerrno::AxError;
use thiserror::Error;

/// Status codes returned through the carrier entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpacError {
    /// Unknown handle, slot out of range, or an address outside a window.
    #[error("bad address")]
    BadAddress,
    /// The parameter string was malformed or inconsistent.
    #[error("bad carrier parameter: {0}")]
    BadParam(&'static str),
    /// A bus window could not be registered or mapped.
    #[error("no memory for window")]
    NoMemory,
    #[error("command not implemented by this carrier")]
    NotImplemented,
    /// An identity check found the wrong board.
    #[error("unexpected board signature")]
    BadModule,
    /// Nothing answered at the resolved address.
    #[error("no module present")]
    NoModule,
    /// The underlying device could not be opened or driven.
    #[error("device driver unavailable")]
    BadDriver,
    /// The slot is the hidden partner of a double-wide pair.
    #[error("slot is inaccessible in the current double-wide configuration")]
    Inaccessible,
    #[error("bad interrupt level or line")]
    BadIntLevel,
    /// A transient failure talking to the interrupt device.
    #[error("device I/O error")]
    Io,
    /// The interrupt event source has gone away for good.
    #[error("device gone")]
    DeviceGone,
}

pub type IpacResult<T> = Result<T, IpacError>;

impl From<IpacError> for AxError {
    fn from(err: IpacError) -> Self {
        match err {
            IpacError::BadAddress => AxError::BadAddress,
            IpacError::BadParam(_) | IpacError::BadIntLevel => AxError::InvalidInput,
            IpacError::NoMemory => AxError::NoMemory,
            IpacError::NotImplemented => AxError::Unsupported,
            IpacError::BadModule => AxError::InvalidData,
            IpacError::NoModule => AxError::NotFound,
            IpacError::BadDriver => AxError::BadState,
            IpacError::Inaccessible => AxError::PermissionDenied,
            IpacError::Io | IpacError::DeviceGone => AxError::Io,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_to_axerror() {
        assert_eq!(AxError::from(IpacError::NoMemory), AxError::NoMemory);
        assert_eq!(AxError::from(IpacError::BadParam("x")), AxError::InvalidInput);
        assert_eq!(AxError::from(IpacError::NotImplemented), AxError::Unsupported);
    }

    #[test]
    fn absent_and_inaccessible_are_distinct() {
        assert_ne!(IpacError::Inaccessible, IpacError::NoModule);
        assert_ne!(AxError::from(IpacError::Inaccessible), AxError::from(IpacError::NoModule));
    }
}
