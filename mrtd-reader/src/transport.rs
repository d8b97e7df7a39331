//! The link to the physical contactless chip.
//!
//! The platform supplies an implementation of [`Transport`]; everything above it speaks APDUs.


use std::fmt;
use std::time::Duration;


/// A failure of the contactless link.
///
/// Every variant is a link problem: reconnecting and repeating the exchange may succeed.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TransportError {
    /// The chip left the field or the connection was otherwise torn down.
    LinkLost,

    /// The chip did not answer within the configured timeout.
    Timeout,

    /// Any other I/O failure reported by the platform.
    Io(String),
}
impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinkLost => write!(f, "tag lost"),
            Self::Timeout => write!(f, "timed out waiting for the tag"),
            Self::Io(message) => write!(f, "I/O error: {}", message),
        }
    }
}
impl std::error::Error for TransportError {
}


/// A contactless (ISO/IEC 14443) connection to a travel document chip.
///
/// Implementations are not expected to be safe for concurrent use; the session engine drives a
/// transport from exactly one thread at a time.
pub trait Transport: Send {
    /// Establishes the connection.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Tears down the connection. Must be safe to call on an already-closed connection.
    fn disconnect(&mut self);

    /// Re-establishes a connection after a transient fault.
    ///
    /// The default implementation simply connects again without disconnecting first.
    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.connect()
    }

    /// Sends a command APDU and returns the raw response APDU including the status word.
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Sets the timeout for a single exchange.
    fn set_timeout(&mut self, timeout: Duration);

    /// The maximum number of bytes the link can carry in one exchange.
    fn max_transceive_length(&self) -> usize;
}
impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<(), TransportError> { (**self).connect() }
    fn disconnect(&mut self) { (**self).disconnect() }
    fn reconnect(&mut self) -> Result<(), TransportError> { (**self).reconnect() }
    fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> { (**self).transceive(command) }
    fn set_timeout(&mut self, timeout: Duration) { (**self).set_timeout(timeout) }
    fn max_transceive_length(&self) -> usize { (**self).max_transceive_length() }
}
