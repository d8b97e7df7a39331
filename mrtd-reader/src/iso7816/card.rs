use std::fmt;

use tracing::trace;

use crate::bac;
use crate::cancellation::Cancellation;
use crate::iso7816::apdu;
use crate::pace;
use crate::secure_messaging::{self, SecureChannel};
use crate::transport::{Transport, TransportError};


#[derive(Debug)]
pub enum CommunicationError {
    Write(apdu::WriteError),
    Transport(TransportError),
    ShortResponse,
    SecureMessaging(secure_messaging::Error),
    Bac(bac::Error),
    Pace(pace::Error),
    Cancelled,
}
impl CommunicationError {
    /// Whether the failure was caused by the contactless link rather than by the chip's answer.
    pub fn is_transport_fault(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write(e) => write!(f, "APDU write error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::ShortResponse => write!(f, "response too short"),
            Self::SecureMessaging(e) => write!(f, "Secure Messaging error: {}", e),
            Self::Bac(e) => write!(f, "BAC error: {}", e),
            Self::Pace(e) => write!(f, "PACE error: {}", e),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
impl std::error::Error for CommunicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Write(e) => Some(e),
            Self::Transport(e) => Some(e),
            Self::ShortResponse => None,
            Self::SecureMessaging(e) => Some(e),
            Self::Bac(e) => Some(e),
            Self::Pace(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}
impl From<apdu::WriteError> for CommunicationError {
    fn from(value: apdu::WriteError) -> Self { Self::Write(value) }
}
impl From<TransportError> for CommunicationError {
    fn from(value: TransportError) -> Self { Self::Transport(value) }
}
impl From<secure_messaging::Error> for CommunicationError {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}
impl From<bac::Error> for CommunicationError {
    fn from(value: bac::Error) -> Self { Self::Bac(value) }
}
impl From<pace::Error> for CommunicationError {
    fn from(value: pace::Error) -> Self { Self::Pace(value) }
}


/// A smart card compatible with ISO/IEC 7816.
pub trait SmartCard {
    /// Send a request APDU to the smart card and receive a response APDU.
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError>;
}
impl<C: SmartCard + ?Sized> SmartCard for &mut C {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}
impl<C: SmartCard + ?Sized> SmartCard for Box<C> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        (**self).communicate(request)
    }
}


/// A smart card reached directly through a [`Transport`], without Secure Messaging.
///
/// Each exchange is a cancellation point.
pub struct TransportCard<T: Transport> {
    transport: T,
    cancellation: Cancellation,
}
impl<T: Transport> TransportCard<T> {
    pub fn new(transport: T, cancellation: Cancellation) -> Self {
        Self {
            transport,
            cancellation,
        }
    }

    pub fn transport(&self) -> &T { &self.transport }
    pub fn transport_mut(&mut self) -> &mut T { &mut self.transport }
    pub fn cancellation(&self) -> &Cancellation { &self.cancellation }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
impl<T: Transport> SmartCard for TransportCard<T> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        if self.cancellation.is_cancelled() {
            return Err(CommunicationError::Cancelled);
        }

        let out_buf = request.to_bytes()?;
        trace!(apdu = %hex::encode_upper(&out_buf), "sending to card");
        let in_buf = self.transport.transceive(&out_buf)?;
        trace!(apdu = %hex::encode_upper(&in_buf), "received from card");
        apdu::Response::from_slice(&in_buf)
            .ok_or(CommunicationError::ShortResponse)
    }
}


/// A smart card reached through a [`Transport`], wrapped in Secure Messaging once a channel has
/// been established.
pub struct CardService<T: Transport> {
    card: TransportCard<T>,
    channel: Option<SecureChannel>,
}
impl<T: Transport> CardService<T> {
    pub fn new(transport: T, cancellation: Cancellation) -> Self {
        Self {
            card: TransportCard::new(transport, cancellation),
            channel: None,
        }
    }

    /// The card without Secure Messaging.
    pub fn plain_card(&mut self) -> &mut TransportCard<T> { &mut self.card }

    pub fn transport(&self) -> &T { self.card.transport() }
    pub fn transport_mut(&mut self) -> &mut T { self.card.transport_mut() }
    pub fn cancellation(&self) -> &Cancellation { self.card.cancellation() }

    pub fn channel(&self) -> Option<&SecureChannel> { self.channel.as_ref() }

    /// Installs the secure channel used for all further communication.
    pub fn set_channel(&mut self, channel: SecureChannel) {
        self.channel = Some(channel);
    }

    /// Drops the secure channel, wiping its keys.
    pub fn clear_channel(&mut self) -> Option<SecureChannel> {
        self.channel.take()
    }

    pub fn into_transport(self) -> T {
        self.card.into_transport()
    }
}
impl<T: Transport> SmartCard for CardService<T> {
    fn communicate(&mut self, request: &apdu::Apdu) -> Result<apdu::Response, CommunicationError> {
        match self.channel.as_mut() {
            Some(channel) => channel.communicate(&mut self.card, request),
            None => self.card.communicate(request),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::CommunicationError;
    use crate::transport::TransportError;

    #[test]
    fn link_failures_are_transport_faults() {
        for error in [TransportError::LinkLost, TransportError::Timeout, TransportError::Io("frame too long".into())] {
            assert!(CommunicationError::from(error).is_transport_fault());
        }
        assert!(!CommunicationError::Cancelled.is_transport_fault());
    }
}
