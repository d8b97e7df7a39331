//! Choosing and establishing the secure channel.
//!
//! PACE is attempted if the chip publishes `PACEInfo` in `EF.CardAccess` (or `EF.CardSecurity`);
//! any PACE failure falls back to BAC. Neither protocol is retried: the chip may already have
//! consumed a nonce.


use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::bac;
use crate::iso7816::card::{CardService, CommunicationError, SmartCard};
use crate::lds::EfIdentifier;
use crate::mrz::AccessKey;
use crate::pace;
use crate::reader::{self, read_file_once, select_application};
use crate::secure_messaging::{ChannelKind, SecureChannel};
use crate::transport::Transport;


/// The access control protocols, separated out so that they can be replaced in tests.
pub trait AccessControl {
    fn pace(&mut self, card: &mut dyn SmartCard, security_infos: &[u8], mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError>;
    fn bac(&mut self, card: &mut dyn SmartCard, mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError>;
}

/// PACE and BAC as specified in ICAO Doc 9303 Part 11.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Icao9303;
impl AccessControl for Icao9303 {
    fn pace(&mut self, card: &mut dyn SmartCard, security_infos: &[u8], mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
        pace::establish(card, security_infos, mrz_information)
    }

    fn bac(&mut self, card: &mut dyn SmartCard, mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
        bac::establish(card, mrz_information)
    }
}


#[derive(Debug)]
pub enum Error {
    Cancelled,

    /// The link failed while running BAC.
    Transport(CommunicationError),

    /// Neither PACE nor BAC established a channel.
    AuthenticationFailed { pace: Option<reader::Error>, bac: CommunicationError },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled
                => write!(f, "cancelled"),
            Self::Transport(e)
                => write!(f, "link failed during access control: {}", e),
            Self::AuthenticationFailed { pace: Some(pace), bac }
                => write!(f, "PACE failed ({}) and BAC failed ({})", pace, bac),
            Self::AuthenticationFailed { pace: None, bac }
                => write!(f, "BAC failed ({})", bac),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Transport(e) => Some(e),
            Self::AuthenticationFailed { bac, .. } => Some(bac),
        }
    }
}


/// Reads the `SecurityInfos` from `EF.CardAccess`, or from `EF.CardSecurity` if the former is
/// missing. Returns `None` if neither can be read.
pub fn discover_security_infos<C: SmartCard + ?Sized>(card: &mut C, block_size: u8) -> Result<Option<Vec<u8>>, Error> {
    match read_file_once(card, EfIdentifier::CardAccess, block_size, &mut |_, _| {}) {
        Ok(card_access) => return Ok(Some(card_access)),
        Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
        Err(e) => debug!(error = %e, "EF.CardAccess unavailable"),
    }
    match read_file_once(card, EfIdentifier::CardSecurity, block_size, &mut |_, _| {}) {
        Ok(card_security) => match pace::info::security_infos_from_card_security(&card_security) {
            Ok(infos) => Ok(Some(infos)),
            Err(e) => {
                debug!(error = %e, "EF.CardSecurity unusable");
                Ok(None)
            },
        },
        Err(e) if e.is_cancelled() => Err(Error::Cancelled),
        Err(e) => {
            debug!(error = %e, "EF.CardSecurity unavailable");
            Ok(None)
        },
    }
}


fn establish_pace<T: Transport, A: AccessControl + ?Sized>(
    service: &mut CardService<T>,
    access_control: &mut A,
    security_infos: &[u8],
    mrz_information: &[u8],
) -> Result<(), reader::Error> {
    let channel = access_control.pace(service.plain_card(), security_infos, mrz_information)?;
    service.set_channel(channel);
    select_application(service)
}


/// Establishes a secure channel on `service` and selects the eMRTD application.
///
/// On success, the channel is installed in `service` and its kind is returned.
#[instrument(skip_all)]
pub fn negotiate<T: Transport, A: AccessControl + ?Sized>(
    service: &mut CardService<T>,
    access_control: &mut A,
    access_key: &AccessKey,
    block_size: u8,
) -> Result<ChannelKind, Error> {
    service.clear_channel();
    let mrz_information = access_key.mrz_information();

    let mut pace_error = None;
    match discover_security_infos(service.plain_card(), block_size)? {
        Some(security_infos) => {
            match establish_pace(service, access_control, &security_infos, mrz_information.as_bytes()) {
                Ok(()) => {
                    info!("secure channel established with PACE");
                    return Ok(ChannelKind::Pace);
                },
                Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(error = %e, "PACE failed; falling back to BAC");
                    service.clear_channel();
                    pace_error = Some(e);
                },
            }
        },
        None => debug!("chip offers no PACE parameters"),
    }

    match select_application(service) {
        Ok(()) => {},
        Err(e) if e.is_cancelled() => return Err(Error::Cancelled),
        Err(e) => debug!(error = %e, "selecting the application before BAC failed"),
    }
    match access_control.bac(service.plain_card(), mrz_information.as_bytes()) {
        Ok(channel) => {
            service.set_channel(channel);
            info!("secure channel established with BAC");
            Ok(ChannelKind::Bac)
        },
        Err(CommunicationError::Cancelled) => Err(Error::Cancelled),
        Err(e) if e.is_transport_fault() => Err(Error::Transport(e)),
        Err(bac) => Err(Error::AuthenticationFailed { pace: pace_error, bac }),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use hex_literal::hex;
    use crate::cancellation::Cancellation;
    use crate::crypt::cipher_mac::Cam3Des;
    use crate::iso7816::apdu::{Response, ResponseTrailer};
    use crate::reader::tests::SimulatedChip;
    use crate::transport::TransportError;

    // ICAO Doc 9303 Part 11 Appendix D.3 and D.4
    const K_SESSION_ENC: [u8; 16] = hex!("979EC13B1CBFE9DCD01AB0FED307EAE5");
    const K_SESSION_MAC: [u8; 16] = hex!("F1CB1F1FB5ADF208806B89DC579DC1F8");
    const SSC: [u8; 8] = hex!("887022120C06C226");
    const PROTECTED_SELECT_RESPONSE: [u8; 16] = hex!("990290008E08FA855A5D4C50A8ED 9000");
    const MRZ_INFORMATION: &[u8] = b"L898902C<369080619406236";

    // ICAO Doc 9303 Part 11 Appendix G.1
    const CARD_ACCESS: [u8; 22] = hex!("31 14 30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D");

    fn channel(kind: ChannelKind) -> SecureChannel {
        SecureChannel::new(Box::new(Cam3Des), kind, &K_SESSION_ENC, &K_SESSION_MAC, &SSC).unwrap()
    }

    /// Answers protected commands with the protected `90 00` of Appendix D.
    struct ProtectedChip(SimulatedChip);
    impl Transport for ProtectedChip {
        fn connect(&mut self) -> Result<(), TransportError> { self.0.connect() }
        fn disconnect(&mut self) { self.0.disconnect() }
        fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, TransportError> {
            if command[0] == 0x0C {
                Ok(PROTECTED_SELECT_RESPONSE.to_vec())
            } else {
                self.0.transceive(command)
            }
        }
        fn set_timeout(&mut self, timeout: Duration) { self.0.set_timeout(timeout) }
        fn max_transceive_length(&self) -> usize { self.0.max_transceive_length() }
    }

    #[derive(Default)]
    struct FakeAccessControl {
        pace_calls: Vec<Vec<u8>>,
        bac_calls: usize,
        pace_works: bool,
    }
    impl AccessControl for FakeAccessControl {
        fn pace(&mut self, _card: &mut dyn SmartCard, security_infos: &[u8], mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
            assert_eq!(mrz_information, MRZ_INFORMATION);
            self.pace_calls.push(security_infos.to_vec());
            if self.pace_works {
                Ok(channel(ChannelKind::Pace))
            } else {
                Err(pace::Error::MutualAuthentication.into())
            }
        }

        fn bac(&mut self, _card: &mut dyn SmartCard, mrz_information: &[u8]) -> Result<SecureChannel, CommunicationError> {
            self.bac_calls += 1;
            if mrz_information == MRZ_INFORMATION {
                Ok(channel(ChannelKind::Bac))
            } else {
                Err(bac::Error::OperationFailed {
                    operation: bac::Operation::ExternalAuthenticate,
                    response: Response { data: Vec::new(), trailer: ResponseTrailer::new(0x63, 0x00) },
                }.into())
            }
        }
    }

    fn right_key() -> AccessKey {
        AccessKey::new("L898902C", "690806", "940623")
    }

    #[test]
    fn pace_when_offered() {
        let chip = SimulatedChip::new(&[(EfIdentifier::CardAccess, CARD_ACCESS.to_vec())]);
        let log = chip.log.clone();
        let mut service = CardService::new(ProtectedChip(chip), Cancellation::new());
        let mut access_control = FakeAccessControl { pace_works: true, ..FakeAccessControl::default() };

        let kind = negotiate(&mut service, &mut access_control, &right_key(), 0xE0).unwrap();
        assert_eq!(kind, ChannelKind::Pace);
        assert_eq!(access_control.pace_calls, vec![CARD_ACCESS.to_vec()]);
        assert_eq!(access_control.bac_calls, 0);

        // the application was selected through the channel, not in plain
        assert_eq!(log.lock().unwrap().application_selects, 0);
        let channel = service.channel().unwrap();
        assert_eq!(channel.kind(), ChannelKind::Pace);
        assert_eq!(channel.send_sequence_counter(), &hex!("887022120C06C228"));
    }

    #[test]
    fn bac_without_pace_parameters() {
        let chip = SimulatedChip::new(&[]);
        let log = chip.log.clone();
        let mut service = CardService::new(chip, Cancellation::new());
        let mut access_control = FakeAccessControl::default();

        let kind = negotiate(&mut service, &mut access_control, &right_key(), 0xE0).unwrap();
        assert_eq!(kind, ChannelKind::Bac);
        assert!(access_control.pace_calls.is_empty());
        assert_eq!(access_control.bac_calls, 1);
        assert_eq!(log.lock().unwrap().application_selects, 1);
        assert_eq!(service.channel().map(|c| c.kind()), Some(ChannelKind::Bac));

        let mut service = CardService::new(SimulatedChip::new(&[]), Cancellation::new());
        let wrong_key = AccessKey::new("L898902C", "690806", "940624");
        let error = negotiate(&mut service, &mut access_control, &wrong_key, 0xE0).unwrap_err();
        assert!(matches!(error, Error::AuthenticationFailed { pace: None, bac: CommunicationError::Bac(_) }));
        assert!(service.channel().is_none());
    }

    #[test]
    fn bac_after_failed_pace() {
        let chip = SimulatedChip::new(&[(EfIdentifier::CardAccess, CARD_ACCESS.to_vec())]);
        let mut service = CardService::new(chip, Cancellation::new());
        let mut access_control = FakeAccessControl::default();

        let kind = negotiate(&mut service, &mut access_control, &right_key(), 0xE0).unwrap();
        assert_eq!(kind, ChannelKind::Bac);
        assert_eq!(access_control.pace_calls.len(), 1);
        assert_eq!(access_control.bac_calls, 1);
    }

    #[test]
    fn cancelled_before_start() {
        let cancellation = Cancellation::new();
        let mut service = CardService::new(SimulatedChip::new(&[]), cancellation.clone());
        cancellation.cancel();
        let mut access_control = FakeAccessControl::default();
        let error = negotiate(&mut service, &mut access_control, &right_key(), 0xE0).unwrap_err();
        assert!(matches!(error, Error::Cancelled));
        assert_eq!(access_control.bac_calls, 0);
    }
}
