//! Implementation of Password Authenticated Connection Establishment.


pub mod info;
pub mod oids;
pub mod params;


use std::fmt;

use der::asn1::ObjectIdentifier;
use der::Encode;
use digest::Digest;
use rand::rngs::OsRng;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt::{self, KeyExchange};
use crate::crypt::cipher_mac::{pad_iso9797_method2, Cam3Des, CamAes128, CamAes192, CamAes256, CipherAndMac};
use crate::der_util::{self, encode_tlv};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::pace::info::PaceInfo;
use crate::pace::oids::{Mapping, Protocol, SymmetricCipher};
use crate::secure_messaging::{ChannelKind, SecureChannel};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingPublicKeys,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}


#[derive(Debug)]
pub enum Error {
    NotSupported,
    MappingNotSupported { protocol: ObjectIdentifier },
    SecurityInfosDecoding,
    OperationFailed {
        operation: Operation,
        response: Response,
    },
    CustomParameters,
    IncompatibleProtocolParameter {
        protocol: ObjectIdentifier,
        parameter: u32,
    },
    UnexpectedType {
        operation: Operation,
        type_tag: u32,
    },
    TlvEncoding {
        operation: Operation,
    },
    DiffieHellmanKeysEqual,
    MutualAuthentication,
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::NotSupported
                => write!(f, "PACE is not supported"),
            Self::MappingNotSupported { protocol }
                => write!(f, "the mapping of protocol {} is currently not supported", protocol),
            Self::SecurityInfosDecoding
                => write!(f, "failed to decode security infos"),
            Self::OperationFailed { operation, response }
                => write!(f, "operation {:?} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::CustomParameters
                => write!(f, "custom parameters are not currently supported"),
            Self::IncompatibleProtocolParameter { protocol, parameter }
                => write!(f, "protocol {} is incompatible with parameter {}", protocol, parameter),
            Self::UnexpectedType { operation, type_tag }
                => write!(f, "operation {:?} received response of unexpected type 0x{:02X}", operation, type_tag),
            Self::TlvEncoding { operation }
                => write!(f, "invalid TLV encoding for operation {:?}", operation),
            Self::DiffieHellmanKeysEqual
                => write!(f, "terminal and chip Diffie-Hellman keys are equal"),
            Self::MutualAuthentication
                => write!(f, "mutual authentication failed"),
            Self::Crypto(e)
                => write!(f, "cryptographic error: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordSource {
    Mrz,
    Can,
}


/// Returns the cipher and MAC combination for the given symmetric cipher.
pub fn cipher_and_mac_for(cipher: SymmetricCipher) -> Box<dyn CipherAndMac> {
    match cipher {
        SymmetricCipher::TripleDes => Box::new(Cam3Des),
        SymmetricCipher::Aes128 => Box::new(CamAes128),
        SymmetricCipher::Aes192 => Box::new(CamAes192),
        SymmetricCipher::Aes256 => Box::new(CamAes256),
    }
}


/// Extracts the data object `inner_tag` from the dynamic authentication data object `0x7C` in a
/// GENERAL AUTHENTICATE response.
fn extract_dynamic_authentication_data(operation: Operation, response: &Response, inner_tag: u32) -> Result<Zeroizing<Vec<u8>>, Error> {
    let (outer, _rest) = der_util::parse_tlv(&response.data)
        .ok_or(Error::TlvEncoding { operation })?;
    if outer.tag != 0x7C {
        return Err(Error::UnexpectedType { operation, type_tag: outer.tag });
    }
    let children = outer.children()
        .ok_or(Error::TlvEncoding { operation })?;
    let first = children.first()
        .ok_or(Error::TlvEncoding { operation })?;
    if first.tag != inner_tag {
        return Err(Error::UnexpectedType { operation, type_tag: first.tag });
    }
    // with Chip Authentication Mapping, the final step carries additional objects after the token
    Ok(Zeroizing::new(first.value.to_vec()))
}


fn general_authenticate<C: SmartCard + ?Sized>(
    card: &mut C,
    operation: Operation,
    last_in_chain: bool,
    request_tag: Option<u32>,
    request_value: &[u8],
    response_tag: u32,
) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    let mut inner = Zeroizing::new(Vec::new());
    if let Some(tag) = request_tag {
        encode_tlv(&mut inner, tag, request_value);
    }
    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, 0x7C, &inner); // dynamic authentication data

    let request = Apdu {
        header: CommandHeader {
            // chaining bit set except on the last command; no secure messaging, logical channel 0
            cla: if last_in_chain { 0b000_0_00_00 } else { 0b000_1_00_00 },
            ins: 0x86, // GENERAL AUTHENTICATE
            p1: 0x00, // algorithm is known (from "set authentication template")
            p2: 0x00, // key index is known (from "set authentication template")
        },
        data: Data::BothDataShort {
            request_data,
            response_data_length: 0,
        },
    };
    let response = card.communicate(&request)?;
    if !response.trailer.is_success() {
        return Err(Error::OperationFailed {
            operation,
            response,
        }.into());
    }
    Ok(extract_dynamic_authentication_data(operation, &response, response_tag)?)
}


#[instrument(skip(card))]
pub fn set_authentication_template<C: SmartCard + ?Sized>(card: &mut C, mechanism: &ObjectIdentifier, password_source: PasswordSource) -> Result<(), CommunicationError> {
    let mut request_data = Vec::new();

    // encode mechanism (0x80)
    encode_tlv(&mut request_data, 0x80, mechanism.as_bytes());

    // encode password source (0x83)
    let password_reference = match password_source {
        PasswordSource::Mrz => 0x01,
        PasswordSource::Can => 0x02,
    };
    encode_tlv(&mut request_data, 0x83, &[password_reference]);

    // do it
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x22, // MANAGE SECURITY ENVIRONMENT
            p1: 0b1100_0001, // verify/encrypt/extauth, compute/decrypt/intauth, set
            p2: 0xA4, // control reference template for authentication
        },
        data: Data::RequestDataShort { request_data },
    };
    let response = card.communicate(&request)?;
    if response.trailer.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed {
            operation: Operation::SetAuthenticationTemplate,
            response,
        }.into())
    }
}


#[instrument(skip(card))]
pub fn obtain_encrypted_nonce<C: SmartCard + ?Sized>(card: &mut C) -> Result<Zeroizing<Vec<u8>>, CommunicationError> {
    general_authenticate(card, Operation::ObtainNonce, false, None, &[], 0x80)
}


/// Calculates the token used for mutual authentication.
///
/// The token is the MAC over the other party's public key wrapped in a public key data object
/// (`0x7F49`) along with the protocol identifier.
fn calculate_mutual_token(
    cipher_and_mac: &dyn CipherAndMac,
    protocol: &ObjectIdentifier,
    public_key_tag: u8,
    public_key: &[u8],
    k_session_mac: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let protocol_bytes = protocol.to_der()
        .map_err(|_| Error::Crypto(crypt::Error::InvalidDomainParameters))?;

    // inner structure:
    // 0x06 LL protocol_oid
    // keytag LL pubkey
    let mut inner_data = Zeroizing::new(protocol_bytes);
    encode_tlv(&mut inner_data, public_key_tag.into(), public_key);

    // outer structure:
    // 0x7F_0x49 LL inner_data
    let mut outer_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut outer_data, 0x7F49, &inner_data);

    if cipher_and_mac.mac_block_size() > 1 {
        pad_iso9797_method2(&mut outer_data, cipher_and_mac.mac_block_size());
    }

    Ok(cipher_and_mac.mac_padded_data(&outer_data, k_session_mac)?)
}


/// Derives the nonce decryption key from the password.
///
/// For the MRZ, the password is the SHA-1 hash of the MRZ information; a CAN is used as-is.
fn password_key(cipher_and_mac: &dyn CipherAndMac, password_source: PasswordSource, password: &[u8]) -> Zeroizing<Vec<u8>> {
    match password_source {
        PasswordSource::Mrz => {
            let mut mrz_hasher = Sha1::new();
            mrz_hasher.update(password);
            let mrz_hash = Zeroizing::new(mrz_hasher.finalize().to_vec());
            cipher_and_mac.derive_key_from_password(&mrz_hash)
        },
        PasswordSource::Can => cipher_and_mac.derive_key_from_password(password),
    }
}


/// Performs a generic mapping key exchange using specific values.
///
/// `mrz_data` is the MRZ information (document number, date of birth and date of expiry, each
/// with its check digit). The private keys are big-endian unsigned integers.
#[instrument(skip_all, fields(protocol = %protocol))]
pub fn perform_gm_kex_with_values<C: SmartCard + ?Sized>(
    card: &mut C,
    protocol: &ObjectIdentifier,
    key_exchange: KeyExchange,
    cipher_and_mac: Box<dyn CipherAndMac>,
    mrz_data: &[u8],
    encrypted_nonce: &[u8],
    derivation_private_key: &[u8],
    session_private_key: &[u8],
) -> Result<SecureChannel, CommunicationError> {
    let nonce_key = password_key(&*cipher_and_mac, PasswordSource::Mrz, mrz_data);

    // decrypt the nonce
    if encrypted_nonce.len() % cipher_and_mac.cipher_block_size() != 0 {
        return Err(Error::Crypto(crypt::Error::DataLength { obtained: encrypted_nonce.len() }).into());
    }
    let nonce_iv = vec![0u8; cipher_and_mac.cipher_block_size()];
    let mut nonce = Zeroizing::new(encrypted_nonce.to_vec());
    cipher_and_mac.decrypt_padded_data(&mut nonce, &nonce_key, &nonce_iv)
        .map_err(Error::from)?;

    // derive the ephemeral domain parameters for generic mapping using Diffie-Hellman
    let session_key_exchange = {
        let public_key_bytes = key_exchange.calculate_public_key(derivation_private_key)
            .map_err(Error::from)?;
        let card_public_key_bytes = general_authenticate(
            card, Operation::ExchangeMappingPublicKeys, false, Some(0x81), &public_key_bytes, 0x82,
        )?;
        key_exchange.derive_generic_mapping(&nonce, derivation_private_key, &card_public_key_bytes)
            .map_err(Error::from)?
    };

    // second round of key agreement with the new parameters
    let public_key_bytes = session_key_exchange.calculate_public_key(session_private_key)
        .map_err(Error::from)?;
    let card_public_key_bytes = general_authenticate(
        card, Operation::ExchangeEphemeralPublicKeys, false, Some(0x83), &public_key_bytes, 0x84,
    )?;
    if public_key_bytes.ct_eq(card_public_key_bytes.as_slice()).into() {
        return Err(Error::DiffieHellmanKeysEqual.into());
    }
    let shared_secret_bytes = session_key_exchange.exchange_keys(session_private_key, &card_public_key_bytes)
        .map_err(Error::from)?;

    // derive keys
    let k_session_enc = cipher_and_mac.derive_encryption_key(&shared_secret_bytes);
    let k_session_mac = cipher_and_mac.derive_mac_key(&shared_secret_bytes);

    // mutual authentication
    let outgoing_token = calculate_mutual_token(
        &*cipher_and_mac,
        protocol,
        key_exchange.public_key_tag(),
        &card_public_key_bytes,
        &k_session_mac,
    )?;
    let expected_token = calculate_mutual_token(
        &*cipher_and_mac,
        protocol,
        key_exchange.public_key_tag(),
        &public_key_bytes,
        &k_session_mac,
    )?;
    let incoming_token = general_authenticate(
        card, Operation::MutualAuthentication, true, Some(0x85), &outgoing_token, 0x86,
    )?;
    if !bool::from(incoming_token.ct_eq(&expected_token)) {
        return Err(Error::MutualAuthentication.into());
    }

    // set up secure messaging
    // the initial send sequence counter is all-zeroes for PACE
    let send_sequence_counter = vec![0u8; cipher_and_mac.cipher_block_size()];
    debug!("PACE mutual authentication succeeded");
    Ok(SecureChannel::new(
        cipher_and_mac,
        ChannelKind::Pace,
        &k_session_enc,
        &k_session_mac,
        &send_sequence_counter,
    )?)
}


/// Performs a generic mapping key exchange with freshly generated private keys.
fn perform_gm_kex<C: SmartCard + ?Sized>(
    card: &mut C,
    protocol: &ObjectIdentifier,
    key_exchange: KeyExchange,
    cipher_and_mac: Box<dyn CipherAndMac>,
    mrz_data: &[u8],
    encrypted_nonce: &[u8],
) -> Result<SecureChannel, CommunicationError> {
    let derivation_private_key = key_exchange.generate_private_key(&mut OsRng);
    let session_private_key = key_exchange.generate_private_key(&mut OsRng);

    perform_gm_kex_with_values(
        card,
        protocol,
        key_exchange,
        cipher_and_mac,
        mrz_data,
        encrypted_nonce,
        &derivation_private_key,
        &session_private_key,
    )
}


fn key_exchange_for(pace_info: &PaceInfo, protocol: &Protocol) -> Result<KeyExchange, Error> {
    if protocol.mapping == Mapping::Integrated {
        return Err(Error::MappingNotSupported { protocol: pace_info.protocol });
    }

    // we currently only support standard parameters (Doc 9303 Part 11 § 9.5.1)
    let parameter_id = pace_info.parameter_id
        .ok_or(Error::CustomParameters)?;
    params::standardized_key_exchange(protocol.key_agreement, parameter_id)
        .ok_or(Error::IncompatibleProtocolParameter {
            protocol: pace_info.protocol,
            parameter: parameter_id,
        })
}


/// Chooses the PACE protocol and domain parameters to use from the given `PACEInfo` entries.
///
/// The first entry whose mapping is supported and whose parameters are standardized wins.
pub fn choose_protocol(pace_infos: &[PaceInfo]) -> Result<(PaceInfo, Protocol, KeyExchange), Error> {
    let mut first_error = None;
    for pace_info in pace_infos {
        let Some(protocol) = Protocol::from_oid(&pace_info.protocol) else { continue };
        match key_exchange_for(pace_info, &protocol) {
            Ok(key_exchange) => return Ok((pace_info.clone(), protocol, key_exchange)),
            Err(e) => {
                debug!(protocol = %pace_info.protocol, error = %e, "skipping PACEInfo");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            },
        }
    }
    Err(first_error.unwrap_or(Error::NotSupported))
}


/// Authenticates with the card using PACE.
///
/// `security_infos` is the `SecurityInfos` structure read from `EF.CardAccess` (or extracted from
/// `EF.CardSecurity`); `mrz_data` corresponds to the concatenation of document number (including
/// check digit), date of birth (including check digit) and date of expiry (including check digit).
///
/// Chip Authentication Mapping runs the generic mapping key agreement; the encrypted chip
/// authentication data returned in the last step is not evaluated.
#[instrument(skip_all)]
pub fn establish<C: SmartCard + ?Sized>(
    card: &mut C,
    security_infos: &[u8],
    mrz_data: &[u8],
) -> Result<SecureChannel, CommunicationError> {
    let pace_infos = info::parse_pace_infos(security_infos)?;
    let (pace_info, protocol, key_exchange) = choose_protocol(&pace_infos)?;
    debug!(protocol = %pace_info.protocol, parameter_id = ?pace_info.parameter_id, "chose PACE protocol");
    let cipher_and_mac = cipher_and_mac_for(protocol.cipher);

    // choose the encryption method
    set_authentication_template(card, &pace_info.protocol, PasswordSource::Mrz)?;

    // obtain the encrypted nonce from the chip
    let nonce_data = obtain_encrypted_nonce(card)?;

    perform_gm_kex(
        card, &pace_info.protocol, key_exchange, cipher_and_mac, mrz_data, &nonce_data,
    )
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pace::oids;
    use hex_literal::hex;

    #[test]
    fn integrated_mapping_is_skipped_for_generic() {
        let infos = [
            PaceInfo { protocol: oids::PACE_ECDH_IM_AES_CBC_CMAC_128, version: 2, parameter_id: Some(13) },
            PaceInfo { protocol: oids::PACE_ECDH_GM_AES_CBC_CMAC_256, version: 2, parameter_id: Some(12) },
        ];
        let (chosen, protocol, key_exchange) = choose_protocol(&infos).unwrap();
        assert_eq!(chosen.protocol, oids::PACE_ECDH_GM_AES_CBC_CMAC_256);
        assert_eq!(protocol.cipher, SymmetricCipher::Aes256);
        assert_eq!(key_exchange.public_key_tag(), 0x86);
    }

    #[test]
    fn integrated_mapping_alone_is_unsupported() {
        let infos = [
            PaceInfo { protocol: oids::PACE_DH_IM_3DES_CBC_CBC, version: 2, parameter_id: Some(0) },
        ];
        assert!(matches!(choose_protocol(&infos), Err(Error::MappingNotSupported { .. })));
        assert!(matches!(choose_protocol(&[]), Err(Error::NotSupported)));
    }

    #[test]
    fn custom_parameters_are_rejected() {
        let infos = [
            PaceInfo { protocol: oids::PACE_ECDH_GM_3DES_CBC_CBC, version: 2, parameter_id: None },
        ];
        assert!(matches!(choose_protocol(&infos), Err(Error::CustomParameters)));
    }

    #[test]
    fn chip_authentication_token_is_extracted_first() {
        let response = Response {
            data: hex!("7C 14 86 08 01 02 03 04 05 06 07 08 8A 08 AA BB CC DD EE FF 00 11").to_vec(),
            trailer: crate::iso7816::apdu::ResponseTrailer::SUCCESS,
        };
        let token = extract_dynamic_authentication_data(Operation::MutualAuthentication, &response, 0x86).unwrap();
        assert_eq!(token.as_slice(), &hex!("01 02 03 04 05 06 07 08"));

        assert!(matches!(
            extract_dynamic_authentication_data(Operation::MutualAuthentication, &response, 0x84),
            Err(Error::UnexpectedType { type_tag: 0x86, .. }),
        ));
    }
}
