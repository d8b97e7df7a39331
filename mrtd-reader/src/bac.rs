//! Basic Access Control.


use std::fmt;

use block_padding::{Iso7816, RawPadding};
use digest::Digest;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::Sha1;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt;
use crate::crypt::cipher_mac::{Cam3Des, CipherAndMac};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::secure_messaging::{ChannelKind, SecureChannel};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GetChallenge,
    ExternalAuthenticate,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetChallenge => write!(f, "GET CHALLENGE"),
            Self::ExternalAuthenticate => write!(f, "EXTERNAL AUTHENTICATE"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MismatchedValue {
    RndIc,
    RndIfd,
}


#[derive(Debug)]
pub enum Error {
    OperationFailed { operation: Operation, response: Response },
    LengthMismatch {
        operation: Operation,
        obtained: Vec<u8>,
        expected_length: usize,
    },
    ResponseMac,
    ValueMismatch { value: MismatchedValue },
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::OperationFailed { operation, response }
                => write!(f, "{} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::LengthMismatch { operation, obtained, expected_length }
                => write!(f, "{} response has length {}, expected {}", operation, obtained.len(), expected_length),
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
            Self::ValueMismatch { value }
                => write!(f, "{:?} mismatched", value),
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


#[instrument(skip(card))]
fn get_challenge<C: SmartCard + ?Sized>(card: &mut C) -> Result<[u8; 8], CommunicationError> {
    let response = card.communicate(&Apdu::get_challenge())?;
    if !response.trailer.is_success() {
        return Err(Error::OperationFailed { operation: Operation::GetChallenge, response }.into());
    }
    if response.data.len() != 8 {
        return Err(Error::LengthMismatch {
            operation: Operation::GetChallenge,
            obtained: response.data.clone(),
            expected_length: 8,
        }.into());
    }
    let mut ret = [0u8; 8];
    ret.copy_from_slice(response.data.as_slice());
    Ok(ret)
}


/// Derives the BAC key seed from the MRZ information (document number, date of birth and date of
/// expiry, each followed by its check digit).
pub fn derive_key_seed(mrz_data: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut sha1 = Sha1::new();
    Digest::update(&mut sha1, mrz_data);
    let sha1_hash = sha1.finalize();
    let mut k_seed = Zeroizing::new([0u8; 16]);
    k_seed.copy_from_slice(&sha1_hash[0..16]);
    k_seed
}


/// Performs mutual authentication with the given challenges and key material, returning the
/// resulting secure channel.
#[instrument(skip_all)]
pub fn establish_from_values<C: SmartCard + ?Sized>(
    card: &mut C,
    k_seed: &[u8],
    rnd_ic: &[u8],
    rnd_ifd: &[u8],
    k_ifd: &[u8],
) -> Result<SecureChannel, CommunicationError> {
    // derive the keys
    // (the key derivation functions have remained the same with PACE)
    let k_enc = Cam3Des.derive_encryption_key(k_seed);
    let k_mac = Cam3Des.derive_mac_key(k_seed);

    // concatenate the three values
    let mut ext_auth_data = Zeroizing::new([0u8; 32+8]);
    ext_auth_data[0..8].copy_from_slice(&rnd_ifd);
    ext_auth_data[8..16].copy_from_slice(&rnd_ic);
    ext_auth_data[16..32].copy_from_slice(&k_ifd);

    // encrypt with an all-zeroes IV and no padding
    let iv = [0u8; 8];
    debug_assert_eq!(32 % Cam3Des.cipher_block_size(), 0);
    Cam3Des.encrypt_padded_data(&mut ext_auth_data[0..32], &k_enc, &iv)
        .map_err(Error::from)?;
    // ext_auth_data[0..32] is now encrypted

    // pad according to ISO 7816, then generate MAC
    Iso7816::raw_pad(&mut ext_auth_data[..], 32);
    let mac = Cam3Des.mac_padded_data(&ext_auth_data[..], &k_mac)
        .map_err(Error::from)?;
    // MAC fits right where the padding was
    ext_auth_data[32..32+8].copy_from_slice(mac.as_slice());

    // send EXTERNAL AUTHENTICATE
    let ext_auth_request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x82, // EXTERNAL AUTHENTICATE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::BothDataShort {
            request_data: ext_auth_data.to_vec(),
            response_data_length: 40,
        },
    };
    let mut ext_auth_response = card.communicate(&ext_auth_request)?;
    if !ext_auth_response.trailer.is_success() {
        return Err(Error::OperationFailed {
            operation: Operation::ExternalAuthenticate,
            response: ext_auth_response,
        }.into());
    }
    if ext_auth_response.data.len() != 40 {
        return Err(Error::LengthMismatch {
            operation: Operation::ExternalAuthenticate,
            obtained: ext_auth_response.data.clone(),
            expected_length: 40,
        }.into());
    }

    // verify MAC of what we obtained
    let mut response_data_to_verify = [0u8; 32+8];
    response_data_to_verify[0..32].copy_from_slice(&ext_auth_response.data[0..32]);
    Iso7816::raw_pad(&mut response_data_to_verify, 32);
    let mac_matches = Cam3Des.verify_mac_padded_data(&response_data_to_verify, &k_mac, &ext_auth_response.data[32..32+8])
        .map_err(Error::from)?;
    if !mac_matches {
        return Err(Error::ResponseMac.into());
    }

    // decrypt
    let iv = [0u8; 8];
    Cam3Des.decrypt_padded_data(&mut ext_auth_response.data[0..32], &k_enc, &iv)
        .map_err(Error::from)?;
    let decrypted_slice = &ext_auth_response.data[0..32];

    let rnd_ic_second = &decrypted_slice[0..8];
    let rnd_ifd_second = &decrypted_slice[8..16];
    let k_ic = Zeroizing::new(decrypted_slice[16..32].to_vec());

    if rnd_ic != rnd_ic_second {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIc }.into());
    }
    if rnd_ifd != rnd_ifd_second {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIfd }.into());
    }

    let mut k_session_seed = Zeroizing::new([0u8; 16]);
    for ((kss, kifd), kic) in k_session_seed.iter_mut().zip(k_ifd.iter()).zip(k_ic.iter()) {
        *kss = *kifd ^ *kic;
    }
    ext_auth_response.data.iter_mut().for_each(|b| *b = 0);

    let k_session_enc = Cam3Des.derive_encryption_key(&k_session_seed[..]);
    let k_session_mac = Cam3Des.derive_mac_key(&k_session_seed[..]);

    let mut send_sequence_counter = [0u8; 8];
    send_sequence_counter[0..4].copy_from_slice(&rnd_ic[4..8]);
    send_sequence_counter[4..8].copy_from_slice(&rnd_ifd[4..8]);

    debug!("BAC mutual authentication succeeded");
    Ok(SecureChannel::new(
        Box::new(Cam3Des),
        ChannelKind::Bac,
        &k_session_enc,
        &k_session_mac,
        &send_sequence_counter,
    )?)
}

/// Performs Basic Access Control with the given MRZ information, returning the resulting secure
/// channel.
#[instrument(skip_all)]
pub fn establish<C: SmartCard + ?Sized>(card: &mut C, mrz_data: &[u8]) -> Result<SecureChannel, CommunicationError> {
    let k_seed = derive_key_seed(mrz_data);

    // obtain the challenge
    let rnd_ic = get_challenge(card)?;

    // generate some random bytes
    let mut rnd_ifd = [0u8; 8];
    let mut k_ifd = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut rnd_ifd);
    OsRng.fill_bytes(&mut k_ifd[..]);

    establish_from_values(card, &k_seed[..], &rnd_ic, &rnd_ifd, &k_ifd[..])
}


#[cfg(test)]
mod tests {
    use super::derive_key_seed;
    use hex_literal::hex;

    #[test]
    fn key_seed_from_mrz_information() {
        // ICAO Doc 9303 Part 11 Appendix D.2
        let k_seed = derive_key_seed(b"L898902C<369080619406236");
        assert_eq!(&k_seed[..], &hex!("239AB9CB282DAF66231DC5A4DF6BFBAE"));
    }
}
