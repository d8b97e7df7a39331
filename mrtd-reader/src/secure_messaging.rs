//! Secure Messaging.
//!
//! Once BAC or PACE has established session keys, every command is wrapped into data objects that
//! are encrypted (`0x87`/`0x85`) and authenticated (`0x8E`), and every response is unwrapped
//! correspondingly. Both sides count exchanges in the send sequence counter, which is part of every
//! MAC and (with AES) of every IV.


use std::fmt;

use zeroize_derive::ZeroizeOnDrop;

use crate::crypt;
use crate::crypt::cipher_mac::{pad_iso9797_method2, unpad_iso9797_method2, CipherAndMac};
use crate::der_util::{encode_primitive_length, encode_tlv, parse_all, Tlv};
use crate::iso7816::apdu::{Apdu, Data, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};


#[derive(Debug)]
pub enum Error {
    ResponseMac,
    ResponseTlvFormat,
    MissingResponseMac,
    MissingResponseData,
    MissingResponseStatus,
    StatusLength { obtained: Vec<u8> },
    UnknownPadding { padding_mode: u8 },
    InvalidPadding,
    SendSequenceCounterExhausted,
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
            Self::ResponseTlvFormat
                => write!(f, "response has an invalid TLV format"),
            Self::MissingResponseMac
                => write!(f, "response does not contain a MAC"),
            Self::MissingResponseData
                => write!(f, "response does not contain data"),
            Self::MissingResponseStatus
                => write!(f, "response does not contain status"),
            Self::StatusLength { obtained }
                => write!(f, "status has unexpected length {}", obtained.len()),
            Self::UnknownPadding { padding_mode }
                => write!(f, "response payload has unknown padding mode {}", padding_mode),
            Self::InvalidPadding
                => write!(f, "response payload has invalid padding"),
            Self::SendSequenceCounterExhausted
                => write!(f, "send sequence counter exhausted"),
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


/// The protocol that established a secure channel.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ChannelKind {
    Bac,
    Pace,
}
impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bac => write!(f, "BAC"),
            Self::Pace => write!(f, "PACE"),
        }
    }
}


/// Session keys and send sequence counter of an established Secure Messaging channel.
///
/// The send sequence counter only ever increases; once it would wrap around, the channel refuses
/// further use.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    #[zeroize(skip)] cipher_and_mac: Box<dyn CipherAndMac>,
    #[zeroize(skip)] kind: ChannelKind,
    k_session_enc: Vec<u8>,
    k_session_mac: Vec<u8>,
    send_sequence_counter: Vec<u8>,
}
impl SecureChannel {
    /// Creates a secure channel.
    ///
    /// The send sequence counter must be as long as a cipher block.
    pub fn new(
        cipher_and_mac: Box<dyn CipherAndMac>,
        kind: ChannelKind,
        k_session_enc: &[u8],
        k_session_mac: &[u8],
        send_sequence_counter: &[u8],
    ) -> Result<Self, Error> {
        if k_session_enc.len() != cipher_and_mac.cipher_key_size() {
            return Err(crypt::Error::KeyLength { obtained: k_session_enc.len() }.into());
        }
        if send_sequence_counter.len() != cipher_and_mac.cipher_block_size() {
            return Err(crypt::Error::DataLength { obtained: send_sequence_counter.len() }.into());
        }
        Ok(Self {
            cipher_and_mac,
            kind,
            k_session_enc: k_session_enc.to_vec(),
            k_session_mac: k_session_mac.to_vec(),
            send_sequence_counter: send_sequence_counter.to_vec(),
        })
    }

    pub fn kind(&self) -> ChannelKind { self.kind }
    pub fn send_sequence_counter(&self) -> &[u8] { &self.send_sequence_counter }
    pub fn cipher_block_size(&self) -> usize { self.cipher_and_mac.cipher_block_size() }

    /// Increment the send sequence counter and return the incremented value.
    fn increment_send_sequence_counter(&mut self) -> Result<Vec<u8>, Error> {
        let mut carry = true;
        for b in self.send_sequence_counter.iter_mut().rev() {
            let (sum, overflow) = b.overflowing_add(1);
            *b = sum;
            if !overflow {
                // the buck stops here
                carry = false;
                break;
            }
        }
        if carry {
            // wrapped around to zero; a repeated counter would repeat IVs and MAC inputs
            return Err(Error::SendSequenceCounterExhausted);
        }
        Ok(self.send_sequence_counter.clone())
    }

    fn padded(&self, mut data: Vec<u8>) -> Vec<u8> {
        pad_iso9797_method2(&mut data, self.cipher_and_mac.cipher_block_size());
        data
    }

    /// Protects a command APDU, consuming one send sequence counter value.
    pub fn wrap_command(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        let mut my_request = request.clone();

        // add secure messaging mark to CLA (header is part of MAC)
        my_request.header.cla |= 0b000_0_11_00;

        // collect the padded header
        let padded_header = self.padded(my_request.header.to_bytes().to_vec());

        // increment the SSC
        let send_sequence_counter = self.increment_send_sequence_counter()?;

        let mut body_data = Vec::new();

        if let Some(request_data) = request.data.request_data() {
            let mut padded_data = self.padded(request_data.to_vec());

            // encrypt data with session key
            let iv = self.cipher_and_mac.secure_messaging_iv(&self.k_session_enc, &send_sequence_counter)?;
            self.cipher_and_mac.encrypt_padded_data(&mut padded_data, &self.k_session_enc, &iv)?;

            if request.header.ins & 0b1 == 0 {
                // Data Object 87: 0x87 len padtype data...
                // padtype is 0x01 for ISO 7816 padding
                let mut value = Vec::with_capacity(1 + padded_data.len());
                value.push(0x01);
                value.extend(&padded_data);
                encode_tlv(&mut body_data, 0x87, &value);
            } else {
                // odd instructions carry BER-TLV data in Data Object 85 without the padding byte
                encode_tlv(&mut body_data, 0x85, &padded_data);
            }
        }

        // are we expecting something in return?
        match &request.data {
            Data::NoData|Data::RequestDataShort { .. }|Data::RequestDataExtended { .. } => {
                // no
            },
            Data::ResponseDataShort { response_data_length }|Data::BothDataShort { response_data_length, .. } => {
                // yes; append single-byte data object 97
                encode_tlv(&mut body_data, 0x97, &[*response_data_length]);
            },
            Data::ResponseDataExtended { response_data_length }|Data::BothDataExtended { response_data_length, .. } => {
                // yes; append two-byte data object 97
                encode_tlv(&mut body_data, 0x97, &response_data_length.to_be_bytes());
            },
        }

        // to compute the MAC, concatenate SSC, padded new header, and data
        let mut mac_data = Vec::new();
        mac_data.extend(&send_sequence_counter);
        mac_data.extend(&padded_header);
        mac_data.extend(&body_data);
        let mac_data = self.padded(mac_data);
        let mac = self.cipher_and_mac.mac_padded_data(&mac_data, &self.k_session_mac)?;

        // build data object 8E and append it to the body
        body_data.push(0x8E);
        encode_primitive_length(&mut body_data, mac.len());
        body_data.extend(mac.iter());

        // update data in APDU
        let extended = body_data.len() > 255 || matches!(
            request.data,
            Data::ResponseDataExtended { .. } | Data::BothDataExtended { .. } | Data::RequestDataExtended { .. }
        );
        my_request.data = if extended {
            Data::BothDataExtended {
                request_data: body_data,
                response_data_length: 0,
            }
        } else {
            Data::BothDataShort {
                request_data: body_data,
                response_data_length: 0,
            }
        };
        Ok(my_request)
    }

    /// Verifies and decrypts a protected response APDU, consuming one send sequence counter value.
    ///
    /// A response without any data objects is an unprotected error status and passed through as-is.
    pub fn unwrap_response(&mut self, response: Response) -> Result<Response, Error> {
        if response.data.is_empty() && !response.trailer.is_success() {
            return Ok(response);
        }

        // decode the raw response
        let received_fields: Vec<Tlv<'_>> = parse_all(&response.data)
            .ok_or(Error::ResponseTlvFormat)?;

        // assemble the fields for the MAC verification
        let mut received_mac_fields = Vec::new();
        let mut received_mac_opt = None;
        for field in received_fields {
            if field.tag == 0x8E {
                // the MAC itself
                received_mac_opt = Some(field.value);
            } else if field.tag & 0b1 != 0 {
                // part of the MAC
                received_mac_fields.push(field);
            }
        }

        let Some(received_mac) = received_mac_opt else {
            return Err(Error::MissingResponseMac);
        };

        // increment the SSC
        let ssc_for_received = self.increment_send_sequence_counter()?;

        // verify MAC
        let mut data = Vec::new();
        data.extend(&ssc_for_received);
        for field in &received_mac_fields {
            data.extend(field.header);
            data.extend(field.value);
        }
        let data = self.padded(data);
        if !self.cipher_and_mac.verify_mac_padded_data(&data, &self.k_session_mac, received_mac)? {
            return Err(Error::ResponseMac);
        }

        // extract the actual response data
        let encrypted_field = received_mac_fields.iter()
            .find(|tlv| tlv.tag == 0x87 || tlv.tag == 0x85);
        let actual_response_data = match encrypted_field {
            None => Vec::with_capacity(0),
            Some(field) => {
                let mut encrypted_data = if field.tag == 0x87 {
                    if field.value.len() == 0 {
                        return Err(Error::MissingResponseData);
                    }
                    if field.value[0] != 0x01 {
                        // not ISO 7816 padding
                        return Err(Error::UnknownPadding { padding_mode: field.value[0] });
                    }
                    field.value[1..].to_vec()
                } else {
                    field.value.to_vec()
                };

                let iv = self.cipher_and_mac.secure_messaging_iv(&self.k_session_enc, &ssc_for_received)?;
                self.cipher_and_mac.decrypt_padded_data(encrypted_data.as_mut_slice(), &self.k_session_enc, &iv)?;

                unpad_iso9797_method2(&mut encrypted_data)
                    .ok_or(Error::InvalidPadding)?;
                encrypted_data
            },
        };

        let actual_status = received_mac_fields.iter()
            .find(|tlv| tlv.tag == 0x99)
            .ok_or(Error::MissingResponseStatus)?;
        if actual_status.value.len() != 2 {
            return Err(Error::StatusLength { obtained: actual_status.value.to_vec() });
        }

        Ok(Response {
            data: actual_response_data,
            trailer: ResponseTrailer {
                sw1: actual_status.value[0],
                sw2: actual_status.value[1],
            },
        })
    }

    /// Sends a command through this channel over the given card.
    pub fn communicate<C: SmartCard + ?Sized>(&mut self, card: &mut C, request: &Apdu) -> Result<Response, CommunicationError> {
        let protected_request = self.wrap_command(request)?;
        let protected_response = card.communicate(&protected_request)?;
        Ok(self.unwrap_response(protected_response)?)
    }
}
impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // keys stay out of logs
        f.debug_struct("SecureChannel")
            .field("kind", &self.kind)
            .field("cipher_block_size", &self.cipher_and_mac.cipher_block_size())
            .finish_non_exhaustive()
    }
}


/// A smart card whose communication is wrapped in an established secure channel.
pub struct SecureCard<'a, C: SmartCard + ?Sized> {
    card: &'a mut C,
    channel: &'a mut SecureChannel,
}
impl<'a, C: SmartCard + ?Sized> SecureCard<'a, C> {
    pub fn new(card: &'a mut C, channel: &'a mut SecureChannel) -> Self {
        Self { card, channel }
    }
}
impl<'a, C: SmartCard + ?Sized> SmartCard for SecureCard<'a, C> {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.channel.communicate(self.card, request)
    }
}
