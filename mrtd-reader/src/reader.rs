//! Reading elementary files over an unreliable contactless link.


use std::fmt;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::config::RetryPolicy;
use crate::der_util;
use crate::iso7816::apdu::{Apdu, Response, ResponseTrailer, EMRTD_APPLICATION_ID, MAX_SHORT_READ_OFFSET};
use crate::iso7816::card::{CardService, CommunicationError, SmartCard};
use crate::lds::EfIdentifier;
use crate::secure_messaging::ChannelKind;
use crate::transport::Transport;


/// Tag of the data object wrapping the response to READ BINARY with the odd instruction byte.
const ODD_READ_RESPONSE_TAG: u32 = 0x53;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SelectApplication,
    SelectFile,
    ReadBinary,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectApplication => write!(f, "SELECT (application)"),
            Self::SelectFile => write!(f, "SELECT (file)"),
            Self::ReadBinary => write!(f, "READ BINARY"),
        }
    }
}


#[derive(Debug)]
pub enum Error {
    Communication(CommunicationError),

    /// The card refused a command.
    Status { file: Option<EfIdentifier>, operation: Operation, response: ResponseTrailer },

    /// The file does not start with a decodable TLV header.
    Header { file: EfIdentifier },

    /// The card ran out of data before the length announced in the header.
    Truncated { file: EfIdentifier, expected: usize, obtained: usize },

    /// Every block size has been tried without success.
    Exhausted { file: EfIdentifier, last_error: Option<Box<Error>> },
}
impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Communication(CommunicationError::Cancelled))
    }

    pub fn is_transport_fault(&self) -> bool {
        match self {
            Self::Communication(e) => e.is_transport_fault(),
            _ => false,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e)
                => write!(f, "{}", e),
            Self::Status { file: Some(file), operation, response }
                => write!(f, "{} of {} failed with status {:04X}", operation, file, response.to_word()),
            Self::Status { file: None, operation, response }
                => write!(f, "{} failed with status {:04X}", operation, response.to_word()),
            Self::Header { file }
                => write!(f, "{} does not start with a TLV header", file),
            Self::Truncated { file, expected, obtained }
                => write!(f, "{} ended after {} of {} bytes", file, obtained, expected),
            Self::Exhausted { file, last_error: Some(e) }
                => write!(f, "failed to read {} at every block size; last error: {}", file, e),
            Self::Exhausted { file, last_error: None }
                => write!(f, "failed to read {}: no block sizes to try", file),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::Exhausted { last_error: Some(e), .. } => Some(e.as_ref()),
            _ => None,
        }
    }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}


/// Selects the eMRTD application.
///
/// After PACE, the selection is protected by the established channel; otherwise it is sent in
/// plain, which is also what BAC expects before it starts.
pub fn select_application<T: Transport>(service: &mut CardService<T>) -> Result<(), Error> {
    let request = Apdu::select_application(&EMRTD_APPLICATION_ID);
    let response = match service.channel().map(|c| c.kind()) {
        Some(ChannelKind::Pace) => service.communicate(&request)?,
        _ => service.plain_card().communicate(&request)?,
    };
    if !response.trailer.is_success() {
        return Err(Error::Status { file: None, operation: Operation::SelectApplication, response: response.trailer });
    }
    Ok(())
}


/// Sends READ BINARY, following up on `61 XX` and `6C XX`.
fn read_binary<C: SmartCard + ?Sized>(card: &mut C, offset: usize, length: u8) -> Result<Response, CommunicationError> {
    let response = card.communicate(&Apdu::read_binary(offset, length))?;
    if let Some(exact) = response.trailer.exact_length() {
        return card.communicate(&Apdu::read_binary(offset, exact));
    }
    if let Some(available) = response.trailer.bytes_available() {
        let mut rest = card.communicate(&Apdu::get_response(available))?;
        let mut data = response.data;
        data.append(&mut rest.data);
        return Ok(Response { data, trailer: rest.trailer });
    }
    Ok(response)
}


/// Reads a whole file in a single pass, `block_size` bytes per command.
///
/// `progress` is called with the number of bytes read so far and the file's total length after
/// every chunk.
pub fn read_file_once<C: SmartCard + ?Sized>(
    card: &mut C,
    file: EfIdentifier,
    block_size: u8,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<Vec<u8>, Error> {
    let select = card.communicate(&Apdu::select_file(file.file_id()))?;
    if !select.trailer.is_success() {
        return Err(Error::Status { file: Some(file), operation: Operation::SelectFile, response: select.trailer });
    }

    let mut data: Vec<u8> = Vec::new();
    let mut total_length: Option<usize> = None;
    loop {
        let requested = match total_length {
            Some(total) => (total - data.len()).min(usize::from(block_size)),
            None => usize::from(block_size),
        };
        let offset = data.len();
        // requested is at most block_size and therefore fits
        let response = read_binary(card, offset, requested as u8)?;
        let end_of_file = response.trailer.is_end_of_file_warning();
        if !response.trailer.is_success() && !end_of_file {
            return Err(Error::Status { file: Some(file), operation: Operation::ReadBinary, response: response.trailer });
        }

        let chunk = if offset > MAX_SHORT_READ_OFFSET {
            match der_util::parse_tlv(&response.data) {
                Some((tlv, _)) if tlv.tag == ODD_READ_RESPONSE_TAG => tlv.value.to_vec(),
                _ => response.data,
            }
        } else {
            response.data
        };
        if chunk.is_empty() {
            break;
        }
        data.extend(chunk);

        if total_length.is_none() {
            total_length = der_util::total_encoded_length(&data);
            if total_length.is_none() && data.len() >= 6 {
                // a tag and a length never take more than six bytes in the LDS
                return Err(Error::Header { file });
            }
        }
        let total = total_length.unwrap_or(data.len());
        if data.len() >= total {
            data.truncate(total);
            progress(total, total);
            break;
        }
        progress(data.len(), total);
        if end_of_file {
            break;
        }
    }

    match total_length {
        Some(total) if data.len() == total => Ok(data),
        Some(total) => Err(Error::Truncated { file, expected: total, obtained: data.len() }),
        None => Err(Error::Header { file }),
    }
}


/// Reads files with reconnects, exponential backoff and block-size fallback.
///
/// A block size that had to be given up on stays given up on for the rest of the session.
pub struct FileReader<'s, T: Transport> {
    service: &'s mut CardService<T>,
    policy: RetryPolicy,
    timeout: Duration,
    block_sizes: Vec<u8>,
    current: usize,
}
impl<'s, T: Transport> FileReader<'s, T> {
    pub fn new(service: &'s mut CardService<T>, policy: RetryPolicy, timeout: Duration) -> Self {
        let max_transceive_length = service.transport().max_transceive_length();
        let block_sizes = match service.channel() {
            Some(channel) => policy.block_sizes_for_channel(max_transceive_length, channel.cipher_block_size()),
            None => policy.block_sizes_for(max_transceive_length),
        };
        Self {
            service,
            policy,
            timeout,
            block_sizes,
            current: 0,
        }
    }

    /// The block size the next read starts with.
    pub fn block_size(&self) -> Option<u8> {
        self.block_sizes.get(self.current).copied()
    }

    pub fn service(&mut self) -> &mut CardService<T> {
        self.service
    }

    #[instrument(skip(self, progress))]
    pub fn read_file(&mut self, file: EfIdentifier, progress: &mut dyn FnMut(usize, usize)) -> Result<Vec<u8>, Error> {
        let mut last_error: Option<Error> = None;
        while let Some(block_size) = self.block_size() {
            if let Some(e) = &last_error {
                warn!(%file, block_size, error = %e, "falling back to a smaller block size");
                match select_application(self.service) {
                    Ok(()) => {},
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => debug!(error = %e, "reselecting the application failed"),
                }
            }

            match self.read_with_backoff(file, block_size, progress) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    last_error = Some(e);
                    self.current += 1;
                },
            }
        }
        Err(Error::Exhausted { file, last_error: last_error.map(Box::new) })
    }

    fn read_with_backoff(&mut self, file: EfIdentifier, block_size: u8, progress: &mut dyn FnMut(usize, usize)) -> Result<Vec<u8>, Error> {
        let mut delay = self.policy.initial_delay;
        let mut attempt = 1;
        loop {
            let error = match self.read_resilient(file, block_size, progress) {
                Ok(data) => return Ok(data),
                Err(e) => e,
            };
            if !error.is_transport_fault() || attempt >= self.policy.max_retries {
                return Err(error);
            }

            warn!(%file, block_size, attempt, ?delay, error = %error, "read failed; backing off");
            if self.service.cancellation().wait_timeout(delay) {
                return Err(CommunicationError::Cancelled.into());
            }
            delay = self.policy.next_delay(delay);
            attempt += 1;
        }
    }

    /// Reads the file; after a transport fault, reconnects, reselects and reads once more.
    fn read_resilient(&mut self, file: EfIdentifier, block_size: u8, progress: &mut dyn FnMut(usize, usize)) -> Result<Vec<u8>, Error> {
        match read_file_once(self.service, file, block_size, progress) {
            Err(e) if e.is_transport_fault() => {
                debug!(%file, block_size, error = %e, "transport fault; reconnecting");
                self.recover()?;
                read_file_once(self.service, file, block_size, progress)
            },
            other => other,
        }
    }

    fn recover(&mut self) -> Result<(), Error> {
        let transport = self.service.transport_mut();
        transport.reconnect().map_err(CommunicationError::from)?;
        transport.set_timeout(self.timeout);
        match select_application(self.service) {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!(error = %e, "reselecting the application failed");
                Ok(())
            },
        }
    }
}
