//! Trusted country signing CA certificates.
//!
//! A master list may be a CMS-signed `CscaMasterList` (as published by ICAO and many states), a PEM
//! bundle or a concatenation of DER certificates. Loading runs on a separate thread so that it
//! overlaps with reading the chip; the session waits for it for a bounded time only.


use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use der::Decode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use x509_cert::Certificate;

use crate::cancellation::Cancellation;
use crate::der_util;
use crate::lds::sod;


/// How often a wait for the master list checks for cancellation.
const CANCELLATION_POLL_INTERVAL: Duration = Duration::from_millis(50);


/// Where the trusted certificates come from.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "location")]
pub enum MasterListSource {
    /// Issuer verification always fails.
    #[default]
    None,

    /// Downloaded through a [`MasterListFetcher`].
    Url(String),

    /// Read from the file system.
    File(PathBuf),

    /// DER-encoded certificates supplied by the caller.
    Certificates(Vec<Vec<u8>>),
}


/// Fetches master lists from the network on behalf of the library.
pub trait MasterListFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, String>;
}


#[derive(Debug)]
pub enum Error {
    Io { path: PathBuf, error: std::io::Error },
    Fetch { url: String, message: String },
    NoFetcher { url: String },
    Decoding(der::Error),
    NoCertificates,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, error }
                => write!(f, "failed to read {}: {}", path.display(), error),
            Self::Fetch { url, message }
                => write!(f, "failed to fetch {}: {}", url, message),
            Self::NoFetcher { url }
                => write!(f, "no fetcher available for {}", url),
            Self::Decoding(e)
                => write!(f, "failed to decode master list: {}", e),
            Self::NoCertificates
                => write!(f, "master list contains no certificates"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { error, .. } => Some(error),
            Self::Decoding(e) => Some(e),
            _ => None,
        }
    }
}
impl From<der::Error> for Error {
    fn from(value: der::Error) -> Self { Self::Decoding(value) }
}


/// Decodes every certificate in a concatenation of DER objects, skipping undecodable ones.
fn decode_certificate_sequence(mut bytes: &[u8]) -> Vec<Certificate> {
    let mut certificates = Vec::new();
    while let Some((tlv, rest)) = der_util::parse_tlv(bytes) {
        let encoded = &bytes[..tlv.total_len()];
        match Certificate::from_der(encoded) {
            Ok(certificate) => certificates.push(certificate),
            Err(e) => debug!(error = %e, "skipping undecodable certificate"),
        }
        bytes = rest;
    }
    certificates
}

/// Decodes a CMS-signed `CscaMasterList` (ICAO Doc 9303 Part 12 § 9).
///
/// The signature on the list itself is not checked; the list is trusted because the caller chose
/// it.
pub fn parse_csca_master_list(bytes: &[u8]) -> Result<Vec<Certificate>, Error> {
    let signed_data = sod::decode_signed_data(bytes)?;
    let content = sod::encapsulated_content(&signed_data)
        .ok_or(Error::NoCertificates)?;

    // CscaMasterList ::= SEQUENCE { version INTEGER, certList SET OF Certificate }
    let (list, _) = der_util::parse_tlv(&content)
        .ok_or(Error::NoCertificates)?;
    let cert_list = list.children()
        .and_then(|children| children.into_iter().find(|c| c.tag == 0x31))
        .ok_or(Error::NoCertificates)?;
    let certificates = decode_certificate_sequence(cert_list.value);
    if certificates.is_empty() {
        return Err(Error::NoCertificates);
    }
    Ok(certificates)
}

/// Decodes certificates from any of the supported master list formats.
pub fn parse_certificates(bytes: &[u8]) -> Result<Vec<Certificate>, Error> {
    if bytes.starts_with(b"-----BEGIN") {
        let certificates = Certificate::load_pem_chain(bytes)?;
        if certificates.is_empty() {
            return Err(Error::NoCertificates);
        }
        return Ok(certificates);
    }

    if let Ok(certificates) = parse_csca_master_list(bytes) {
        return Ok(certificates);
    }

    let certificates = decode_certificate_sequence(bytes);
    if certificates.is_empty() {
        return Err(Error::NoCertificates);
    }
    Ok(certificates)
}

pub fn load_file(path: &Path) -> Result<Vec<Certificate>, Error> {
    let bytes = std::fs::read(path)
        .map_err(|error| Error::Io { path: path.to_owned(), error })?;
    parse_certificates(&bytes)
}

/// Loads the master list synchronously. Returns `Ok(None)` if no source is configured.
pub fn load(source: &MasterListSource, fetcher: Option<&dyn MasterListFetcher>) -> Result<Option<Vec<Certificate>>, Error> {
    let certificates = match source {
        MasterListSource::None => return Ok(None),
        MasterListSource::Url(url) => {
            let fetcher = fetcher
                .ok_or_else(|| Error::NoFetcher { url: url.clone() })?;
            let bytes = fetcher.fetch(url)
                .map_err(|message| Error::Fetch { url: url.clone(), message })?;
            parse_certificates(&bytes)?
        },
        MasterListSource::File(path) => load_file(path)?,
        MasterListSource::Certificates(ders) => {
            let certificates: Vec<Certificate> = ders.iter()
                .filter_map(|der| Certificate::from_der(der).ok())
                .collect();
            if certificates.is_empty() && !ders.is_empty() {
                return Err(Error::NoCertificates);
            }
            certificates
        },
    };
    Ok(Some(certificates))
}


/// The outcome of waiting for a master list.
#[derive(Debug)]
pub enum MasterListStatus {
    Available(Vec<Certificate>),
    Absent,
    Unavailable,

    /// The session was cancelled while waiting.
    Cancelled,
}
impl MasterListStatus {
    /// The certificates, or an empty slice if there are none.
    pub fn certificates(&self) -> &[Certificate] {
        match self {
            Self::Available(certificates) => certificates,
            Self::Absent | Self::Unavailable | Self::Cancelled => &[],
        }
    }
}


/// A master list that is being loaded in the background.
#[derive(Debug)]
pub struct PendingMasterList {
    receiver: Option<mpsc::Receiver<Result<Option<Vec<Certificate>>, Error>>>,
}
impl PendingMasterList {
    /// Starts loading the master list from `source` on a separate thread.
    pub fn spawn(source: MasterListSource, fetcher: Option<Arc<dyn MasterListFetcher>>) -> Self {
        if source == MasterListSource::None {
            return Self::absent();
        }
        let (sender, receiver) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("mrtd-master-list".to_owned())
            .spawn(move || {
                let result = load(&source, fetcher.as_deref());
                // the session may have given up waiting
                let _ = sender.send(result);
            });
        match spawned {
            Ok(_) => Self { receiver: Some(receiver) },
            Err(e) => {
                warn!(error = %e, "failed to spawn master list loader");
                Self { receiver: None }
            },
        }
    }

    pub fn absent() -> Self {
        Self { receiver: None }
    }

    /// Waits up to `timeout` for the master list, giving up early once `cancellation` fires.
    pub fn wait(self, timeout: Duration, cancellation: &Cancellation) -> MasterListStatus {
        let Some(receiver) = self.receiver else {
            return MasterListStatus::Absent;
        };
        let deadline = Instant::now() + timeout;
        let received = loop {
            if cancellation.is_cancelled() {
                debug!("stopped waiting for the master list");
                return MasterListStatus::Cancelled;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining.min(CANCELLATION_POLL_INTERVAL)) {
                Err(mpsc::RecvTimeoutError::Timeout) if !remaining.is_zero() => continue,
                other => break other,
            }
        };
        match received {
            Ok(Ok(Some(certificates))) => {
                info!(count = certificates.len(), "master list loaded");
                MasterListStatus::Available(certificates)
            },
            Ok(Ok(None)) => MasterListStatus::Absent,
            Ok(Err(e)) => {
                warn!(error = %e, "master list unavailable");
                MasterListStatus::Unavailable
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(?timeout, "gave up waiting for the master list");
                MasterListStatus::Unavailable
            },
            Err(mpsc::RecvTimeoutError::Disconnected) => MasterListStatus::Unavailable,
        }
    }
}
