//! Configuration of a reading session.


use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use time::macros::format_description;

use crate::master_list::MasterListSource;
use crate::mrz::{self, AccessKey, DateKind};


/// Timeout of a single card exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// How long issuer verification waits for the master list before giving up on it.
pub const DEFAULT_MASTER_LIST_WAIT: Duration = Duration::from_secs(10);

/// Links carrying more than this many bytes support extended-length APDUs.
const EXTENDED_LENGTH_THRESHOLD: usize = 261;

const LARGE_BLOCK_SIZE: u8 = 0xFF;
const FALLBACK_BLOCK_SIZES: [u8; 4] = [0xE0, 0xC0, 0x80, 0x60];

/// Largest read under a 16-byte block cipher whose protected response still fits a short APDU.
const MAX_AES_PROTECTED_BLOCK_SIZE: u8 = 0xDF;


#[derive(Debug)]
pub enum Error {
    /// A date is neither `yyyy-MM-dd` nor `YYMMDD`.
    Date { field: &'static str, value: String },

    /// The document number is empty.
    DocumentNumber,

    Json(serde_json::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Date { field, value }
                => write!(f, "{} {:?} is neither yyyy-MM-dd nor YYMMDD", field, value),
            Self::DocumentNumber
                => write!(f, "document number is empty"),
            Self::Json(e)
                => write!(f, "invalid configuration: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}
impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self { Self::Json(value) }
}


/// How the file reader copes with an unreliable link.
///
/// Every block size is tried up to `max_retries` times with exponential backoff between attempts;
/// each attempt reconnects and repeats the read once on a transport fault. Once the attempts are
/// used up, the next smaller block size is tried.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,

    /// Explicit block sizes; derived from the link's capabilities if `None`.
    pub block_sizes: Option<Vec<u8>>,
}
impl RetryPolicy {
    /// A policy with the default attempt counts but without any waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// The delay to wait after having waited `delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(self.factor).min(self.max_delay)
    }

    /// The block sizes to try, largest first, for a link carrying at most `max_transceive_length`
    /// bytes per exchange.
    pub fn block_sizes_for(&self, max_transceive_length: usize) -> Vec<u8> {
        let mut sizes = match &self.block_sizes {
            Some(sizes) => sizes.iter().copied().filter(|s| *s > 0).collect(),
            None => {
                let first = if max_transceive_length > EXTENDED_LENGTH_THRESHOLD {
                    LARGE_BLOCK_SIZE
                } else {
                    FALLBACK_BLOCK_SIZES[0]
                };
                let mut sizes = vec![first];
                sizes.extend(FALLBACK_BLOCK_SIZES);
                sizes
            },
        };
        sizes.sort_unstable_by(|a, b| b.cmp(a));
        sizes.dedup();
        if sizes.is_empty() {
            sizes.extend(FALLBACK_BLOCK_SIZES);
        }
        sizes
    }

    /// Like [`Self::block_sizes_for`], but for reads protected by a cipher with the given block
    /// size. Padding to 16 bytes turns a read of 0xE0 bytes into a 258-byte response, so such
    /// channels never read more than 0xDF bytes at once.
    pub fn block_sizes_for_channel(&self, max_transceive_length: usize, cipher_block_size: usize) -> Vec<u8> {
        let mut sizes = self.block_sizes_for(max_transceive_length);
        if cipher_block_size >= 16 {
            for size in &mut sizes {
                *size = (*size).min(MAX_AES_PROTECTED_BLOCK_SIZE);
            }
            sizes.dedup();
        }
        sizes
    }
}
impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(250),
            factor: 2,
            max_delay: Duration::from_millis(2000),
            block_sizes: None,
        }
    }
}


/// The access key as entered by a user or passed in by a caller.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessKeySpec {
    #[serde(alias = "doc_number", alias = "document_number")]
    pub document_number: String,

    /// `yyyy-MM-dd` or `YYMMDD`.
    #[serde(alias = "dob", alias = "date_of_birth")]
    pub date_of_birth: String,

    /// `yyyy-MM-dd` or `YYMMDD`.
    #[serde(alias = "doe", alias = "date_of_expiry")]
    pub date_of_expiry: String,
}
impl AccessKeySpec {
    pub fn to_access_key(&self) -> Result<AccessKey, Error> {
        if self.document_number.trim().is_empty() {
            return Err(Error::DocumentNumber);
        }
        let today = OffsetDateTime::now_utc().date();
        let date_of_birth = mrz_date("date of birth", &self.date_of_birth, DateKind::Birth, today)?;
        let date_of_expiry = mrz_date("date of expiry", &self.date_of_expiry, DateKind::Expiry, today)?;
        Ok(AccessKey::new(&self.document_number, &date_of_birth, &date_of_expiry))
    }
}

fn mrz_date(field: &'static str, value: &str, kind: DateKind, today: Date) -> Result<String, Error> {
    let value = value.trim();
    if mrz::parse_mrz_date(value, kind, today).is_some() {
        return Ok(value.to_owned());
    }
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .map(mrz::format_mrz_date)
        .map_err(|_| Error::Date { field, value: value.to_owned() })
}


/// Everything a session needs to know before it starts.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub access_key: AccessKey,
    pub master_list: MasterListSource,
    pub retry: RetryPolicy,
    pub connect_timeout: Duration,
    pub master_list_wait: Duration,
}
impl SessionConfig {
    pub fn new(access_key: AccessKey) -> Self {
        Self {
            access_key,
            master_list: MasterListSource::default(),
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            master_list_wait: DEFAULT_MASTER_LIST_WAIT,
        }
    }

    /// Reads a configuration such as
    /// `{"documentNumber": "L898902C", "dob": "1969-08-06", "doe": "940623"}`, optionally with a
    /// `masterList` entry.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawConfig {
            #[serde(flatten)]
            access_key: AccessKeySpec,

            #[serde(default, alias = "master_list", alias = "masterListSource")]
            master_list: MasterListSource,
        }

        let raw: RawConfig = serde_json::from_str(json)?;
        let mut config = Self::new(raw.access_key.to_access_key()?);
        config.master_list = raw.master_list;
        Ok(config)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn block_sizes_follow_link_capabilities() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.block_sizes_for(65_546), vec![0xFF, 0xE0, 0xC0, 0x80, 0x60]);
        assert_eq!(policy.block_sizes_for(261), vec![0xE0, 0xC0, 0x80, 0x60]);

        let explicit = RetryPolicy { block_sizes: Some(vec![0x60, 0xE0, 0x60, 0]), ..RetryPolicy::default() };
        assert_eq!(explicit.block_sizes_for(261), vec![0xE0, 0x60]);
    }

    #[test]
    fn aes_channels_cap_the_block_size() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.block_sizes_for_channel(65_546, 16), vec![0xDF, 0xC0, 0x80, 0x60]);
        assert_eq!(policy.block_sizes_for_channel(261, 16), vec![0xDF, 0xC0, 0x80, 0x60]);
        assert_eq!(policy.block_sizes_for_channel(261, 8), policy.block_sizes_for(261));

        let explicit = RetryPolicy { block_sizes: Some(vec![0xF0, 0x40]), ..RetryPolicy::default() };
        assert_eq!(explicit.block_sizes_for_channel(261, 16), vec![0xDF, 0x40]);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        let mut delays = Vec::new();
        for _ in 0..5 {
            delays.push(delay.as_millis());
            delay = policy.next_delay(delay);
        }
        assert_eq!(delays, vec![250, 500, 1000, 2000, 2000]);
    }

    #[test]
    fn access_key_from_either_date_form() {
        let spec: AccessKeySpec = serde_json::from_str(
            r#"{"doc_number": "l898902c", "dob": "1969-08-06", "doe": "940623"}"#,
        ).unwrap();
        let key = spec.to_access_key().unwrap();
        assert_eq!(key.mrz_information().as_str(), "L898902C<369080619406236");

        let bad = AccessKeySpec {
            document_number: "X".into(),
            date_of_birth: "06.08.1969".into(),
            date_of_expiry: "940623".into(),
        };
        assert!(matches!(bad.to_access_key(), Err(Error::Date { field: "date of birth", .. })));
    }

    #[test]
    fn config_from_json() {
        let config = SessionConfig::from_json(r#"{
            "documentNumber": "L898902C",
            "dateOfBirth": "690806",
            "dateOfExpiry": "1994-06-23",
            "masterList": {"type": "file", "location": "/tmp/masterlist.ml"}
        }"#).unwrap();
        assert_eq!(config.access_key.date_of_expiry(), "940623");
        assert_eq!(config.master_list, MasterListSource::File(PathBuf::from("/tmp/masterlist.ml")));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        assert!(matches!(SessionConfig::from_json("{}"), Err(Error::Json(_))));
    }
}
