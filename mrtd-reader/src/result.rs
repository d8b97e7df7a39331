//! The outcome of a session and its textual form.
//!
//! A [`ScanResult`] serializes to compact JSON for handing it across a process or storage
//! boundary. Dates are written as `yyyy-MM-dd`, the face image as a base64-encoded JPEG (an empty
//! string if the document yielded no image).


use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use time::Date;

use crate::mrz::{self, DateKind, MrzRecord, Sex};


/// The class of a failed session.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    TransportFault,
    AuthenticationFailed,
    FileReadFailed,
    LdsParseError,
    ImageDecodeFailed,
    SignatureCheckFailed,
    IssuerUnverified,
}


/// The data read from a document.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentData {
    pub document_code: String,
    pub issuing_state: String,
    pub primary_identifier: String,
    pub secondary_identifiers: Vec<String>,
    pub nationality: String,
    pub document_number: String,
    pub personal_number: Option<String>,

    #[serde(with = "iso_date")]
    pub date_of_birth: Option<Date>,

    #[serde(with = "iso_date")]
    pub date_of_expiry: Option<Date>,

    pub gender: Sex,

    /// JPEG-encoded face image; empty if none could be decoded.
    #[serde(with = "base64_image")]
    pub face_image: Vec<u8>,

    pub signature_verified: bool,
    pub issuer_verified: bool,
}
impl DocumentData {
    /// Takes the personal data from the MRZ; converts its dates relative to `today`.
    pub fn from_mrz(mrz: &MrzRecord, today: Date) -> Self {
        Self {
            document_code: mrz.document_code.clone(),
            issuing_state: mrz.issuing_state.clone(),
            primary_identifier: mrz.primary_identifier.clone(),
            secondary_identifiers: mrz.secondary_identifiers.clone(),
            nationality: mrz.nationality.clone(),
            document_number: mrz.document_number.clone(),
            personal_number: mrz.personal_number.clone(),
            date_of_birth: mrz::parse_mrz_date(&mrz.date_of_birth, DateKind::Birth, today),
            date_of_expiry: mrz::parse_mrz_date(&mrz.date_of_expiry, DateKind::Expiry, today),
            gender: mrz.sex,
            face_image: Vec::new(),
            signature_verified: false,
            issuer_verified: false,
        }
    }

    pub fn has_face_image(&self) -> bool {
        !self.face_image.is_empty()
    }
}


/// How a session ended.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ScanResult {
    Success(DocumentData),
    Failure {
        kind: ErrorKind,

        /// Whether trying again (e.g. holding the document still) has a chance of succeeding.
        transient: bool,

        message: String,
    },
    Cancelled,
}
impl ScanResult {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}


mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use time::Date;
    use time::format_description::BorrowedFormatItem;
    use time::macros::format_description;

    const FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

    pub fn serialize<S: Serializer>(date: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error> {
        match date {
            Some(date) => {
                let text = date.format(FORMAT).map_err(S::Error::custom)?;
                serializer.serialize_some(&text)
            },
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Date>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        text.map(|t| Date::parse(&t, FORMAT).map_err(D::Error::custom))
            .transpose()
    }
}

mod base64_image {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde::de::Error as _;

    pub fn serialize<S: Serializer>(image: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(image))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}


/// Results waiting to be picked up by another component, keyed by a monotonically increasing id.
#[derive(Debug, Default)]
pub struct ResultStore {
    last_id: AtomicU64,
    results: Mutex<HashMap<u64, ScanResult>>,
}
impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn results(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ScanResult>> {
        match self.results.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stores a result and returns its id. Ids are never reused.
    pub fn insert(&self, result: ScanResult) -> u64 {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.results().insert(id, result);
        id
    }

    pub fn get(&self, id: u64) -> Option<ScanResult> {
        self.results().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<ScanResult> {
        self.results().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.results().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use time::macros::date;

    fn anna(face_image: Vec<u8>) -> ScanResult {
        ScanResult::Success(DocumentData {
            document_code: "P".into(),
            issuing_state: "UTO".into(),
            primary_identifier: "ERIKSSON".into(),
            secondary_identifiers: vec!["ANNA".into(), "MARIA".into()],
            nationality: "UTO".into(),
            document_number: "L898902C3".into(),
            personal_number: Some("ZE184226B".into()),
            date_of_birth: Some(date!(1974-08-12)),
            date_of_expiry: Some(date!(2012-04-15)),
            gender: Sex::Female,
            face_image,
            signature_verified: true,
            issuer_verified: false,
        })
    }

    #[test]
    fn success_survives_json() {
        let result = anna(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9]);
        let json = result.to_json().unwrap();
        assert!(json.contains(r#""status":"success""#));
        assert!(json.contains(r#""dateOfBirth":"1974-08-12""#));
        assert!(json.contains(r#""dateOfExpiry":"2012-04-15""#));
        assert!(json.contains(r#""gender":"FEMALE""#));
        assert!(json.contains(r#""faceImage":"/9j/4AAQ/9k=""#));
        assert_eq!(ScanResult::from_json(&json).unwrap(), result);

        let without_image = anna(Vec::new());
        let json = without_image.to_json().unwrap();
        assert!(json.contains(r#""faceImage":"""#));
        assert_eq!(ScanResult::from_json(&json).unwrap(), without_image);
    }

    #[test]
    fn failure_and_cancellation_forms() {
        let failure = ScanResult::Failure {
            kind: ErrorKind::FileReadFailed,
            transient: true,
            message: "tag lost".into(),
        };
        let json = failure.to_json().unwrap();
        assert_eq!(json, r#"{"status":"failure","kind":"fileReadFailed","transient":true,"message":"tag lost"}"#);
        assert_eq!(ScanResult::from_json(&json).unwrap(), failure);
        assert_eq!(ScanResult::Cancelled.to_json().unwrap(), r#"{"status":"cancelled"}"#);
    }

    #[test]
    fn mrz_dates_become_calendar_dates() {
        let mrz = MrzRecord::parse("P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C36UTO7408122F1204159ZE184226B<<<<<10").unwrap();
        let data = DocumentData::from_mrz(&mrz, date!(2024-01-01));
        assert_eq!(data.date_of_birth, Some(date!(1974-08-12)));
        assert_eq!(data.date_of_expiry, Some(date!(2012-04-15)));
        assert_eq!(data.secondary_identifiers, vec!["ANNA", "MARIA"]);
        assert!(!data.has_face_image());
    }

    #[test]
    fn store_ids_increase() {
        let store = Arc::new(ResultStore::new());
        let first = store.insert(ScanResult::Cancelled);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.insert(ScanResult::Cancelled))
            })
            .collect();
        let mut ids: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 4);
        assert!(ids.iter().all(|id| *id > first));

        assert_eq!(store.get(first), Some(ScanResult::Cancelled));
        assert_eq!(store.remove(first), Some(ScanResult::Cancelled));
        assert_eq!(store.get(first), None);
        assert_eq!(store.len(), 4);
        assert_eq!(store.insert(ScanResult::Cancelled), 6);
    }
}
