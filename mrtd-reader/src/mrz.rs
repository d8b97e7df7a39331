//! Decoding of machine-readable zones.
//!
//! Three form factors are defined: TD1 (credit-card size, three lines of 30 characters), TD2 (two
//! lines of 36 characters) and TD3 (passport, two lines of 44 characters).
//!
//! The TD1 encoding is:
//! ```plain
//! TTSSSNNNNNNNNNCOOOOOOOOOOOOOOO
//! BBBBBBDXEEEEEEFAAAPPPPPPPPPPPG
//! IIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! ```
//! The TD2 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOG
//! ```
//! The TD3 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
//! ```
//! with
//! * `TT`: type of document
//! * `SSS`: issuing state or organization
//! * `NNNNNNNNN`, `C`: document number and its check digit; in TD1, a `<` in place of the check
//!   digit means the number continues in the optional data, followed by its check digit
//! * `BBBBBB`, `D`: date of birth as YYMMDD and its check digit
//! * `X`: sex (`F`, `M`, or `<` for unspecified)
//! * `EEEEEE`, `F`: date of expiry as YYMMDD and its check digit
//! * `AAA`: nationality
//! * `O`, `P`: optional data; in TD3, `Q` is the check digit of the optional data (personal number)
//! * `G`: composite check digit
//! * `I`: primary identifier, then `<<`, then the secondary identifier, components separated by `<`
//!
//! Check digits are carried through as read; the chip guarantees integrity of DG1 through the
//! signed hash in the document security object.


use std::fmt;

use serde::{Deserialize, Serialize};
use time::{Date, Month};
use zeroize::Zeroizing;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Variant {
    Td1,
    Td2,
    Td3,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sex {
    Female,
    Male,
    Unspecified,
}
impl Sex {
    fn from_mrz(c: u8) -> Self {
        match c {
            b'F' => Self::Female,
            b'M' => Self::Male,
            _ => Self::Unspecified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Female => "FEMALE",
            Self::Male => "MALE",
            Self::Unspecified => "UNSPECIFIED",
        }
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The MRZ does not have the length of any known layout.
    Length { obtained: usize },

    /// The MRZ contains characters outside `0-9A-Z<`.
    Character { offset: usize, byte: u8 },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Length { obtained }
                => write!(f, "MRZ has {} characters; expected 90 (TD1), 72 (TD2) or 88 (TD3)", obtained),
            Self::Character { offset, byte }
                => write!(f, "invalid MRZ character 0x{:02X} at offset {}", byte, offset),
        }
    }
}
impl std::error::Error for Error {
}


/// The decoded machine-readable zone.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MrzRecord {
    pub variant: Variant,

    /// Document type, e.g. `P` for passports.
    pub document_code: String,

    /// Issuing state or organization.
    pub issuing_state: String,

    /// Primary identifier (surname), with `<` separators replaced by spaces.
    pub primary_identifier: String,

    /// Components of the secondary identifier (given names).
    pub secondary_identifiers: Vec<String>,

    pub nationality: String,

    pub document_number: String,
    pub document_number_check: u8,

    /// Optional personal number; `None` if the field is empty.
    pub personal_number: Option<String>,

    pub sex: Sex,

    /// Date of birth as YYMMDD.
    pub date_of_birth: String,
    pub date_of_birth_check: u8,

    /// Date of expiry as YYMMDD.
    pub date_of_expiry: String,
    pub date_of_expiry_check: u8,

    pub composite_check: u8,
}
impl MrzRecord {
    /// Parses an MRZ. Line breaks are ignored.
    pub fn parse(mrz: &str) -> Result<Self, Error> {
        let chars: Vec<u8> = mrz.bytes()
            .filter(|b| *b != b'\n' && *b != b'\r')
            .collect();
        if let Some((offset, byte)) = chars.iter().enumerate().find(|(_, b)| !is_mrz_char(**b)) {
            return Err(Error::Character { offset, byte: *byte });
        }

        match chars.len() {
            90 => Ok(Self::parse_td1(&chars)),
            72 => Ok(Self::parse_td2(&chars)),
            88 => Ok(Self::parse_td3(&chars)),
            other => Err(Error::Length { obtained: other }),
        }
    }

    fn parse_td1(c: &[u8]) -> Self {
        let (document_number, document_number_check, optional_data_1) = if c[14] == b'<' {
            // long document number continues in the optional data, followed by its check digit
            let optional = &c[15..30];
            let end = optional.iter().position(|b| *b == b'<').unwrap_or(optional.len());
            if end == 0 {
                (field(&c[5..14]), digit(b'<'), field(optional))
            } else {
                let mut number = field(&c[5..14]);
                number.push_str(&field(&optional[..end-1]));
                let rest = if end < optional.len() { field(&optional[end..]) } else { String::new() };
                (number, digit(optional[end-1]), rest)
            }
        } else {
            (field(&c[5..14]), digit(c[14]), field(&c[15..30]))
        };
        let (primary_identifier, secondary_identifiers) = split_name(&c[60..90]);

        Self {
            variant: Variant::Td1,
            document_code: field(&c[0..2]),
            issuing_state: field(&c[2..5]),
            primary_identifier,
            secondary_identifiers,
            nationality: field(&c[45..48]),
            document_number,
            document_number_check,
            personal_number: non_empty(optional_data_1),
            sex: Sex::from_mrz(c[37]),
            date_of_birth: field(&c[30..36]),
            date_of_birth_check: digit(c[36]),
            date_of_expiry: field(&c[38..44]),
            date_of_expiry_check: digit(c[44]),
            composite_check: digit(c[59]),
        }
    }

    fn parse_td2(c: &[u8]) -> Self {
        let (primary_identifier, secondary_identifiers) = split_name(&c[5..36]);
        let line2 = &c[36..72];
        Self {
            variant: Variant::Td2,
            document_code: field(&c[0..2]),
            issuing_state: field(&c[2..5]),
            primary_identifier,
            secondary_identifiers,
            nationality: field(&line2[10..13]),
            document_number: field(&line2[0..9]),
            document_number_check: digit(line2[9]),
            personal_number: non_empty(field(&line2[28..35])),
            sex: Sex::from_mrz(line2[20]),
            date_of_birth: field(&line2[13..19]),
            date_of_birth_check: digit(line2[19]),
            date_of_expiry: field(&line2[21..27]),
            date_of_expiry_check: digit(line2[27]),
            composite_check: digit(line2[35]),
        }
    }

    fn parse_td3(c: &[u8]) -> Self {
        let (primary_identifier, secondary_identifiers) = split_name(&c[5..44]);
        let line2 = &c[44..88];
        Self {
            variant: Variant::Td3,
            document_code: field(&c[0..2]),
            issuing_state: field(&c[2..5]),
            primary_identifier,
            secondary_identifiers,
            nationality: field(&line2[10..13]),
            document_number: field(&line2[0..9]),
            document_number_check: digit(line2[9]),
            personal_number: non_empty(field(&line2[28..42])),
            sex: Sex::from_mrz(line2[20]),
            date_of_birth: field(&line2[13..19]),
            date_of_birth_check: digit(line2[19]),
            date_of_expiry: field(&line2[21..27]),
            date_of_expiry_check: digit(line2[27]),
            composite_check: digit(line2[43]),
        }
    }

    pub fn is_document_number_valid(&self) -> bool {
        check_digit(self.document_number.as_bytes()) == self.document_number_check
    }

    pub fn is_date_of_birth_valid(&self) -> bool {
        check_digit(self.date_of_birth.as_bytes()) == self.date_of_birth_check
    }

    pub fn is_date_of_expiry_valid(&self) -> bool {
        check_digit(self.date_of_expiry.as_bytes()) == self.date_of_expiry_check
    }
}


fn is_mrz_char(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_uppercase() || b == b'<'
}

/// Strips the `<` filler from both ends.
fn field(raw: &[u8]) -> String {
    let s: String = raw.iter().map(|b| char::from(*b)).collect();
    s.trim_matches('<').to_owned()
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// The value of a check digit character; fillers count as 0.
fn digit(b: u8) -> u8 {
    if b.is_ascii_digit() { b - b'0' } else { 0 }
}

fn split_name(raw: &[u8]) -> (String, Vec<String>) {
    let name: String = raw.iter().map(|b| char::from(*b)).collect();
    let name = name.trim_end_matches('<');
    let (primary, secondary) = match name.split_once("<<") {
        Some((p, s)) => (p, s),
        None => (name, ""),
    };
    let primary_identifier = primary
        .split('<')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let secondary_identifiers = secondary
        .split('<')
        .filter(|part| !part.is_empty())
        .map(|part| part.to_owned())
        .collect();
    (primary_identifier, secondary_identifiers)
}


/// Calculates the check digit of an MRZ field (weights 7, 3, 1, repeating).
pub fn check_digit(data: &[u8]) -> u8 {
    const WEIGHTS: [u8; 3] = [7, 3, 1];

    let mut check_digit: u8 = 0;
    for (b, weight) in data.iter().copied().zip(WEIGHTS.iter().copied().cycle()) {
        let value = if b.is_ascii_digit() {
            b - b'0'
        } else if b.is_ascii_uppercase() {
            b + 10 - b'A'
        } else {
            // '<' as well as invalid characters have value 0, but we keep cycling the weight
            continue;
        };

        // worst case: 'Z' at weight 7 (7 * 35 = 245); reduce before adding
        let weighted = (value * weight) % 10;
        check_digit = (check_digit + weighted) % 10;
    }

    check_digit
}


/// Which date field of the MRZ is being converted.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DateKind {
    Birth,
    Expiry,
}

/// Converts an MRZ date (YYMMDD) into a calendar date.
///
/// Dates of birth fall in the 1900s if the two-digit year is greater than the current two-digit
/// year, otherwise in the 2000s. Dates of expiry always fall in the 2000s. Returns `None` if the
/// field is not a valid date.
pub fn parse_mrz_date(yymmdd: &str, kind: DateKind, today: Date) -> Option<Date> {
    let bytes = yymmdd.as_bytes();
    if bytes.len() != 6 || !bytes.iter().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let two_digits = |i: usize| i32::from(bytes[i] - b'0') * 10 + i32::from(bytes[i + 1] - b'0');
    let yy = two_digits(0);
    let mm = u8::try_from(two_digits(2)).ok()?;
    let dd = u8::try_from(two_digits(4)).ok()?;

    let century = match kind {
        DateKind::Birth if yy > today.year() % 100 => 1900,
        DateKind::Birth => 2000,
        DateKind::Expiry => 2000,
    };
    let month = Month::try_from(mm).ok()?;
    Date::from_calendar_date(century + yy, month, dd).ok()
}

/// Formats a calendar date as an MRZ date (YYMMDD).
pub fn format_mrz_date(date: Date) -> String {
    format!("{:02}{:02}{:02}", date.year().rem_euclid(100), u8::from(date.month()), date.day())
}


/// The inputs to Basic Access Control and PACE with the MRZ as password.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AccessKey {
    document_number: String,
    date_of_birth: String,
    date_of_expiry: String,
}
impl AccessKey {
    /// Creates an access key from the document number and the two dates as YYMMDD.
    ///
    /// The document number is upper-cased and padded with `<` to at least 9 characters.
    pub fn new(document_number: &str, date_of_birth: &str, date_of_expiry: &str) -> Self {
        let mut document_number: String = document_number
            .trim()
            .to_uppercase()
            .replace(' ', "<");
        while document_number.len() < 9 {
            document_number.push('<');
        }
        Self {
            document_number,
            date_of_birth: date_of_birth.to_owned(),
            date_of_expiry: date_of_expiry.to_owned(),
        }
    }

    /// Creates an access key from the document number and calendar dates.
    pub fn from_dates(document_number: &str, date_of_birth: Date, date_of_expiry: Date) -> Self {
        Self::new(document_number, &format_mrz_date(date_of_birth), &format_mrz_date(date_of_expiry))
    }

    pub fn document_number(&self) -> &str { &self.document_number }
    pub fn date_of_birth(&self) -> &str { &self.date_of_birth }
    pub fn date_of_expiry(&self) -> &str { &self.date_of_expiry }

    /// The MRZ information: document number, date of birth and date of expiry, each followed by
    /// its check digit.
    pub fn mrz_information(&self) -> Zeroizing<String> {
        let mut ret = Zeroizing::new(String::with_capacity(self.document_number.len() + 1 + 6 + 1 + 6 + 1));
        for field in [&self.document_number, &self.date_of_birth, &self.date_of_expiry] {
            ret.push_str(field);
            ret.push(char::from(b'0' + check_digit(field.as_bytes())));
        }
        ret
    }
}
