//! The document security object and other CMS-signed LDS files.


use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::{Decode, Encode, Sequence};
use der::asn1::{ObjectIdentifier, OctetString, PrintableString};
use spki::AlgorithmIdentifierOwned;
use x509_cert::Certificate;

use crate::lds::{EfIdentifier, Error};


/// The tag of the application template enclosing EF.SOD.
const SOD_TAG: u8 = 0x77;

/// `id-signedData`
pub const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// `id-messageDigest`
pub const ID_MESSAGE_DIGEST: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.4");


/// The hash of a single data group.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct DataGroupHash {
    pub data_group_number: u8,
    pub data_group_hash_value: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct LdsVersionInfo {
    pub lds_version: PrintableString,
    pub unicode_version: PrintableString,
}

/// `LDSSecurityObject` (ICAO Doc 9303 Part 10 § 4.6.2.2).
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct LdsSecurityObject {
    pub version: u8,
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub data_group_hash_values: Vec<DataGroupHash>,
    #[asn1(optional = "true")]
    pub lds_version_info: Option<LdsVersionInfo>,
}


/// Decodes a CMS `SignedData`, optionally wrapped in the EF.SOD application template.
pub fn decode_signed_data(bytes: &[u8]) -> Result<SignedData, der::Error> {
    let content_info_bytes = match bytes.first() {
        Some(&SOD_TAG) => crate::der_util::parse_tlv(bytes)
            .map(|(template, _rest)| template.value)
            .ok_or_else(|| der::Error::from(der::ErrorKind::Failed))?,
        _ => bytes,
    };
    let content_info = ContentInfo::from_der(content_info_bytes)?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(der::ErrorKind::OidUnknown { oid: content_info.content_type }.into());
    }
    content_info.content.decode_as::<SignedData>()
}

/// Returns the octets of the encapsulated content, if present.
pub fn encapsulated_content(signed_data: &SignedData) -> Option<Vec<u8>> {
    let econtent = signed_data.encap_content_info.econtent.as_ref()?;
    let octets = econtent.decode_as::<OctetString>().ok()?;
    Some(octets.into_bytes())
}


/// A decoded EF.SOD.
#[derive(Clone, Debug)]
pub struct DocumentSecurityObject {
    signed_data: SignedData,
    content: Vec<u8>,
    security_object: LdsSecurityObject,
}
impl DocumentSecurityObject {
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let signed_data = decode_signed_data(bytes)
            .map_err(|error| Error::Asn1 { file: EfIdentifier::Sod, error })?;
        let content = encapsulated_content(&signed_data)
            .ok_or(Error::MissingSodElement { element: "encapsulated content" })?;
        let security_object = LdsSecurityObject::from_der(&content)
            .map_err(|error| Error::Asn1 { file: EfIdentifier::Sod, error })?;
        if signed_data.signer_infos.0.is_empty() {
            return Err(Error::MissingSodElement { element: "signer info" });
        }
        Ok(Self {
            signed_data,
            content,
            security_object,
        })
    }

    pub fn signed_data(&self) -> &SignedData { &self.signed_data }
    pub fn security_object(&self) -> &LdsSecurityObject { &self.security_object }

    /// The encapsulated `LDSSecurityObject` octets.
    pub fn encapsulated_content(&self) -> &[u8] { &self.content }

    pub fn signer_info(&self) -> Result<&SignerInfo, Error> {
        self.signed_data.signer_infos.0.get(0)
            .ok_or(Error::MissingSodElement { element: "signer info" })
    }

    /// The document signer certificate embedded in the SOD.
    ///
    /// Prefers the certificate matching the signer identifier; falls back to the first embedded
    /// certificate.
    pub fn signer_certificate(&self) -> Option<&Certificate> {
        let certificates: Vec<&Certificate> = self.signed_data.certificates.as_ref()?
            .0.iter()
            .filter_map(|choice| match choice {
                CertificateChoices::Certificate(certificate) => Some(certificate),
                _ => None,
            })
            .collect();
        if let Ok(signer_info) = self.signer_info() {
            if let SignerIdentifier::IssuerAndSerialNumber(id) = &signer_info.sid {
                let matching = certificates.iter()
                    .find(|c| c.tbs_certificate.issuer == id.issuer && c.tbs_certificate.serial_number == id.serial_number)
                    .copied();
                if let Some(certificate) = matching {
                    return Some(certificate);
                }
            }
        }
        certificates.first().copied()
    }

    /// The bytes covered by the signature: the DER encoding of the signed attributes if the
    /// signer info has any, otherwise the encapsulated content itself.
    pub fn signed_content(&self) -> Result<Vec<u8>, Error> {
        let signer_info = self.signer_info()?;
        match &signer_info.signed_attrs {
            Some(attributes) if !attributes.is_empty() => attributes.to_der()
                .map_err(|error| Error::Asn1 { file: EfIdentifier::Sod, error }),
            _ => Ok(self.content.clone()),
        }
    }

    /// The `messageDigest` signed attribute, if present.
    pub fn message_digest(&self) -> Option<Vec<u8>> {
        let attributes = self.signer_info().ok()?.signed_attrs.as_ref()?;
        let attribute = attributes.iter()
            .find(|attribute| attribute.oid == ID_MESSAGE_DIGEST)?;
        let value = attribute.values.get(0)?;
        value.decode_as::<OctetString>()
            .ok()
            .map(|octets| octets.into_bytes())
    }

    /// The digest algorithm the signer hashed the signed content with.
    pub fn signer_digest_algorithm(&self) -> Result<ObjectIdentifier, Error> {
        Ok(self.signer_info()?.digest_alg.oid)
    }

    /// The digest algorithm of the data group hashes.
    pub fn data_group_digest_algorithm(&self) -> ObjectIdentifier {
        self.security_object.hash_algorithm.oid
    }

    pub fn signature(&self) -> Result<&[u8], Error> {
        Ok(self.signer_info()?.signature.as_bytes())
    }

    pub fn data_group_hash(&self, data_group_number: u8) -> Option<&[u8]> {
        self.security_object.data_group_hash_values.iter()
            .find(|h| h.data_group_number == data_group_number)
            .map(|h| h.data_group_hash_value.as_bytes())
    }
}
