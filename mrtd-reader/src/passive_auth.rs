//! Passive Authentication (ICAO Doc 9303 Part 11 § 5.1).
//!
//! Two checks are performed: the document signer's signature over the security object, and the
//! document signer certificate's signature by a country signing CA from a trusted master list.
//! Both report plain booleans; the reasons for a failure are only logged. The data group hashes
//! stored in the security object are checked in addition.


use std::fmt;

use der::{Any, Encode, Tag, Tagged};
use der::asn1::ObjectIdentifier;
use der::oid::AssociatedOid;
use digest::{Digest, DynDigest};
use num_bigint::BigUint;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use rsa::pkcs1::DecodeRsaPublicKey;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};
use spki::SubjectPublicKeyInfoOwned;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use x509_cert::Certificate;

use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::crypt::elliptic::curves;
use crate::der_util;
use crate::lds;
use crate::lds::sod::DocumentSecurityObject;


mod oids {
    use der::asn1::ObjectIdentifier as Oid;

    pub const SHA1: Oid = Oid::new_unwrap("1.3.14.3.2.26");
    pub const SHA224: Oid = Oid::new_unwrap("2.16.840.1.101.3.4.2.4");
    pub const SHA256: Oid = Oid::new_unwrap("2.16.840.1.101.3.4.2.1");
    pub const SHA384: Oid = Oid::new_unwrap("2.16.840.1.101.3.4.2.2");
    pub const SHA512: Oid = Oid::new_unwrap("2.16.840.1.101.3.4.2.3");

    pub const RSA_ENCRYPTION: Oid = Oid::new_unwrap("1.2.840.113549.1.1.1");
    pub const RSASSA_PSS: Oid = Oid::new_unwrap("1.2.840.113549.1.1.10");
    pub const SHA1_WITH_RSA: Oid = Oid::new_unwrap("1.2.840.113549.1.1.5");
    pub const SHA224_WITH_RSA: Oid = Oid::new_unwrap("1.2.840.113549.1.1.14");
    pub const SHA256_WITH_RSA: Oid = Oid::new_unwrap("1.2.840.113549.1.1.11");
    pub const SHA384_WITH_RSA: Oid = Oid::new_unwrap("1.2.840.113549.1.1.12");
    pub const SHA512_WITH_RSA: Oid = Oid::new_unwrap("1.2.840.113549.1.1.13");

    pub const EC_PUBLIC_KEY: Oid = Oid::new_unwrap("1.2.840.10045.2.1");
    pub const PRIME_FIELD: Oid = Oid::new_unwrap("1.2.840.10045.1.1");
    pub const SHA1_WITH_ECDSA: Oid = Oid::new_unwrap("1.2.840.10045.4.1");
    pub const SHA224_WITH_ECDSA: Oid = Oid::new_unwrap("1.2.840.10045.4.3.1");
    pub const SHA256_WITH_ECDSA: Oid = Oid::new_unwrap("1.2.840.10045.4.3.2");
    pub const SHA384_WITH_ECDSA: Oid = Oid::new_unwrap("1.2.840.10045.4.3.3");
    pub const SHA512_WITH_ECDSA: Oid = Oid::new_unwrap("1.2.840.10045.4.3.4");

    // BSI TR-03111 plain (r || s) signatures
    pub const SHA224_WITH_PLAIN_ECDSA: Oid = Oid::new_unwrap("0.4.0.127.0.7.1.1.4.1.2");
    pub const SHA256_WITH_PLAIN_ECDSA: Oid = Oid::new_unwrap("0.4.0.127.0.7.1.1.4.1.3");
    pub const SHA384_WITH_PLAIN_ECDSA: Oid = Oid::new_unwrap("0.4.0.127.0.7.1.1.4.1.4");
    pub const SHA512_WITH_PLAIN_ECDSA: Oid = Oid::new_unwrap("0.4.0.127.0.7.1.1.4.1.5");

    pub const NIST_P192: Oid = Oid::new_unwrap("1.2.840.10045.3.1.1");
    pub const NIST_P224: Oid = Oid::new_unwrap("1.3.132.0.33");
    pub const NIST_P256: Oid = Oid::new_unwrap("1.2.840.10045.3.1.7");
    pub const NIST_P384: Oid = Oid::new_unwrap("1.3.132.0.34");
    pub const NIST_P521: Oid = Oid::new_unwrap("1.3.132.0.35");
    pub const BRAINPOOL_P192R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.3");
    pub const BRAINPOOL_P224R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.5");
    pub const BRAINPOOL_P256R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.7");
    pub const BRAINPOOL_P320R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.9");
    pub const BRAINPOOL_P384R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.11");
    pub const BRAINPOOL_P512R1: Oid = Oid::new_unwrap("1.3.36.3.3.2.8.1.1.13");
}


/// Why a signature could not be verified.
#[derive(Debug)]
pub enum Error {
    MissingSignerCertificate,
    UnsupportedDigestAlgorithm { oid: ObjectIdentifier },
    UnsupportedSignatureAlgorithm { name: String },
    UnsupportedPublicKey { oid: ObjectIdentifier },
    InvalidPublicKey,
    InvalidSignatureEncoding,
    MessageDigestMismatch,
    SignatureMismatch,
    Lds(lds::Error),
    Encoding(der::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignerCertificate
                => write!(f, "no document signer certificate"),
            Self::UnsupportedDigestAlgorithm { oid }
                => write!(f, "unsupported digest algorithm {}", oid),
            Self::UnsupportedSignatureAlgorithm { name }
                => write!(f, "unsupported signature algorithm {:?}", name),
            Self::UnsupportedPublicKey { oid }
                => write!(f, "unsupported public key algorithm {}", oid),
            Self::InvalidPublicKey
                => write!(f, "invalid public key"),
            Self::InvalidSignatureEncoding
                => write!(f, "invalid signature encoding"),
            Self::MessageDigestMismatch
                => write!(f, "messageDigest attribute does not match the encapsulated content"),
            Self::SignatureMismatch
                => write!(f, "signature does not verify"),
            Self::Lds(e)
                => write!(f, "{}", e),
            Self::Encoding(e)
                => write!(f, "encoding failed: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Lds(e) => Some(e),
            Self::Encoding(e) => Some(e),
            _ => None,
        }
    }
}
impl From<lds::Error> for Error {
    fn from(value: lds::Error) -> Self { Self::Lds(value) }
}
impl From<der::Error> for Error {
    fn from(value: der::Error) -> Self { Self::Encoding(value) }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}
impl DigestAlgorithm {
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        match *oid {
            oids::SHA1 => Some(Self::Sha1),
            oids::SHA224 => Some(Self::Sha224),
            oids::SHA256 => Some(Self::Sha256),
            oids::SHA384 => Some(Self::Sha384),
            oids::SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    /// Parses a digest name with or without the hyphen (`SHA-256`, `SHA256`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.replace('-', "").to_ascii_uppercase().as_str() {
            "SHA1" => Some(Self::Sha1),
            "SHA224" => Some(Self::Sha224),
            "SHA256" => Some(Self::Sha256),
            "SHA384" => Some(Self::Sha384),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }

    /// The standard name, e.g. `SHA-256`.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha224 => "SHA-224",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5
    RsaPkcs1,

    /// RSASSA-PSS
    RsaPss,

    /// ECDSA with DER-encoded `(r, s)`.
    Ecdsa,

    /// ECDSA with `r || s` concatenated.
    PlainEcdsa,
}


/// A fully specified signature algorithm.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SignatureAlgorithm {
    pub scheme: SignatureScheme,
    pub digest: DigestAlgorithm,
}
impl SignatureAlgorithm {
    /// Parses names of the form `SHA256withRSA`, `SHA256withRSA/PSS`, `SHA256withECDSA` and
    /// `SHA256withPLAIN-ECDSA`.
    pub fn from_name(name: &str) -> Option<Self> {
        let (digest_name, scheme_name) = name.split_once("with")?;
        let digest = DigestAlgorithm::from_name(digest_name)?;
        let scheme = match scheme_name {
            "RSA" => SignatureScheme::RsaPkcs1,
            "RSA/PSS" | "RSAandMGF1" => SignatureScheme::RsaPss,
            "ECDSA" => SignatureScheme::Ecdsa,
            "PLAIN-ECDSA" => SignatureScheme::PlainEcdsa,
            _ => return None,
        };
        Some(Self { scheme, digest })
    }

    pub fn name(&self) -> String {
        let digest = self.digest.name().replace('-', "");
        let scheme = match self.scheme {
            SignatureScheme::RsaPkcs1 => "RSA",
            SignatureScheme::RsaPss => "RSA/PSS",
            SignatureScheme::Ecdsa => "ECDSA",
            SignatureScheme::PlainEcdsa => "PLAIN-ECDSA",
        };
        format!("{}with{}", digest, scheme)
    }
}


/// Returns the name of a signature (or digest encryption) algorithm identifier.
///
/// Bare key algorithm identifiers map to underspecified names (`RSA`, `SSAwithRSA/PSS`, `ECDSA`)
/// which must be completed with the digest algorithm by [`signature_algorithm_name`].
pub fn algorithm_name_for_oid(oid: &ObjectIdentifier) -> Option<&'static str> {
    let name = match *oid {
        oids::RSA_ENCRYPTION => "RSA",
        oids::RSASSA_PSS => "SSAwithRSA/PSS",
        oids::SHA1_WITH_RSA => "SHA1withRSA",
        oids::SHA224_WITH_RSA => "SHA224withRSA",
        oids::SHA256_WITH_RSA => "SHA256withRSA",
        oids::SHA384_WITH_RSA => "SHA384withRSA",
        oids::SHA512_WITH_RSA => "SHA512withRSA",
        oids::EC_PUBLIC_KEY => "ECDSA",
        oids::SHA1_WITH_ECDSA => "SHA1withECDSA",
        oids::SHA224_WITH_ECDSA => "SHA224withECDSA",
        oids::SHA256_WITH_ECDSA => "SHA256withECDSA",
        oids::SHA384_WITH_ECDSA => "SHA384withECDSA",
        oids::SHA512_WITH_ECDSA => "SHA512withECDSA",
        oids::SHA224_WITH_PLAIN_ECDSA => "SHA224withPLAIN-ECDSA",
        oids::SHA256_WITH_PLAIN_ECDSA => "SHA256withPLAIN-ECDSA",
        oids::SHA384_WITH_PLAIN_ECDSA => "SHA384withPLAIN-ECDSA",
        oids::SHA512_WITH_PLAIN_ECDSA => "SHA512withPLAIN-ECDSA",
        _ => return None,
    };
    Some(name)
}


/// Completes an underspecified digest encryption algorithm name with the signer's digest
/// algorithm name (e.g. `RSA` and `SHA-256` become `SHA256withRSA`).
///
/// Fully specified names are returned unchanged.
pub fn signature_algorithm_name(digest_encryption_algorithm: &str, digest_algorithm: &str) -> String {
    let digest = digest_algorithm.replace('-', "");
    match digest_encryption_algorithm {
        "SSAwithRSA/PSS" => format!("{}withRSA/PSS", digest),
        "RSA" => format!("{}withRSA", digest),
        // some issuers put id-ecPublicKey here
        "ECDSA" => format!("{}withECDSA", digest),
        other => other.to_owned(),
    }
}


/// Reads the salt length from RSASSA-PSS parameters, defaulting to the digest length if there are
/// no parameters and to 20 if the parameters leave it out.
fn pss_salt_length(parameters: Option<&Any>, digest: DigestAlgorithm) -> usize {
    let Some(parameters) = parameters else { return digest.output_len() };
    if parameters.tag() != Tag::Sequence {
        return digest.output_len();
    }
    let salt = der_util::parse_all(parameters.value())
        .and_then(|fields| fields.into_iter().find(|f| f.tag == 0xA2))
        .and_then(|salt_field| salt_field.child(0x02))
        .map(|integer| integer.value.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b)));
    salt.unwrap_or(20)
}

/// Reads the hash algorithm from RSASSA-PSS parameters (SHA-1 if left out).
fn pss_digest(parameters: Option<&Any>) -> Option<DigestAlgorithm> {
    let fields = der_util::parse_all(parameters?.value())?;
    let Some(hash_field) = fields.into_iter().find(|f| f.tag == 0xA0) else {
        return Some(DigestAlgorithm::Sha1);
    };
    let oid_tlv = hash_field.child(0x30)?.child(0x06)?;
    let oid = ObjectIdentifier::from_bytes(oid_tlv.value).ok()?;
    DigestAlgorithm::from_oid(&oid)
}


enum VerifyingKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    Curve(PrimeWeierstrassCurve, AffinePoint),
}

fn named_curve(oid: &ObjectIdentifier) -> Option<PrimeWeierstrassCurve> {
    let curve = match *oid {
        oids::NIST_P192 => curves::get_nist_p192(),
        oids::NIST_P224 => curves::get_nist_p224(),
        oids::NIST_P256 => curves::get_nist_p256(),
        oids::NIST_P384 => curves::get_nist_p384(),
        oids::NIST_P521 => curves::get_nist_p521(),
        oids::BRAINPOOL_P192R1 => curves::get_brainpool_p192r1(),
        oids::BRAINPOOL_P224R1 => curves::get_brainpool_p224r1(),
        oids::BRAINPOOL_P256R1 => curves::get_brainpool_p256r1(),
        oids::BRAINPOOL_P320R1 => curves::get_brainpool_p320r1(),
        oids::BRAINPOOL_P384R1 => curves::get_brainpool_p384r1(),
        oids::BRAINPOOL_P512R1 => curves::get_brainpool_p512r1(),
        _ => return None,
    };
    Some(curve)
}

/// Decodes explicit `ECParameters` (RFC 3279 § 2.3.5) over a prime field.
fn explicit_curve(parameters: &[u8]) -> Option<PrimeWeierstrassCurve> {
    let fields = der_util::parse_all(parameters)?;
    let mut fields = fields.into_iter();
    let _version = fields.next().filter(|f| f.tag == 0x02)?;
    let field_id = fields.next().filter(|f| f.tag == 0x30)?.children()?;
    let field_type = field_id.first().filter(|f| f.tag == 0x06)?;
    if ObjectIdentifier::from_bytes(field_type.value).ok()? != oids::PRIME_FIELD {
        return None;
    }
    let prime = BigUint::from_bytes_be(field_id.get(1).filter(|f| f.tag == 0x02)?.value);
    let curve = fields.next().filter(|f| f.tag == 0x30)?.children()?;
    let a = BigUint::from_bytes_be(curve.first().filter(|f| f.tag == 0x04)?.value);
    let b = BigUint::from_bytes_be(curve.get(1).filter(|f| f.tag == 0x04)?.value);
    let generator = AffinePoint::try_from_be_bytes(fields.next().filter(|f| f.tag == 0x04)?.value)?;
    let order = BigUint::from_bytes_be(fields.next().filter(|f| f.tag == 0x02)?.value);
    let cofactor = match fields.next() {
        Some(f) if f.tag == 0x02 => *f.value.last()?,
        _ => 1,
    };
    PrimeWeierstrassCurve::try_new(prime, a, b, generator, order, cofactor).ok()
}

fn verifying_key(spki: &SubjectPublicKeyInfoOwned) -> Result<VerifyingKey, Error> {
    let key_bytes = spki.subject_public_key.raw_bytes();
    match spki.algorithm.oid {
        oids::RSA_ENCRYPTION | oids::RSASSA_PSS => {
            let key = RsaPublicKey::from_pkcs1_der(key_bytes)
                .map_err(|_| Error::InvalidPublicKey)?;
            Ok(VerifyingKey::Rsa(key))
        },
        oids::EC_PUBLIC_KEY => {
            let parameters = spki.algorithm.parameters.as_ref()
                .ok_or(Error::InvalidPublicKey)?;
            let curve = if parameters.tag() == Tag::ObjectIdentifier {
                let curve_oid: ObjectIdentifier = parameters.decode_as()?;
                match curve_oid {
                    oids::NIST_P256 => return p256::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(VerifyingKey::P256)
                        .map_err(|_| Error::InvalidPublicKey),
                    oids::NIST_P384 => return p384::ecdsa::VerifyingKey::from_sec1_bytes(key_bytes)
                        .map(VerifyingKey::P384)
                        .map_err(|_| Error::InvalidPublicKey),
                    other => named_curve(&other)
                        .ok_or(Error::UnsupportedPublicKey { oid: other })?,
                }
            } else {
                explicit_curve(parameters.value())
                    .ok_or(Error::InvalidPublicKey)?
            };
            let point = AffinePoint::try_from_be_bytes(key_bytes)
                .ok_or(Error::InvalidPublicKey)?;
            Ok(VerifyingKey::Curve(curve, point))
        },
        other => Err(Error::UnsupportedPublicKey { oid: other }),
    }
}

/// Splits an ECDSA signature into `(r, s)`.
fn ecdsa_components(signature: &[u8], scheme: SignatureScheme) -> Option<(BigUint, BigUint)> {
    if scheme == SignatureScheme::PlainEcdsa {
        if signature.is_empty() || signature.len() % 2 != 0 {
            return None;
        }
        let (r, s) = signature.split_at(signature.len() / 2);
        return Some((BigUint::from_bytes_be(r), BigUint::from_bytes_be(s)));
    }
    let (sequence, rest) = der_util::parse_tlv(signature)?;
    if sequence.tag != 0x30 || !rest.is_empty() {
        return None;
    }
    let children = sequence.children()?;
    match children.as_slice() {
        [r, s] if r.tag == 0x02 && s.tag == 0x02
            => Some((BigUint::from_bytes_be(r.value), BigUint::from_bytes_be(s.value))),
        _ => None,
    }
}

fn verify_rsa<D>(key: &RsaPublicKey, scheme: SignatureScheme, hashed: &[u8], signature: &[u8], salt_len: usize) -> bool
    where D: 'static + Digest + DynDigest + AssociatedOid + Send + Sync
{
    match scheme {
        SignatureScheme::RsaPkcs1 => key.verify(Pkcs1v15Sign::new::<D>(), hashed, signature).is_ok(),
        SignatureScheme::RsaPss => key.verify(Pss::new_with_salt::<D>(salt_len), hashed, signature).is_ok(),
        SignatureScheme::Ecdsa | SignatureScheme::PlainEcdsa => false,
    }
}

/// Verifies a signature over `message` with the public key in `spki`.
pub fn verify_with_key(
    spki: &SubjectPublicKeyInfoOwned,
    algorithm: SignatureAlgorithm,
    algorithm_parameters: Option<&Any>,
    message: &[u8],
    signature: &[u8],
) -> Result<(), Error> {
    let key = verifying_key(spki)?;
    let hashed = algorithm.digest.digest(message);

    let verified = match (&key, algorithm.scheme) {
        (VerifyingKey::Rsa(rsa_key), scheme @ (SignatureScheme::RsaPkcs1 | SignatureScheme::RsaPss)) => {
            let salt_len = pss_salt_length(algorithm_parameters, algorithm.digest);
            match algorithm.digest {
                DigestAlgorithm::Sha1 => verify_rsa::<Sha1>(rsa_key, scheme, &hashed, signature, salt_len),
                DigestAlgorithm::Sha224 => verify_rsa::<Sha224>(rsa_key, scheme, &hashed, signature, salt_len),
                DigestAlgorithm::Sha256 => verify_rsa::<Sha256>(rsa_key, scheme, &hashed, signature, salt_len),
                DigestAlgorithm::Sha384 => verify_rsa::<Sha384>(rsa_key, scheme, &hashed, signature, salt_len),
                DigestAlgorithm::Sha512 => verify_rsa::<Sha512>(rsa_key, scheme, &hashed, signature, salt_len),
            }
        },
        (VerifyingKey::P256(ec_key), SignatureScheme::Ecdsa) => {
            let sig = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| Error::InvalidSignatureEncoding)?;
            ec_key.verify_prehash(&hashed, &sig).is_ok()
        },
        (VerifyingKey::P256(ec_key), SignatureScheme::PlainEcdsa) => {
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::InvalidSignatureEncoding)?;
            ec_key.verify_prehash(&hashed, &sig).is_ok()
        },
        (VerifyingKey::P384(ec_key), SignatureScheme::Ecdsa) => {
            let sig = p384::ecdsa::Signature::from_der(signature)
                .map_err(|_| Error::InvalidSignatureEncoding)?;
            ec_key.verify_prehash(&hashed, &sig).is_ok()
        },
        (VerifyingKey::P384(ec_key), SignatureScheme::PlainEcdsa) => {
            let sig = p384::ecdsa::Signature::from_slice(signature)
                .map_err(|_| Error::InvalidSignatureEncoding)?;
            ec_key.verify_prehash(&hashed, &sig).is_ok()
        },
        (VerifyingKey::Curve(curve, point), scheme @ (SignatureScheme::Ecdsa | SignatureScheme::PlainEcdsa)) => {
            let (r, s) = ecdsa_components(signature, scheme)
                .ok_or(Error::InvalidSignatureEncoding)?;
            curve.verify_prehashed(point, &hashed, &r, &s)
        },
        _ => return Err(Error::UnsupportedSignatureAlgorithm { name: algorithm.name() }),
    };
    if verified {
        Ok(())
    } else {
        Err(Error::SignatureMismatch)
    }
}


/// Determines the algorithm the document signer used for the security object.
pub fn document_signature_algorithm(sod: &DocumentSecurityObject) -> Result<SignatureAlgorithm, Error> {
    let signer_info = sod.signer_info()?;
    let digest_oid = signer_info.digest_alg.oid;
    let digest = DigestAlgorithm::from_oid(&digest_oid)
        .ok_or(Error::UnsupportedDigestAlgorithm { oid: digest_oid })?;
    let encryption_oid = signer_info.signature_algorithm.oid;
    let encryption_name = algorithm_name_for_oid(&encryption_oid)
        .ok_or_else(|| Error::UnsupportedSignatureAlgorithm { name: encryption_oid.to_string() })?;
    let name = signature_algorithm_name(encryption_name, digest.name());
    SignatureAlgorithm::from_name(&name)
        .ok_or(Error::UnsupportedSignatureAlgorithm { name })
}

/// Checks the document signer's signature over the security object, reporting why it failed.
pub fn check_document_signature(sod: &DocumentSecurityObject) -> Result<(), Error> {
    let certificate = sod.signer_certificate()
        .ok_or(Error::MissingSignerCertificate)?;
    let algorithm = document_signature_algorithm(sod)?;
    debug!(algorithm = %algorithm.name(), "verifying document signature");

    if let Some(message_digest) = sod.message_digest() {
        let content_digest = algorithm.digest.digest(sod.encapsulated_content());
        if !bool::from(content_digest.ct_eq(&message_digest)) {
            return Err(Error::MessageDigestMismatch);
        }
    }

    let signer_info = sod.signer_info()?;
    verify_with_key(
        &certificate.tbs_certificate.subject_public_key_info,
        algorithm,
        signer_info.signature_algorithm.parameters.as_ref(),
        &sod.signed_content()?,
        sod.signature()?,
    )
}

/// Whether the document signer's signature over the security object is valid.
///
/// Never fails; any problem is logged and yields `false`.
pub fn verify_signature(sod: &DocumentSecurityObject) -> bool {
    match check_document_signature(sod) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "document signature not verified");
            false
        },
    }
}


/// Checks the signature on `certificate` with the public key of `issuer`.
pub fn check_certificate_signature(certificate: &Certificate, issuer: &Certificate) -> Result<(), Error> {
    let algorithm_identifier = &certificate.signature_algorithm;
    let algorithm = if algorithm_identifier.oid == oids::RSASSA_PSS {
        let digest = pss_digest(algorithm_identifier.parameters.as_ref())
            .ok_or_else(|| Error::UnsupportedSignatureAlgorithm { name: "SSAwithRSA/PSS".to_owned() })?;
        SignatureAlgorithm { scheme: SignatureScheme::RsaPss, digest }
    } else {
        algorithm_name_for_oid(&algorithm_identifier.oid)
            .and_then(SignatureAlgorithm::from_name)
            .ok_or_else(|| Error::UnsupportedSignatureAlgorithm { name: algorithm_identifier.oid.to_string() })?
    };
    let tbs = certificate.tbs_certificate.to_der()?;
    verify_with_key(
        &issuer.tbs_certificate.subject_public_key_info,
        algorithm,
        algorithm_identifier.parameters.as_ref(),
        &tbs,
        certificate.signature.raw_bytes(),
    )
}

/// Whether a certificate in the master list whose subject equals the signer certificate's issuer
/// has signed the signer certificate.
pub fn verify_issuer(certificate: &Certificate, master_list: &[Certificate]) -> bool {
    let issuer_name = &certificate.tbs_certificate.issuer;
    let candidates = master_list.iter()
        .filter(|candidate| &candidate.tbs_certificate.subject == issuer_name);
    let mut candidate_count = 0;
    for candidate in candidates {
        candidate_count += 1;
        match check_certificate_signature(certificate, candidate) {
            Ok(()) => return true,
            Err(e) => debug!(error = %e, "issuer candidate rejected"),
        }
    }
    debug!(master_list_len = master_list.len(), candidate_count, "no issuer verified the document signer");
    false
}


/// Compares the hash of a data group's bytes with the hash stored in the security object.
pub fn verify_data_group_hash(sod: &DocumentSecurityObject, data_group_number: u8, contents: &[u8]) -> bool {
    let oid = sod.data_group_digest_algorithm();
    let Some(digest) = DigestAlgorithm::from_oid(&oid) else {
        warn!(%oid, "unsupported data group hash algorithm");
        return false;
    };
    let Some(expected) = sod.data_group_hash(data_group_number) else {
        warn!(data_group_number, "data group hash missing from security object");
        return false;
    };
    let matches = bool::from(digest.digest(contents).ct_eq(expected));
    if !matches {
        warn!(data_group_number, "data group hash mismatch");
    }
    matches
}
