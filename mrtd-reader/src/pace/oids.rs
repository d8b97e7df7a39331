//! Object identifiers relevant to PACE.


use der::asn1::ObjectIdentifier;


macro_rules! pace_oid {
    ($name:ident) => {
        pub const $name: ObjectIdentifier = ObjectIdentifier::new_unwrap("0.4.0.127.0.7.2.2.4");
    };
    ($name:ident, $suffix:literal) => {
        pub const $name: ObjectIdentifier = ObjectIdentifier::new_unwrap(concat!("0.4.0.127.0.7.2.2.4.", $suffix));
    };
}

pace_oid!(PACE_OID_PREFIX);

pace_oid!(PACE_DH_GM,                   "1");
pace_oid!(PACE_DH_GM_3DES_CBC_CBC,      "1.1");
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_128,  "1.2");
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_192,  "1.3");
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_256,  "1.4");

pace_oid!(PACE_ECDH_GM,                     "2");
pace_oid!(PACE_ECDH_GM_3DES_CBC_CBC,        "2.1");
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_128,    "2.2");
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_192,    "2.3");
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_256,    "2.4");

pace_oid!(PACE_DH_IM,                   "3");
pace_oid!(PACE_DH_IM_3DES_CBC_CBC,      "3.1");
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_128,  "3.2");
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_192,  "3.3");
pace_oid!(PACE_DH_IM_AES_CBC_CMAC_256,  "3.4");

pace_oid!(PACE_ECDH_IM,                     "4");
pace_oid!(PACE_ECDH_IM_3DES_CBC_CBC,        "4.1");
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_128,    "4.2");
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_192,    "4.3");
pace_oid!(PACE_ECDH_IM_AES_CBC_CMAC_256,    "4.4");

// 5 is unused (theoretically DH-CAM)

pace_oid!(PACE_ECDH_CAM,                    "6");
// 6.1 is unused (theoretically ECDH-CAM with 3DES)
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_128,   "6.2");
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_192,   "6.3");
pace_oid!(PACE_ECDH_CAM_AES_CBC_CMAC_256,   "6.4");


/// How the ephemeral domain parameters are derived from the nonce.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mapping {
    Generic,
    Integrated,
    ChipAuthentication,
}

/// The group in which the key agreement takes place.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyAgreement {
    DiffieHellman,
    EllipticCurveDiffieHellman,
}

/// The cipher and MAC used for the nonce and for Secure Messaging.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SymmetricCipher {
    TripleDes,
    Aes128,
    Aes192,
    Aes256,
}


/// A PACE protocol identifier, decomposed into its constituents.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Protocol {
    pub mapping: Mapping,
    pub key_agreement: KeyAgreement,
    pub cipher: SymmetricCipher,
}
impl Protocol {
    /// Decomposes a protocol identifier, returning `None` if it is not a known PACE protocol.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        let (mapping, key_agreement) = match oid.parent() {
            Some(p) if p == PACE_DH_GM => (Mapping::Generic, KeyAgreement::DiffieHellman),
            Some(p) if p == PACE_ECDH_GM => (Mapping::Generic, KeyAgreement::EllipticCurveDiffieHellman),
            Some(p) if p == PACE_DH_IM => (Mapping::Integrated, KeyAgreement::DiffieHellman),
            Some(p) if p == PACE_ECDH_IM => (Mapping::Integrated, KeyAgreement::EllipticCurveDiffieHellman),
            Some(p) if p == PACE_ECDH_CAM => (Mapping::ChipAuthentication, KeyAgreement::EllipticCurveDiffieHellman),
            _ => return None,
        };
        let cipher = match oid.arcs().last()? {
            1 if mapping != Mapping::ChipAuthentication => SymmetricCipher::TripleDes,
            2 => SymmetricCipher::Aes128,
            3 => SymmetricCipher::Aes192,
            4 => SymmetricCipher::Aes256,
            _ => return None,
        };
        Some(Self {
            mapping,
            key_agreement,
            cipher,
        })
    }
}
