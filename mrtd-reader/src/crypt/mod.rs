//! Cryptographic functionality.


pub mod cipher_mac;
pub mod dh;
pub mod elliptic;


use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};


/// An error that occurred during a cryptographic operation.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    /// A key had the wrong length.
    KeyLength { obtained: usize },

    /// Data to be encrypted, decrypted or authenticated had an invalid length.
    DataLength { obtained: usize },

    /// The public key supplied by the other party is not a valid group element.
    InvalidPublicKey,

    /// A computation resulted in the identity element or another unusable value.
    DegenerateResult,

    /// The domain parameters are inconsistent.
    InvalidDomainParameters,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyLength { obtained }
                => write!(f, "invalid key length {}", obtained),
            Self::DataLength { obtained }
                => write!(f, "invalid data length {}", obtained),
            Self::InvalidPublicKey
                => write!(f, "invalid public key"),
            Self::DegenerateResult
                => write!(f, "degenerate key agreement result"),
            Self::InvalidDomainParameters
                => write!(f, "invalid domain parameters"),
        }
    }
}
impl std::error::Error for Error {
}


/// A key exchange method.
///
/// Private keys are always passed as unsigned integers in big-endian byte order.
///
/// The representation of public and secret keys differs according to the key exchange method.
///
/// For classic Diffie-Hellman, public and secret keys are represented as unsigned integers in
/// big-endian byte order. Public keys and shared secrets are padded to the byte length of the
/// prime.
///
/// For elliptic-curve Diffie-Hellman, public keys are represented as affine coordinates of a point
/// on the curve. They are serialized in the following sequence:
/// 1. the byte `0x04` to signify uncompressed coordinates
/// 2. the x coordinate as an unsigned integer in big-endian byte order
/// 3. the y coordinate as an unsigned integer in big-endian byte order
/// Both coordinates are encoded in the same number of bytes as the byte length of the prime.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyExchange {
    DiffieHellman(DiffieHellmanParams),
    PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve),
}
impl KeyExchange {
    /// Returns the recommended number of bytes for a private key using this key exchange method.
    pub fn private_key_len_bytes(&self) -> usize {
        match self {
            Self::DiffieHellman(dhp) => dhp.subgroup_size_bytes(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.private_key_len_bytes(),
        }
    }

    /// Generates a random private key of the recommended length.
    ///
    /// The key is nonzero and smaller than the group order.
    pub fn generate_private_key<R: RngCore>(&self, rng: &mut R) -> Zeroizing<Vec<u8>> {
        let order = match self {
            Self::DiffieHellman(dhp) => dhp.subgroup_order(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.order(),
        };
        let mut key = Zeroizing::new(vec![0u8; self.private_key_len_bytes()]);
        loop {
            rng.fill_bytes(key.as_mut_slice());
            let value = BigUint::from_bytes_be(&key);
            if value.bits() > 1 && &value < order {
                return key;
            }
        }
    }

    /// Calculates a public key for the given private key, returning it serialized to bytes.
    pub fn calculate_public_key(&self, private_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let public_key_int = dhp.calculate_public_key(&private_key_int);
                Ok(to_padded_be_bytes(&public_key_int, dhp.prime_size_bytes()))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let public_key_point = curve.calculate_public_key(&private_key_int)?;
                Ok(public_key_point.to_be_bytes(curve.private_key_len_bytes()))
            },
        }
    }

    /// Performs the key exchange using the given private key and the other party's public key,
    /// generating a shared secret.
    ///
    /// For classic Diffie-Hellman, the shared secret is serialized as an unsigned integer in
    /// big-endian byte order, padded to the byte length of the prime.
    ///
    /// For elliptic-curve Diffie-Hellman, only the x coordinate of the shared point is serialized,
    /// padded to the byte length of the prime.
    pub fn exchange_keys(&self, private_key: &[u8], other_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(&private_key_int, &other_public_key_int)?;
                Ok(to_padded_be_bytes(&shared_secret, dhp.prime_size_bytes()))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_secret_point = curve.diffie_hellman(&private_key_int, &other_public_key_point)?;
                Ok(to_padded_be_bytes(shared_secret_point.x(), curve.private_key_len_bytes()))
            },
        }
    }

    /// Derives a new key exchange method using generic mapping.
    ///
    /// The generic mapping process keeps the same parameters but derives a new generator using a
    /// given nonce and a shared secret derived from the given private key and the other party's
    /// public key using the current key exchange method.
    ///
    /// Since the derivation requires both coordinates of the secret key with elliptic-curve
    /// Diffie-Hellman, the key exchange step is integrated into this function, as
    /// [`Self::exchange_keys`] only returns the x coordinate.
    pub fn derive_generic_mapping(&self, nonce: &[u8], private_key: &[u8], other_public_key: &[u8]) -> Result<Self, Error> {
        let nonce_int = BigUint::from_bytes_be(nonce);
        let private_key_int = BigUint::from_bytes_be(private_key);
        match self {
            Self::DiffieHellman(dhp) => {
                let other_public_key_int = BigUint::from_bytes_be(other_public_key);
                let shared_secret = dhp.diffie_hellman(&private_key_int, &other_public_key_int)?;
                Ok(Self::DiffieHellman(dhp.derive_generic_mapping(&nonce_int, &shared_secret)?))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other_public_key_point = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_secret_point = curve.diffie_hellman(&private_key_int, &other_public_key_point)?;
                Ok(Self::PrimeWeierstrassEllipticDiffieHellman(
                    curve.derive_generic_mapping_session_curve(&nonce_int, &shared_secret_point)?
                ))
            },
        }
    }

    /// The ASN.1 tag representing this type of public key.
    pub fn public_key_tag(&self) -> u8 {
        match self {
            Self::DiffieHellman(_) => 0x84, // Diffie-Hellman public key
            Self::PrimeWeierstrassEllipticDiffieHellman(_) => 0x86, // elliptic curve point
        }
    }
}


/// Serializes an unsigned integer in big-endian byte order, left-padded with zeroes to at least
/// `length` bytes.
pub fn to_padded_be_bytes(value: &BigUint, length: usize) -> Zeroizing<Vec<u8>> {
    let bytes = Zeroizing::new(value.to_bytes_be());
    let mut ret = Zeroizing::new(Vec::with_capacity(length.max(bytes.len())));
    for _ in bytes.len()..length {
        ret.push(0x00);
    }
    ret.extend_from_slice(&bytes);
    ret
}


#[cfg(test)]
mod tests {
    use super::{to_padded_be_bytes, KeyExchange};
    use crate::crypt::elliptic::curves;
    use num_bigint::BigUint;
    use rand::rngs::OsRng;

    #[test]
    fn padded_bytes() {
        assert_eq!(&*to_padded_be_bytes(&BigUint::from(0x0102u16), 4), &[0, 0, 1, 2]);
        assert_eq!(&*to_padded_be_bytes(&BigUint::from(0x0102u16), 1), &[1, 2]);
    }

    #[test]
    fn ephemeral_agreement_matches() {
        let kex = KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_nist_p256());
        let ours = kex.generate_private_key(&mut OsRng);
        let theirs = kex.generate_private_key(&mut OsRng);
        assert_eq!(ours.len(), 32);

        let our_public = kex.calculate_public_key(&ours).unwrap();
        let their_public = kex.calculate_public_key(&theirs).unwrap();
        assert_eq!(our_public.len(), 65);
        assert_eq!(our_public[0], 0x04);

        let a = kex.exchange_keys(&ours, &their_public).unwrap();
        let b = kex.exchange_keys(&theirs, &our_public).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn garbage_public_key_is_rejected() {
        let kex = KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curves::get_brainpool_p256r1());
        let ours = kex.generate_private_key(&mut OsRng);
        assert!(kex.exchange_keys(&ours, &[0x04, 0x01, 0x02]).is_err());
        assert!(kex.exchange_keys(&ours, &[0x02; 33]).is_err());
    }
}
