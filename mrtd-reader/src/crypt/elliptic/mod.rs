//! Elliptic-curve cryptography.
//!
//! Arithmetic is performed in affine coordinates on arbitrary-precision integers. This is not
//! constant-time; the keys involved are ephemeral and live only for the duration of one PACE run.


pub mod curves;


use num_bigint::BigUint;
use num_traits::Zero;
use zeroize::Zeroizing;

use crate::crypt::Error;


/// A point in affine coordinates.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AffinePoint {
    x: BigUint,
    y: BigUint,
}
impl AffinePoint {
    pub const fn new(x: BigUint, y: BigUint) -> Self {
        Self { x, y }
    }

    pub fn x(&self) -> &BigUint { &self.x }
    pub fn y(&self) -> &BigUint { &self.y }

    /// Serializes the point as `0x04 || x || y`, each coordinate left-padded with zeroes to
    /// `bytes_per_component` bytes.
    pub fn to_be_bytes(&self, bytes_per_component: usize) -> Zeroizing<Vec<u8>> {
        let mut ret = Zeroizing::new(Vec::with_capacity(1 + 2*bytes_per_component));
        ret.push(0x04); // uncompressed coordinates
        push_padded(&mut ret, &self.x, bytes_per_component);
        push_padded(&mut ret, &self.y, bytes_per_component);
        ret
    }

    pub fn try_from_be_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 3 {
            // mode x y
            return None;
        }
        if bytes[0] != 0x04 {
            // we only support the uncompressed representation
            return None;
        }
        if (bytes.len() - 1) % 2 != 0 {
            // it must be possible to split the value in the middle
            return None;
        }
        let coordinate_length = (bytes.len() - 1) / 2;

        let x = BigUint::from_bytes_be(&bytes[1..1+coordinate_length]);
        let y = BigUint::from_bytes_be(&bytes[1+coordinate_length..]);
        Some(Self { x, y })
    }
}

fn push_padded(buf: &mut Vec<u8>, value: &BigUint, length: usize) {
    let bytes = Zeroizing::new(value.to_bytes_be());
    let bytes: &[u8] = if value.is_zero() { &[] } else { &bytes };
    for _ in bytes.len()..length {
        buf.push(0x00);
    }
    buf.extend_from_slice(bytes);
}


/// An elliptic curve of the form `y**2 ≡ x**3 + ax + b` modulo a prime number.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PrimeWeierstrassCurve {
    /// The prime (modulus) of the curve.
    prime: BigUint,

    /// Coefficient `a` in the curve's formula.
    coefficient_a: BigUint,

    /// Coefficient `b` in the curve's formula.
    coefficient_b: BigUint,

    /// The coordinates of the generator point of the curve.
    generator: AffinePoint,

    /// The order of the subgroup generated by the generator point.
    order: BigUint,

    /// The cofactor of the curve.
    ///
    /// A cofactor n means that only each nth point on the curve is part of the group.
    cofactor: u8,
}
impl PrimeWeierstrassCurve {
    /// Creates a new curve.
    ///
    /// Panics if the prime is even or the generator is not on the curve. Use [`Self::try_new`] for
    /// parameters that arrive from the outside world.
    pub fn new(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        order: BigUint,
        cofactor: u8,
    ) -> Self {
        match Self::try_new(prime, coefficient_a, coefficient_b, generator, order, cofactor) {
            Ok(curve) => curve,
            Err(e) => panic!("invalid built-in curve: {}", e),
        }
    }

    /// Creates a new curve, verifying the sanity of the parameters.
    pub fn try_new(
        prime: BigUint,
        coefficient_a: BigUint,
        coefficient_b: BigUint,
        generator: AffinePoint,
        order: BigUint,
        cofactor: u8,
    ) -> Result<Self, Error> {
        if !prime.bit(0) || coefficient_a >= prime || coefficient_b >= prime || order.is_zero() {
            return Err(Error::InvalidDomainParameters);
        }
        let curve = Self {
            prime,
            coefficient_a,
            coefficient_b,
            generator,
            order,
            cofactor,
        };
        if !curve.is_on_curve(&curve.generator) {
            return Err(Error::InvalidDomainParameters);
        }
        Ok(curve)
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn coefficient_a(&self) -> &BigUint { &self.coefficient_a }
    pub fn coefficient_b(&self) -> &BigUint { &self.coefficient_b }
    pub fn generator(&self) -> &AffinePoint { &self.generator }
    pub fn order(&self) -> &BigUint { &self.order }
    pub fn cofactor(&self) -> u8 { self.cofactor }

    /// Calculates the number of bytes a private key used with this curve should have.
    ///
    /// This is also the number of bytes of each coordinate of a serialized point.
    pub fn private_key_len_bytes(&self) -> usize {
        usize::try_from((self.prime.bits() + 7) / 8)
            .unwrap_or(usize::MAX)
    }

    fn sub_mod(&self, lhs: &BigUint, rhs: &BigUint) -> BigUint {
        ((lhs % &self.prime) + &self.prime - (rhs % &self.prime)) % &self.prime
    }

    fn invert(&self, value: &BigUint) -> Option<BigUint> {
        let reduced = value % &self.prime;
        if reduced.is_zero() {
            return None;
        }
        reduced.modinv(&self.prime)
    }

    pub fn is_on_curve(&self, point: &AffinePoint) -> bool {
        if point.x >= self.prime || point.y >= self.prime {
            return false;
        }
        let y_squared = (&point.y * &point.y) % &self.prime;
        let rhs = (&point.x * &point.x * &point.x + &self.coefficient_a * &point.x + &self.coefficient_b)
            % &self.prime;
        y_squared == rhs
    }

    fn double(&self, point: &AffinePoint) -> Option<AffinePoint> {
        // lambda = (3x² + a) / 2y
        let numerator = (BigUint::from(3u8) * &point.x * &point.x + &self.coefficient_a) % &self.prime;
        let denominator_inverse = self.invert(&(&point.y << 1))?;
        let lambda = (numerator * denominator_inverse) % &self.prime;

        let x = self.sub_mod(&(&lambda * &lambda), &(&point.x << 1));
        let y = self.sub_mod(&(&lambda * self.sub_mod(&point.x, &x)), &point.y);
        Some(AffinePoint { x, y })
    }

    /// Adds two points; `None` represents the point at infinity.
    pub fn add(&self, lhs: Option<&AffinePoint>, rhs: Option<&AffinePoint>) -> Option<AffinePoint> {
        let (lhs, rhs) = match (lhs, rhs) {
            (None, None) => return None,
            (Some(p), None) | (None, Some(p)) => return Some(p.clone()),
            (Some(l), Some(r)) => (l, r),
        };

        if lhs.x == rhs.x {
            if lhs.y == rhs.y {
                return self.double(lhs);
            }
            // P + (-P)
            return None;
        }

        // lambda = (y2 - y1) / (x2 - x1)
        let denominator_inverse = self.invert(&self.sub_mod(&rhs.x, &lhs.x))?;
        let lambda = (self.sub_mod(&rhs.y, &lhs.y) * denominator_inverse) % &self.prime;

        let x = self.sub_mod(&self.sub_mod(&(&lambda * &lambda), &lhs.x), &rhs.x);
        let y = self.sub_mod(&(&lambda * self.sub_mod(&lhs.x, &x)), &lhs.y);
        Some(AffinePoint { x, y })
    }

    /// Multiplies a point by a scalar; `None` represents the point at infinity.
    pub fn multiply(&self, scalar: &BigUint, point: &AffinePoint) -> Option<AffinePoint> {
        let mut result: Option<AffinePoint> = None;
        for i in (0..scalar.bits()).rev() {
            result = match &result {
                Some(r) => self.double(r),
                None => None,
            };
            if scalar.bit(i) {
                result = self.add(result.as_ref(), Some(point));
            }
        }
        result
    }

    /// Calculates a public key from a private key.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<AffinePoint, Error> {
        // public_key = private_key * generator
        self.multiply(private_key, &self.generator)
            .ok_or(Error::DegenerateResult)
    }

    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &AffinePoint) -> Result<AffinePoint, Error> {
        // defend against skullduggery: check if other public key is on the curve
        if !self.is_on_curve(other_public_key) {
            return Err(Error::InvalidPublicKey);
        }

        // secret_key = private_key * other_public_key
        self.multiply(private_key, other_public_key)
            .ok_or(Error::DegenerateResult)
    }

    pub fn derive_generic_mapping_session_curve(&self, nonce: &BigUint, shared_secret: &AffinePoint) -> Result<Self, Error> {
        // new_generator = (nonce * original_generator) + shared_secret
        let product = self.multiply(nonce, &self.generator);
        let new_generator = self.add(product.as_ref(), Some(shared_secret))
            .ok_or(Error::DegenerateResult)?;
        debug_assert!(self.is_on_curve(&new_generator));

        Ok(Self {
            prime: self.prime.clone(),
            coefficient_a: self.coefficient_a.clone(),
            coefficient_b: self.coefficient_b.clone(),
            generator: new_generator,
            order: self.order.clone(),
            cofactor: self.cofactor,
        })
    }

    /// Verifies an ECDSA signature `(r, s)` over an already-hashed message against a public key.
    ///
    /// The hash is truncated to the bit length of the group order as usual.
    pub fn verify_prehashed(&self, public_key: &AffinePoint, hash: &[u8], r: &BigUint, s: &BigUint) -> bool {
        let n = &self.order;
        if r.is_zero() || s.is_zero() || r >= n || s >= n {
            return false;
        }
        if !self.is_on_curve(public_key) {
            return false;
        }

        let mut e = BigUint::from_bytes_be(hash);
        let hash_bits = u64::try_from(hash.len() * 8).unwrap_or(u64::MAX);
        if hash_bits > n.bits() {
            e >>= hash_bits - n.bits();
        }

        let w = match s.modinv(n) {
            Some(w) => w,
            None => return false,
        };
        let u1 = (e * &w) % n;
        let u2 = (r * &w) % n;

        let lhs = self.multiply(&u1, &self.generator);
        let rhs = self.multiply(&u2, public_key);
        match self.add(lhs.as_ref(), rhs.as_ref()) {
            Some(point) => &(point.x % n) == r,
            None => false,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{AffinePoint, curves};
    use hex_literal::hex;
    use num_bigint::BigUint;

    fn uint(slice: &[u8]) -> BigUint {
        BigUint::from_bytes_be(slice)
    }

    #[test]
    fn generators_have_declared_order() {
        let all = [
            curves::get_nist_p192(),
            curves::get_nist_p224(),
            curves::get_nist_p256(),
            curves::get_nist_p384(),
            curves::get_nist_p521(),
            curves::get_brainpool_p192r1(),
            curves::get_brainpool_p224r1(),
            curves::get_brainpool_p256r1(),
            curves::get_brainpool_p320r1(),
            curves::get_brainpool_p384r1(),
            curves::get_brainpool_p512r1(),
        ];
        for curve in &all {
            assert_eq!(curve.multiply(curve.order(), curve.generator()), None);
            let order_minus_one = curve.order() - 1u8;
            let minus_g = curve.multiply(&order_minus_one, curve.generator()).unwrap();
            assert_eq!(minus_g.x(), curve.generator().x());
        }
    }

    #[test]
    fn point_serialization_pads_coordinates() {
        let point = AffinePoint::new(BigUint::from(1u8), BigUint::from(0x0203u16));
        assert_eq!(&*point.to_be_bytes(3), &[0x04, 0x00, 0x00, 0x01, 0x00, 0x02, 0x03]);
        assert_eq!(AffinePoint::try_from_be_bytes(&point.to_be_bytes(3)), Some(point));
        assert_eq!(AffinePoint::try_from_be_bytes(&[0x03, 0x01, 0x02]), None);
        assert_eq!(AffinePoint::try_from_be_bytes(&[0x04, 0x01, 0x02, 0x03]), None);
    }

    #[test]
    fn off_curve_public_key_is_rejected() {
        let curve = curves::get_brainpool_p256r1();
        let bogus = AffinePoint::new(BigUint::from(1u8), BigUint::from(1u8));
        assert!(curve.diffie_hellman(&BigUint::from(5u8), &bogus).is_err());
    }

    #[test]
    fn icao_doc9303_part11_secg1_example() {
        // elliptic-curve Diffie-Hellman on Brainpool p256r1
        let curve = curves::get_brainpool_p256r1();

        // obtain nonce
        let nonce = uint(&hex!("
            3F00C4D3 9D153F2B 2A214A07 8D899B22
        "));

        // perform key agreement for session secret
        let terminal_private = uint(&hex!("
            7F4EF07B 9EA82FD7 8AD689B3 8D0BC78C
            F21F249D 953BC46F 4C6E1925 9C010F99
        "));
        let chip_private = uint(&hex!("
            498FF497 56F2DC15 87840041 839A8598
            2BE7761D 14715FB0 91EFA7BC E9058560
        "));

        let terminal_public = curve.calculate_public_key(&terminal_private).unwrap();
        let chip_public = curve.calculate_public_key(&chip_private).unwrap();

        assert_eq!(
            terminal_public.x,
            uint(&hex!("
                7ACF3EFC 982EC455 65A4B155 129EFBC7
                4650DCBF A6362D89 6FC70262 E0C2CC5E
            ")),
        );
        assert_eq!(
            terminal_public.y,
            uint(&hex!("
                544552DC B6725218 799115B5 5C9BAA6D
                9F6BC3A9 618E70C2 5AF71777 A9C4922D
            ")),
        );
        assert_eq!(
            chip_public.x,
            uint(&hex!("
                824FBA91 C9CBE26B EF53A0EB E7342A3B
                F178CEA9 F45DE0B7 0AA60165 1FBA3F57
            ")),
        );

        let terminal_secret = curve.diffie_hellman(&terminal_private, &chip_public).unwrap();
        let chip_secret = curve.diffie_hellman(&chip_private, &terminal_public).unwrap();
        let shared_secret = AffinePoint::new(
            uint(&hex!("
                60332EF2 450B5D24 7EF6D386 8397D398
                852ED6E8 CAF6FFEE F6BF85CA 57057FD5
            ")),
            uint(&hex!("
                0840CA74 15BAF3E4 3BD414D3 5AA4608B
                93A2CAF3 A4E3EA4E 82C9C13D 03EB7181
            ")),
        );
        assert_eq!(terminal_secret, chip_secret);
        assert_eq!(terminal_secret, shared_secret);

        // map a new generator:
        // (nonce * original_generator) + shared_secret
        let session_curve = curve.derive_generic_mapping_session_curve(&nonce, &shared_secret).unwrap();
        assert_eq!(
            session_curve.generator.x,
            uint(&hex!("
                8CED63C9 1426D4F0 EB1435E7 CB1D74A4
                6723A0AF 21C89634 F65A9AE8 7A9265E2
            ")),
        );
        assert_eq!(
            session_curve.generator.y,
            uint(&hex!("
                8C879506 743F8611 AC33645C 5B985C80
                B5F09A0B 83407C1B 6A4D857A E76FE522
            ")),
        );

        let session_terminal_private = uint(&hex!("
            A73FB703 AC1436A1 8E0CFA5A BB3F7BEC
            7A070E7A 6788486B EE230C4A 22762595
        "));
        let session_chip_private = uint(&hex!("
            107CF586 96EF6155 053340FD 633392BA
            81909DF7 B9706F22 6F32086C 7AFF974A
        "));

        let session_terminal_public = session_curve.calculate_public_key(&session_terminal_private).unwrap();
        let session_chip_public = session_curve.calculate_public_key(&session_chip_private).unwrap();

        assert_eq!(
            session_terminal_public.x,
            uint(&hex!("
                2DB7A64C 0355044E C9DF1905 14C625CB
                A2CEA487 54887122 F3A5EF0D 5EDD301C
            ")),
        );
        assert_eq!(
            session_chip_public.x,
            uint(&hex!("
                9E880F84 2905B8B3 181F7AF7 CAA9F0EF
                B743847F 44A306D2 D28C1D9E C65DF6DB
            ")),
        );

        let session_terminal_secret = session_curve.diffie_hellman(&session_terminal_private, &session_chip_public).unwrap();
        let session_chip_secret = session_curve.diffie_hellman(&session_chip_private, &session_terminal_public).unwrap();
        let session_shared_secret = uint(&hex!("
            28768D20 701247DA E81804C9 E780EDE5
            82A9996D B4A31502 0B273319 7DB84925
        "));
        assert_eq!(session_terminal_secret.x, session_shared_secret);
        assert_eq!(session_chip_secret.x, session_shared_secret);
    }
}
