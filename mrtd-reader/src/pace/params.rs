//! Standardized domain parameters (ICAO Doc 9303 Part 11 § 9.5.1).


use crate::crypt::KeyExchange;
use crate::crypt::dh;
use crate::crypt::elliptic::curves;
use crate::pace::oids::KeyAgreement;


/// Returns the key exchange for the given standardized domain parameter identifier, or `None` if
/// the identifier is unknown or does not fit the key agreement.
///
/// Identifiers 1 and 2 (2048-bit MODP groups) are reserved by the standard but are not supported
/// here; passports in the wild use identifier 0 for Diffie-Hellman if they use it at all.
pub fn standardized_key_exchange(key_agreement: KeyAgreement, parameter_id: u32) -> Option<KeyExchange> {
    use KeyExchange::PrimeWeierstrassEllipticDiffieHellman as Ecdh;

    match (key_agreement, parameter_id) {
        (KeyAgreement::DiffieHellman, 0) => Some(KeyExchange::DiffieHellman(dh::get_rfc5114_1024_160())),
        (KeyAgreement::EllipticCurveDiffieHellman, id) => {
            let curve = match id {
                8 => curves::get_nist_p192(),
                9 => curves::get_brainpool_p192r1(),
                10 => curves::get_nist_p224(),
                11 => curves::get_brainpool_p224r1(),
                12 => curves::get_nist_p256(),
                13 => curves::get_brainpool_p256r1(),
                14 => curves::get_brainpool_p320r1(),
                15 => curves::get_nist_p384(),
                16 => curves::get_brainpool_p384r1(),
                17 => curves::get_brainpool_p512r1(),
                18 => curves::get_nist_p521(),
                _ => return None,
            };
            Some(Ecdh(curve))
        },
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::standardized_key_exchange;
    use crate::crypt::KeyExchange;
    use crate::pace::oids::KeyAgreement;

    #[test]
    fn parameter_lookup() {
        assert!(matches!(
            standardized_key_exchange(KeyAgreement::DiffieHellman, 0),
            Some(KeyExchange::DiffieHellman(_)),
        ));
        assert!(standardized_key_exchange(KeyAgreement::DiffieHellman, 12).is_none());
        assert!(standardized_key_exchange(KeyAgreement::EllipticCurveDiffieHellman, 0).is_none());
        assert!(standardized_key_exchange(KeyAgreement::EllipticCurveDiffieHellman, 19).is_none());

        for id in 8..=18 {
            let kex = standardized_key_exchange(KeyAgreement::EllipticCurveDiffieHellman, id).unwrap();
            assert_eq!(kex.public_key_tag(), 0x86);
        }
        let Some(KeyExchange::PrimeWeierstrassEllipticDiffieHellman(p521)) = standardized_key_exchange(KeyAgreement::EllipticCurveDiffieHellman, 18)
            else { panic!("P-521 missing") };
        assert_eq!(p521.private_key_len_bytes(), 66);
    }
}
