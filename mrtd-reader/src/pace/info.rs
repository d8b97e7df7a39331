//! Discovery of PACE parameters from `EF.CardAccess` and `EF.CardSecurity`.


use der::{Decode, Sequence};
use der::asn1::ObjectIdentifier;
use tracing::debug;

use crate::der_util;
use crate::lds::sod;
use crate::pace::Error;
use crate::pace::oids::Protocol;


/// A `PACEInfo` security info.
///
/// ```plain
/// PACEInfo ::= SEQUENCE {
///     protocol OBJECT IDENTIFIER,
///     version INTEGER, -- MUST be 2
///     parameterId INTEGER OPTIONAL
/// }
/// ```
#[derive(Clone, Debug, Eq, Hash, PartialEq, Sequence)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u8,
    pub parameter_id: Option<u32>,
}


/// Extracts the `PACEInfo` entries from an encoded `SecurityInfos` structure (`SET OF SecurityInfo`).
///
/// Security infos of other protocols are skipped, as are PACE entries that don't match the
/// `PACEInfo` structure (e.g. `PACEDomainParameterInfo`, which shares the OID prefix but not the
/// protocol identifiers).
pub fn parse_pace_infos(security_infos: &[u8]) -> Result<Vec<PaceInfo>, Error> {
    let (set, _rest) = der_util::parse_tlv(security_infos)
        .ok_or(Error::SecurityInfosDecoding)?;
    if set.tag != 0x31 {
        return Err(Error::SecurityInfosDecoding);
    }

    let mut pace_infos = Vec::new();
    let mut remaining = set.value;
    while !remaining.is_empty() {
        let (entry, rest) = der_util::parse_tlv(remaining)
            .ok_or(Error::SecurityInfosDecoding)?;
        let entry_bytes = &remaining[..entry.total_len()];
        remaining = rest;

        if entry.tag != 0x30 {
            continue;
        }
        let Some(first) = der_util::parse_tlv(entry.value).map(|(tlv, _)| tlv) else { continue };
        if first.tag != 0x06 {
            continue;
        }
        let Ok(protocol) = ObjectIdentifier::from_bytes(first.value) else { continue };
        if Protocol::from_oid(&protocol).is_none() {
            continue;
        }
        match PaceInfo::from_der(entry_bytes) {
            Ok(pace_info) => pace_infos.push(pace_info),
            Err(e) => debug!(%protocol, error = %e, "skipping malformed PACEInfo"),
        }
    }
    Ok(pace_infos)
}


/// Extracts the `SecurityInfos` from `EF.CardSecurity`, which wraps them in a CMS `SignedData`.
pub fn security_infos_from_card_security(card_security: &[u8]) -> Result<Vec<u8>, Error> {
    let signed_data = sod::decode_signed_data(card_security)
        .map_err(|_| Error::SecurityInfosDecoding)?;
    sod::encapsulated_content(&signed_data)
        .ok_or(Error::SecurityInfosDecoding)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::pace::oids;
    use hex_literal::hex;

    #[test]
    fn card_access_with_single_pace_info() {
        // ICAO Doc 9303 Part 11 Appendix G.1 (EF.CardAccess)
        let card_access = hex!("31 14 30 12 06 0A 04 00 7F 00 07 02 02 04 02 02 02 01 02 02 01 0D");
        let infos = parse_pace_infos(&card_access).unwrap();
        assert_eq!(infos, vec![PaceInfo {
            protocol: oids::PACE_ECDH_GM_AES_CBC_CMAC_128,
            version: 2,
            parameter_id: Some(13),
        }]);
    }

    #[test]
    fn foreign_security_infos_are_skipped() {
        // a ChipAuthenticationInfo (0.4.0.127.0.7.2.2.3.2.1) followed by a DH PACEInfo
        let card_access = hex!("
            31 25
                30 0F 06 0A 04 00 7F 00 07 02 02 03 02 01 02 01 01
                30 12 06 0A 04 00 7F 00 07 02 02 04 01 02 02 01 02 02 01 00
        ");
        let infos = parse_pace_infos(&card_access).unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].protocol, oids::PACE_DH_GM_AES_CBC_CMAC_128);
        assert_eq!(infos[0].parameter_id, Some(0));
    }

    #[test]
    fn not_a_set() {
        assert!(parse_pace_infos(&hex!("30 00")).is_err());
        assert!(parse_pace_infos(&hex!("31 05 30")).is_err());
    }
}
