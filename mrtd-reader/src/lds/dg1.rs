//! Data group 1: the machine-readable zone.


use crate::lds::{unwrap_template, EfIdentifier, Error};
use crate::mrz::MrzRecord;


const DG1_TAG: u32 = 0x61;
const MRZ_TAG: u32 = 0x5F1F;


/// Decodes DG1 (`0x61` containing the MRZ in `0x5F1F`).
pub fn decode(bytes: &[u8]) -> Result<MrzRecord, Error> {
    let template = unwrap_template(EfIdentifier::Dg1, bytes, DG1_TAG)?;
    let mrz_object = template.child(MRZ_TAG)
        .ok_or(Error::MissingObject { file: EfIdentifier::Dg1, tag: MRZ_TAG })?;
    let mrz: String = mrz_object.value.iter()
        .map(|b| char::from(*b))
        .collect();
    Ok(MrzRecord::parse(&mrz)?)
}
