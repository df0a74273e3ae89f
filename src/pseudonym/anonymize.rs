//! Irreversible removal of patient demographics.

use dicom_core::Tag;
use dicom_object::mem::InMemDicomObject;

/// Demographic attributes stripped during anonymization. PatientID
/// (0010,0020) is deliberately not in this list: it is still needed to
/// organize files on disk.
const TAGS_TO_REMOVE: &[Tag] = &[
    Tag(0x0010, 0x0010), // PatientName
    Tag(0x0010, 0x0030), // PatientBirthDate
    Tag(0x0010, 0x0040), // PatientSex
    Tag(0x0010, 0x1010), // PatientAge
    Tag(0x0010, 0x1030), // PatientWeight
    Tag(0x0010, 0x1000), // OtherPatientIDs
    Tag(0x0010, 0x1001), // OtherPatientNames
    Tag(0x0010, 0x2160), // EthnicGroup
    Tag(0x0010, 0x4000), // PatientComments
    Tag(0x0010, 0x1040), // PatientAddress
    Tag(0x0010, 0x2154), // PatientTelephoneNumbers
    Tag(0x0010, 0x1060), // PatientMotherBirthName
    Tag(0x0010, 0x1080), // MilitaryRank
    Tag(0x0010, 0x1081), // BranchOfService
    Tag(0x0010, 0x1090), // MedicalRecordLocator
    Tag(0x0008, 0x1120), // ReferencedPatientSequence
    Tag(0x0010, 0x2297), // ResponsiblePerson
    Tag(0x0010, 0x2298), // ResponsiblePersonRole
    Tag(0x0010, 0x2299), // ResponsibleOrganization
];

/// Remove patient demographics from a dataset in place. No mapping is
/// retained; this is not reversible.
pub fn anonymize_obj(obj: &mut InMemDicomObject) {
    for tag in TAGS_TO_REMOVE {
        obj.remove_element(*tag);
    }
}
