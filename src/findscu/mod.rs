//! C-FIND SCU against the Study Root query/retrieve model.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::{tags, uids};
use dicom_encoding::TransferSyntaxIndex;
use dicom_object::{mem::InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    pdu::{PDataValue, PDataValueType},
    ClientAssociationOptions, Pdu,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::config::PacsNodeConfig;
use crate::criteria::{QueryLevel, SearchCriteria};
use crate::utils::element_str;

#[derive(Debug, Snafu)]
pub enum Error {
    /// Could not initialize SCU
    Scu {
        source: Box<dicom_ul::association::Error>,
    },

    /// Could not construct DICOM command
    CreateCommand {
        source: Box<dicom_object::WriteError>,
    },

    /// Error writing the query identifier to the wire
    WriteDataset {
        source: Box<dicom_object::WriteError>,
    },
    ReadDataset {
        source: dicom_object::ReadError,
    },
    MissingAttribute {
        tag: Tag,
        source: dicom_object::AccessError,
    },
    ConvertField {
        tag: Tag,
        source: dicom_core::value::ConvertValueError,
    },
    /// No matching presentation contexts
    NoPresentationContext,
    /// The negotiated transfer syntax is not supported
    UnsupportedTransferSyntax { uid: String },
    /// The archive rejected the query (status code {status:04X}H)
    QueryFailed { status: u16 },
}

/// One entry of a C-FIND result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRecord {
    pub patient_id: Option<String>,
    pub patient_name: Option<String>,
    pub study_instance_uid: Option<String>,
    pub series_instance_uid: Option<String>,
    pub series_description: Option<String>,
    pub series_number: Option<String>,
    pub modality: Option<String>,
}

impl MatchRecord {
    fn from_obj(obj: &InMemDicomObject) -> Self {
        MatchRecord {
            patient_id: element_str(obj, tags::PATIENT_ID),
            patient_name: element_str(obj, tags::PATIENT_NAME),
            study_instance_uid: element_str(obj, tags::STUDY_INSTANCE_UID),
            series_instance_uid: element_str(obj, tags::SERIES_INSTANCE_UID),
            series_description: element_str(obj, tags::SERIES_DESCRIPTION),
            series_number: element_str(obj, tags::SERIES_NUMBER),
            modality: element_str(obj, tags::MODALITY),
        }
    }
}

/// Run one C-FIND against the archive and collect every pending match.
///
/// The association is opened, drained and released within this call.
pub async fn search(
    config: &PacsNodeConfig,
    criteria: &SearchCriteria,
) -> Result<Vec<MatchRecord>, Error> {
    let mut scu = ClientAssociationOptions::new()
        .calling_ae_title(&config.calling_ae_title)
        .called_ae_title(&config.called_ae_title)
        .max_pdu_length(config.max_pdu_length)
        .with_presentation_context(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            vec![
                "1.2.840.10008.1.2.1", // Explicit VR Little Endian
                "1.2.840.10008.1.2",   // Implicit VR Little Endian
            ],
        )
        .establish_with_async(&config.addr())
        .await
        .map_err(Box::from)
        .context(ScuSnafu)?;

    let pc_selected = scu
        .presentation_contexts()
        .first()
        .context(NoPresentationContextSnafu)?
        .clone();
    let ts_uid = pc_selected.transfer_syntax.clone();
    let ts_selected = TransferSyntaxRegistry
        .get(&ts_uid)
        .context(UnsupportedTransferSyntaxSnafu { uid: ts_uid.clone() })?;

    let cmd = find_req_command(1);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(
        &mut cmd_data,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(Box::from)
    .context(CreateCommandSnafu)?;

    let identifier = build_query_identifier(criteria);
    let mut iod_data = Vec::with_capacity(128);
    identifier
        .write_dataset_with_ts(&mut iod_data, ts_selected)
        .map_err(Box::from)
        .context(WriteDatasetSnafu)?;

    debug!(level = criteria.level.as_str(), "sending C-FIND request");
    scu.send(&Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc_selected.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            },
            PDataValue {
                presentation_context_id: pc_selected.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: iod_data,
            },
        ],
    })
    .await
    .map_err(Box::from)
    .context(ScuSnafu)?;

    let mut matches = Vec::new();
    let mut identifier_buffer: Vec<u8> = Vec::with_capacity(1024);
    let mut failed_status = None;

    'outer: loop {
        let rsp_pdu = scu.receive().await.map_err(Box::from).context(ScuSnafu)?;
        match rsp_pdu {
            Pdu::PData { data } => {
                for data_value in data {
                    match data_value.value_type {
                        PDataValueType::Command => {
                            let cmd_obj = InMemDicomObject::read_dataset_with_ts(
                                data_value.data.as_slice(),
                                &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                    .erased(),
                            )
                            .context(ReadDatasetSnafu)?;
                            let status = cmd_obj
                                .element(tags::STATUS)
                                .context(MissingAttributeSnafu { tag: tags::STATUS })?
                                .to_int::<u16>()
                                .context(ConvertFieldSnafu { tag: tags::STATUS })?;

                            match status {
                                // pending, an identifier data set follows
                                0xFF00 | 0xFF01 => {}
                                0x0000 => {
                                    debug!(matches = matches.len(), "C-FIND completed");
                                    break 'outer;
                                }
                                0xFE00 => {
                                    warn!("C-FIND cancelled by the archive");
                                    break 'outer;
                                }
                                other => {
                                    failed_status = Some(other);
                                    break 'outer;
                                }
                            }
                        }
                        PDataValueType::Data => {
                            identifier_buffer.extend(data_value.data);
                            if data_value.is_last {
                                let obj = InMemDicomObject::read_dataset_with_ts(
                                    identifier_buffer.as_slice(),
                                    ts_selected,
                                )
                                .context(ReadDatasetSnafu)?;
                                matches.push(MatchRecord::from_obj(&obj));
                                identifier_buffer.clear();
                            }
                        }
                    }
                }
            }
            pdu => {
                warn!("Unexpected SCP response: {:?}", pdu);
                let _ = scu.abort().await;
                return QueryFailedSnafu { status: 0xC000u16 }.fail();
            }
        }
    }

    let _ = scu.release().await;
    match failed_status {
        Some(status) => QueryFailedSnafu { status }.fail(),
        None => Ok(matches),
    }
}

/// C-FIND-RQ command object for the Study Root information model.
fn find_req_command(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0020])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
    ])
}

/// Build the query identifier. Criteria values become matching keys; every
/// attribute we want echoed back is present with an empty value.
fn build_query_identifier(criteria: &SearchCriteria) -> InMemDicomObject {
    let value = |field: &Option<String>| field.clone().unwrap_or_default();
    let mut elements = vec![
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, criteria.level.as_str()),
        ),
        DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, value(&criteria.patient_id)),
        ),
        DataElement::new(
            tags::PATIENT_NAME,
            VR::PN,
            dicom_value!(Str, value(&criteria.patient_name)),
        ),
        DataElement::new(
            tags::PATIENT_BIRTH_DATE,
            VR::DA,
            dicom_value!(Str, value(&criteria.patient_birth_date)),
        ),
        DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            dicom_value!(Str, value(&criteria.study_date)),
        ),
        DataElement::new(
            tags::STUDY_DESCRIPTION,
            VR::LO,
            dicom_value!(Str, value(&criteria.study_description)),
        ),
        DataElement::new(
            tags::ACCESSION_NUMBER,
            VR::SH,
            dicom_value!(Str, value(&criteria.accession_number)),
        ),
        DataElement::new(
            tags::MODALITY,
            VR::CS,
            dicom_value!(Str, value(&criteria.modality)),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, value(&criteria.study_instance_uid)),
        ),
    ];
    if criteria.level != QueryLevel::Study {
        elements.extend([
            DataElement::new(
                tags::SERIES_DESCRIPTION,
                VR::LO,
                dicom_value!(Str, value(&criteria.series_description)),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, value(&criteria.series_instance_uid)),
            ),
            DataElement::new(tags::SERIES_NUMBER, VR::IS, dicom_value!(Str, "")),
        ]);
    }
    InMemDicomObject::from_element_iter(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_targets_the_study_root_find_model() {
        let cmd = find_req_command(3);
        assert_eq!(
            cmd.element(tags::AFFECTED_SOP_CLASS_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
        );
        assert_eq!(
            cmd.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x0020
        );
        assert_eq!(cmd.element(tags::MESSAGE_ID).unwrap().uint16().unwrap(), 3);
    }

    #[test]
    fn series_identifier_carries_criteria_and_empty_return_keys() {
        let criteria = SearchCriteria::series("PAT1", "T2mapping");
        let identifier = build_query_identifier(&criteria);

        assert_eq!(
            identifier
                .element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "SERIES"
        );
        assert_eq!(
            identifier.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            "PAT1"
        );
        assert_eq!(
            identifier
                .element(tags::SERIES_DESCRIPTION)
                .unwrap()
                .to_str()
                .unwrap(),
            "T2mapping"
        );
        // return keys are present but empty
        assert!(identifier
            .element(tags::SERIES_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .is_empty());
        assert!(identifier
            .element(tags::STUDY_INSTANCE_UID)
            .unwrap()
            .to_str()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn study_identifier_has_no_series_keys() {
        let criteria = SearchCriteria {
            patient_id: Some("PAT1".into()),
            ..Default::default()
        };
        let identifier = build_query_identifier(&criteria);
        assert_eq!(
            identifier
                .element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "STUDY"
        );
        assert!(identifier.element(tags::SERIES_INSTANCE_UID).is_err());
    }
}
