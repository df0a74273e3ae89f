//! C-MOVE SCU against the Study Root query/retrieve model.
//!
//! The archive is instructed to push the selected instances to a named
//! destination AE, normally our own C-STORE listener. This module only
//! drives the control channel; the instances themselves arrive through
//! [`crate::storescp`].

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

    /// Error writing the retrieval identifier to the wire
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
    /// The archive ended the retrieval abnormally
    UnexpectedResponse,
}

/// Final accounting of one C-MOVE, as reported by the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveSummary {
    pub status: u16,
    pub completed: u16,
    pub failed: u16,
    pub warnings: u16,
}

impl MoveSummary {
    /// True when the archive reported a clean finish with no failed
    /// sub-operations.
    pub fn is_success(&self) -> bool {
        self.status == 0x0000 && self.failed == 0
    }
}

/// Ask the archive to push everything matching the criteria to
/// `destination_aet`, and wait for the final C-MOVE response.
pub async fn run_move(
    config: &PacsNodeConfig,
    destination_aet: &str,
    criteria: &SearchCriteria,
) -> Result<MoveSummary, Error> {
    let mut scu = ClientAssociationOptions::new()
        .calling_ae_title(&config.calling_ae_title)
        .called_ae_title(&config.called_ae_title)
        .max_pdu_length(config.max_pdu_length)
        .with_presentation_context(
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
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

    let cmd = move_req_command(1, destination_aet);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(
        &mut cmd_data,
        &dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
    )
    .map_err(Box::from)
    .context(CreateCommandSnafu)?;

    let identifier = build_move_identifier(criteria);
    let mut iod_data = Vec::with_capacity(128);
    identifier
        .write_dataset_with_ts(&mut iod_data, ts_selected)
        .map_err(Box::from)
        .context(WriteDatasetSnafu)?;

    debug!(destination = destination_aet, "sending C-MOVE request");
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

    let summary = 'outer: loop {
        let rsp_pdu = scu.receive().await.map_err(Box::from).context(ScuSnafu)?;
        match rsp_pdu {
            Pdu::PData { data } => {
                for data_value in data {
                    // trailing data sets (e.g. failed SOP instance lists)
                    // are drained and ignored
                    if data_value.value_type != PDataValueType::Command {
                        continue;
                    }
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
                    let count = |tag| {
                        cmd_obj
                            .element(tag)
                            .ok()
                            .and_then(|e| e.to_int::<u16>().ok())
                            .unwrap_or(0)
                    };

                    match status {
                        0xFF00 | 0xFF01 => {
                            debug!(
                                remaining = count(tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
                                completed = count(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
                                "C-MOVE in progress"
                            );
                        }
                        final_status => {
                            let summary = MoveSummary {
                                status: final_status,
                                completed: count(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
                                failed: count(tags::NUMBER_OF_FAILED_SUBOPERATIONS),
                                warnings: count(tags::NUMBER_OF_WARNING_SUBOPERATIONS),
                            };
                            if final_status != 0x0000 {
                                warn!(
                                    "C-MOVE finished with status {final_status:04X}H \
                                     (completed {}, failed {})",
                                    summary.completed, summary.failed
                                );
                            }
                            break 'outer summary;
                        }
                    }
                }
            }
            pdu => {
                warn!("Unexpected SCP response: {:?}", pdu);
                let _ = scu.abort().await;
                return UnexpectedResponseSnafu.fail();
            }
        }
    };

    let _ = scu.release().await;
    Ok(summary)
}

/// C-MOVE-RQ command object for the Study Root information model.
fn move_req_command(
    message_id: u16,
    destination_aet: &str,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0021])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination_aet),
        ),
    ])
}

/// The retrieval identifier names the concrete study (and series) by UID.
fn build_move_identifier(criteria: &SearchCriteria) -> InMemDicomObject {
    let value = |field: &Option<String>| field.clone().unwrap_or_default();
    let mut elements = vec![
        DataElement::new(
            tags::QUERY_RETRIEVE_LEVEL,
            VR::CS,
            dicom_value!(Str, criteria.level.as_str()),
        ),
        DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, value(&criteria.study_instance_uid)),
        ),
    ];
    if criteria.level != QueryLevel::Study {
        elements.push(DataElement::new(
            tags::SERIES_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, value(&criteria.series_instance_uid)),
        ));
    }
    InMemDicomObject::from_element_iter(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_the_destination_ae() {
        let cmd = move_req_command(9, "HARVEST-SCU");
        assert_eq!(
            cmd.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x0021
        );
        assert_eq!(
            cmd.element(tags::MOVE_DESTINATION)
                .unwrap()
                .to_str()
                .unwrap()
                .trim(),
            "HARVEST-SCU"
        );
        assert_eq!(
            cmd.element(tags::AFFECTED_SOP_CLASS_UID)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches('\0'),
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE
        );
    }

    #[test]
    fn series_identifier_names_both_uids() {
        let criteria =
            SearchCriteria::series("PAT1", "T2map").retrieval_for("1.2.3".into(), "1.2.3.4".into());
        let identifier = build_move_identifier(&criteria);
        assert_eq!(
            identifier
                .element(tags::STUDY_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3"
        );
        assert_eq!(
            identifier
                .element(tags::SERIES_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            "1.2.3.4"
        );
    }

    #[test]
    fn clean_finish_with_failures_is_not_a_success() {
        let summary = MoveSummary {
            status: 0x0000,
            completed: 10,
            failed: 2,
            warnings: 0,
        };
        assert!(!summary.is_success());
        assert!(MoveSummary {
            status: 0x0000,
            completed: 10,
            failed: 0,
            warnings: 0
        }
        .is_success());
    }
}
