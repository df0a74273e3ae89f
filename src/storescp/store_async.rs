//! Association handling for the C-STORE listener.

use std::sync::Arc;

use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::{
    association::ServerAssociation,
    pdu::{PDataValueType, PresentationContextResultReason},
    Pdu,
};
use snafu::{OptionExt, Report, ResultExt, Whatever};
use tracing::{debug, info, warn};

use crate::storescp::{
    create_cecho_response, create_cstore_response, transfer::ABSTRACT_SYNTAXES, InstanceSink,
    StoreScp,
};

/// Serve one incoming association until the peer releases or aborts it.
///
/// Every successfully decoded instance is handed to the sink; a sink
/// failure is answered with an out-of-resources status and the association
/// stays up for the remaining instances.
pub async fn run_store_async(
    scu_stream: tokio::net::TcpStream,
    args: &StoreScp,
    sink: Arc<InstanceSink>,
) -> Result<(), Whatever> {
    let mut options = dicom_ul::association::ServerAssociationOptions::new()
        .accept_any()
        .ae_title(&args.ae_title)
        .strict(args.strict)
        .max_pdu_length(args.max_pdu_length);

    for uid in ABSTRACT_SYNTAXES {
        options = options.with_abstract_syntax(*uid);
    }
    if args.uncompressed_only {
        options = options
            .with_transfer_syntax("1.2.840.10008.1.2") // Implicit VR Little Endian
            .with_transfer_syntax("1.2.840.10008.1.2.1"); // Explicit VR Little Endian
    } else {
        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() {
                options = options.with_transfer_syntax(ts.uid());
            }
        }
    }

    let peer_addr = scu_stream.peer_addr().ok();
    let association = options
        .establish_async(scu_stream)
        .await
        .whatever_context("could not establish association")?;

    info!("New association from {}", association.client_ae_title());
    debug!(
        "#accepted_presentation_contexts={}, acceptor_max_pdu_length={}, requestor_max_pdu_length={}",
        association
            .presentation_contexts()
            .iter()
            .filter(|pc| pc.reason == PresentationContextResultReason::Acceptance)
            .count(),
        association.acceptor_max_pdu_length(),
        association.requestor_max_pdu_length(),
    );

    let peer_title = association.client_ae_title().to_string();
    inner(association, args.verbose, sink).await?;

    if let Some(peer_addr) = peer_addr {
        info!("Dropping connection with {} ({})", peer_title, peer_addr);
    } else {
        info!("Dropping connection with {}", peer_title);
    }

    Ok(())
}

async fn inner(
    mut association: ServerAssociation<tokio::net::TcpStream>,
    verbose: bool,
    sink: Arc<InstanceSink>,
) -> Result<(), Whatever> {
    let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
    let mut msgid = 1;
    let mut sop_class_uid = "".to_string();
    let mut sop_instance_uid = "".to_string();

    loop {
        match association.receive().await {
            Ok(mut pdu) => {
                if verbose {
                    debug!("scu ----> scp: {}", pdu.short_description());
                }
                match pdu {
                    Pdu::PData { ref mut data } => {
                        if data.is_empty() {
                            debug!("Ignoring empty PData PDU");
                            continue;
                        }

                        for data_value in data {
                            if data_value.value_type == PDataValueType::Data && !data_value.is_last
                            {
                                instance_buffer.append(&mut data_value.data);
                            } else if data_value.value_type == PDataValueType::Command
                                && data_value.is_last
                            {
                                // commands are always in implicit VR LE
                                let ts =
                                    dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                        .erased();
                                let data_value = &data_value;
                                let v = &data_value.data;

                                let obj = InMemDicomObject::read_dataset_with_ts(v.as_slice(), &ts)
                                    .whatever_context("failed to read incoming DICOM command")?;
                                let command_field = obj
                                    .element(tags::COMMAND_FIELD)
                                    .whatever_context("Missing Command Field")?
                                    .uint16()
                                    .whatever_context("Command Field is not an integer")?;

                                if command_field == 0x0030 {
                                    // C-ECHO-RQ
                                    let cecho_response = create_cecho_response(msgid);
                                    let mut cecho_data = Vec::new();

                                    cecho_response
                                        .write_dataset_with_ts(&mut cecho_data, &ts)
                                        .whatever_context(
                                            "could not write C-ECHO response object",
                                        )?;

                                    let pdu_response = Pdu::PData {
                                        data: vec![dicom_ul::pdu::PDataValue {
                                            presentation_context_id: data_value
                                                .presentation_context_id,
                                            value_type: PDataValueType::Command,
                                            is_last: true,
                                            data: cecho_data,
                                        }],
                                    };
                                    association.send(&pdu_response).await.whatever_context(
                                        "failed to send C-ECHO response object to SCU",
                                    )?;
                                } else {
                                    msgid = obj
                                        .element(tags::MESSAGE_ID)
                                        .whatever_context("Missing Message ID")?
                                        .to_int()
                                        .whatever_context("Message ID is not an integer")?;
                                    sop_class_uid = obj
                                        .element(tags::AFFECTED_SOP_CLASS_UID)
                                        .whatever_context("missing Affected SOP Class UID")?
                                        .to_str()
                                        .whatever_context(
                                            "could not retrieve Affected SOP Class UID",
                                        )?
                                        .to_string();
                                    sop_instance_uid = obj
                                        .element(tags::AFFECTED_SOP_INSTANCE_UID)
                                        .whatever_context("missing Affected SOP Instance UID")?
                                        .to_str()
                                        .whatever_context(
                                            "could not retrieve Affected SOP Instance UID",
                                        )?
                                        .to_string();
                                }
                                instance_buffer.clear();
                            } else if data_value.value_type == PDataValueType::Data
                                && data_value.is_last
                            {
                                instance_buffer.append(&mut data_value.data);

                                let presentation_context = association
                                    .presentation_contexts()
                                    .iter()
                                    .find(|pc| pc.id == data_value.presentation_context_id)
                                    .whatever_context("missing presentation context")?;
                                let ts = presentation_context.transfer_syntax.to_string();
                                let ts_entry = TransferSyntaxRegistry
                                    .get(&ts)
                                    .whatever_context("unsupported transfer syntax")?;

                                let status = match InMemDicomObject::read_dataset_with_ts(
                                    instance_buffer.as_slice(),
                                    ts_entry,
                                ) {
                                    Ok(obj) => match sink.ingest(obj, &ts).await {
                                        Ok(_) => 0x0000,
                                        Err(e) => {
                                            warn!(
                                                "could not stage instance: {}",
                                                Report::from_error(e)
                                            );
                                            // out of resources, keep the association up
                                            0xA700
                                        }
                                    },
                                    Err(e) => {
                                        warn!("failed to read DICOM data object: {e}");
                                        // cannot understand
                                        0xC000
                                    }
                                };

                                // send C-STORE-RSP object
                                // commands are always in implicit VR LE
                                let ts =
                                    dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN
                                        .erased();

                                let obj = create_cstore_response(
                                    msgid,
                                    &sop_class_uid,
                                    &sop_instance_uid,
                                    status,
                                );

                                let mut obj_data = Vec::new();

                                obj.write_dataset_with_ts(&mut obj_data, &ts)
                                    .whatever_context("could not write response object")?;

                                let pdu_response = Pdu::PData {
                                    data: vec![dicom_ul::pdu::PDataValue {
                                        presentation_context_id: data_value.presentation_context_id,
                                        value_type: PDataValueType::Command,
                                        is_last: true,
                                        data: obj_data,
                                    }],
                                };
                                association
                                    .send(&pdu_response)
                                    .await
                                    .whatever_context("failed to send response object to SCU")?;

                                instance_buffer.clear();
                            }
                        }
                    }
                    Pdu::ReleaseRQ => {
                        association.send(&Pdu::ReleaseRP).await.unwrap_or_else(|e| {
                            warn!(
                                "Failed to send association release message to SCU: {}",
                                snafu::Report::from_error(e)
                            );
                        });
                        info!("Released association with {}", association.client_ae_title());
                        break;
                    }
                    Pdu::AbortRQ { source } => {
                        warn!("Aborted connection from: {:?}", source);
                        break;
                    }
                    _ => {}
                }
            }
            Err(err @ dicom_ul::association::Error::ReceivePdu { .. }) => {
                if verbose {
                    info!("{}", Report::from_error(err));
                } else {
                    info!("{}", err);
                }
                break;
            }
            Err(err) => {
                warn!("Unexpected error: {}", Report::from_error(err));
                break;
            }
        }
    }

    Ok(())
}
