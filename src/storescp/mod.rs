//! DICOM C-STORE SCP listener.
//!
//! The listener is the receiving half of a C-MOVE: the archive opens
//! associations back to us and pushes instances, which are staged into the
//! transit tree by an [`InstanceSink`]. It answers C-ECHO as well, so the
//! archive can verify the destination before committing to a transfer.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use snafu::{Report, ResultExt, Whatever};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{InMemDicomObject, StandardDataDictionary};

mod sink;
mod store_async;
mod transfer;

pub use sink::InstanceSink;
use store_async::run_store_async;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct StoreScp {
    /// AE title this listener answers to. Must match the C-MOVE
    /// destination announced to the archive.
    pub ae_title: String,
    /// Enforce the negotiated maximum PDU length.
    pub strict: bool,
    /// Only accept uncompressed transfer syntaxes.
    pub uncompressed_only: bool,
    pub max_pdu_length: u32,
    /// Port to listen on; 0 picks a free one.
    pub port: u16,
    pub verbose: bool,
}

impl StoreScp {
    pub fn new(ae_title: impl Into<String>, port: u16) -> Self {
        StoreScp {
            ae_title: ae_title.into(),
            strict: false,
            uncompressed_only: false,
            max_pdu_length: 16384,
            port,
            verbose: false,
        }
    }

    /// Bind the listener and start accepting associations in the
    /// background. The socket is bound before this returns, so a retrieval
    /// issued afterwards will always find the destination up.
    pub async fn listen(self, sink: Arc<InstanceSink>) -> Result<StoreScpHandle, Whatever> {
        let listen_addr = SocketAddrV4::new(Ipv4Addr::from(0), self.port);
        let listener = tokio::net::TcpListener::bind(listen_addr)
            .await
            .whatever_context("could not bind store-scp listener")?;
        let local_addr = listener
            .local_addr()
            .whatever_context("could not read listener address")?;
        info!("{} listening on: tcp://{}", self.ae_title, local_addr);

        let shutdown = Arc::new(Notify::new());
        let accept_shutdown = Arc::clone(&shutdown);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.notified() => {
                        info!("Shutting down listener...");
                        break;
                    }
                    result = listener.accept() => {
                        let (socket, _addr) = match result {
                            Ok(accepted) => accepted,
                            Err(e) => {
                                error!("could not accept connection: {e}");
                                continue;
                            }
                        };
                        let args = self.clone();
                        let sink = Arc::clone(&sink);
                        let shutdown = Arc::clone(&accept_shutdown);
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.notified() => {
                                    info!("Shutting down connection task...");
                                }
                                result = run_store_async(socket, &args, sink) => {
                                    if let Err(e) = result {
                                        error!("{}", Report::from_error(e));
                                    }
                                }
                            }
                        });
                    }
                }
            }
        });

        Ok(StoreScpHandle {
            port: local_addr.port(),
            shutdown,
            task: Some(task),
        })
    }
}

/// Running listener. Dropping the handle tears the listener down, so it
/// can never outlive the retrieval that created it.
pub struct StoreScpHandle {
    port: u16,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl StoreScpHandle {
    /// The port actually bound, useful when the listener was asked for
    /// port 0.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop accepting associations and wait for the accept loop to wind
    /// down.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for StoreScpHandle {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) fn create_cstore_response(
    message_id: u16,
    sop_class_uid: &str,
    sop_instance_uid: &str,
    status: u16,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

pub(crate) fn create_cecho_response(message_id: u16) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8030])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [0x0000])),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstore_response_carries_the_given_status() {
        let obj = create_cstore_response(7, "1.2.840.10008.5.1.4.1.1.7", "1.2.3.4", 0xA700);
        assert_eq!(
            obj.element(tags::COMMAND_FIELD).unwrap().uint16().unwrap(),
            0x8001
        );
        assert_eq!(
            obj.element(tags::MESSAGE_ID_BEING_RESPONDED_TO)
                .unwrap()
                .uint16()
                .unwrap(),
            7
        );
        assert_eq!(
            obj.element(tags::STATUS).unwrap().uint16().unwrap(),
            0xA700
        );
    }

    #[tokio::test]
    async fn listener_binds_before_returning_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(InstanceSink::new(dir.path()));

        let handle = StoreScp::new("TEST-SCP", 0).listen(sink).await.unwrap();
        let port = handle.port();
        assert_ne!(port, 0);

        // the socket is already accepting connections
        let probe = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
        assert!(probe.is_ok());

        handle.shutdown().await;
        // once down, new connections are refused
        let probe = tokio::net::TcpStream::connect(("127.0.0.1", port)).await;
        assert!(probe.is_err());
    }
}
