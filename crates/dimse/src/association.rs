//! Association lifecycle handling for outbound DIMSE operations
//!
//! One `Association` is bound to one peer and one DIMSE service. The
//! presentation contexts proposed during establishment depend on the service:
//! C-GET additionally offers the storage SOP classes so the peer can push
//! images back over the same association.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::thread::sleep;

use dicom_encoding::TransferSyntaxIndex;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::{ClientAssociation, ClientAssociationOptions, Pdu};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::commands::STORAGE_SOP_CLASSES;
use crate::config::{ConnectorConfig, ServerNode};
use crate::{DimseError, Result};

use dicom_dictionary_std::uids;

/// The DIMSE service an association is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DimseService {
    Find,
    Get,
    Move,
    Store,
}

impl std::fmt::Display for DimseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DimseService::Find => write!(f, "C-FIND"),
            DimseService::Get => write!(f, "C-GET"),
            DimseService::Move => write!(f, "C-MOVE"),
            DimseService::Store => write!(f, "C-STORE"),
        }
    }
}

/// Abstract syntaxes proposed for the given service, in proposal order.
/// Presentation context ids are assigned from the order of this list
/// (odd ids 1, 3, 5, ... per the standard).
fn proposed_abstract_syntaxes(service: DimseService) -> Vec<&'static str> {
    match service {
        DimseService::Find => vec![
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
        ],
        DimseService::Get => {
            let mut syntaxes = vec![
                uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
                uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_GET,
            ];
            // The peer acts as storage SCU towards us during C-GET
            syntaxes.extend_from_slice(STORAGE_SOP_CLASSES);
            syntaxes
        }
        DimseService::Move => vec![
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
            uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        ],
        DimseService::Store => STORAGE_SOP_CLASSES.to_vec(),
    }
}

/// An established association to a peer, wrapping the UL client with
/// message-level send/receive helpers.
pub(crate) struct Association {
    scu: ClientAssociation<TcpStream>,
    peer: String,
    proposed: Vec<&'static str>,
    // PDVs received but not yet consumed by a message read
    inbound: VecDeque<PDataValue>,
    max_pdu: u32,
}

impl Association {
    /// Associate with the peer for the given service.
    ///
    /// Establishment is retried `connection_retries` times with a fixed
    /// pause, as transient connection failures towards busy PACS are common.
    /// Exhausting the retries yields a retriable error so the task scheduler
    /// can requeue the whole operation.
    pub(crate) fn establish(
        config: &ConnectorConfig,
        node: &ServerNode,
        service: DimseService,
    ) -> Result<Self> {
        config.validate()?;
        node.validate()?;

        let proposed = proposed_abstract_syntaxes(service);

        let mut attempt = 0;
        loop {
            debug!("Opening {} association to {}", service, node);
            match Self::try_establish(config, node, &proposed) {
                Ok(assoc) => return Ok(assoc),
                Err(err) => {
                    if attempt < config.connection_retries {
                        attempt += 1;
                        warn!(
                            "Could not connect to {} (attempt {}): {}. Retrying in {} seconds.",
                            node,
                            attempt,
                            err,
                            config.retry_timeout_secs
                        );
                        sleep(config.retry_timeout());
                    } else {
                        return Err(err);
                    }
                }
            }
        }
    }

    fn try_establish(
        config: &ConnectorConfig,
        node: &ServerNode,
        proposed: &[&'static str],
    ) -> Result<Self> {
        let mut options = ClientAssociationOptions::new()
            .calling_ae_title(config.calling_aet.as_str())
            .called_ae_title(node.ae_title.as_str())
            .max_pdu_length(config.max_pdu)
            .read_timeout(config.dimse_timeout())
            .connection_timeout(config.connection_timeout());

        for uid in proposed {
            options = options.with_abstract_syntax(*uid);
        }

        let scu = options
            .establish_with(&node.address())
            .map_err(|e| DimseError::Association {
                peer: node.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            scu,
            peer: node.to_string(),
            proposed: proposed.to_vec(),
            inbound: VecDeque::new(),
            max_pdu: config.max_pdu,
        })
    }

    /// Find the accepted presentation context for an abstract syntax and
    /// return its id together with the negotiated transfer syntax UID.
    pub(crate) fn presentation_context(&self, abstract_syntax: &str) -> Option<(u8, String)> {
        let index = self.proposed.iter().position(|uid| *uid == abstract_syntax)?;
        // proposal order determines the context id
        let pc_id = (index as u8) * 2 + 1;
        self.scu
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| (pc.id, pc.transfer_syntax.to_string()))
    }

    /// Resolve the negotiated transfer syntax of a context id
    pub(crate) fn transfer_syntax_of(&self, pc_id: u8) -> Result<String> {
        self.scu
            .presentation_contexts()
            .iter()
            .find(|pc| pc.id == pc_id)
            .map(|pc| pc.transfer_syntax.to_string())
            .ok_or_else(|| {
                DimseError::protocol(format!("Unknown presentation context id {}", pc_id))
            })
    }

    /// Send a command set. Commands are always Implicit VR Little Endian.
    pub(crate) fn send_command(&mut self, pc_id: u8, command: &InMemDicomObject) -> Result<()> {
        let mut data = Vec::with_capacity(128);
        command
            .write_dataset_with_ts(&mut data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .map_err(|e| DimseError::protocol(format!("Failed to write command: {}", e)))?;
        self.send_pdvs(pc_id, PDataValueType::Command, data)
    }

    /// Send a data set encoded with the negotiated transfer syntax of the
    /// given presentation context.
    pub(crate) fn send_data(&mut self, pc_id: u8, dataset: &InMemDicomObject) -> Result<()> {
        let ts_uid = self.transfer_syntax_of(pc_id)?;
        let ts = TransferSyntaxRegistry
            .get(&ts_uid)
            .ok_or_else(|| DimseError::protocol(format!("Unknown transfer syntax {}", ts_uid)))?;
        let mut data = Vec::with_capacity(1024);
        dataset
            .write_dataset_with_ts(&mut data, ts)
            .map_err(|e| DimseError::protocol(format!("Failed to write data set: {}", e)))?;
        self.send_pdvs(pc_id, PDataValueType::Data, data)
    }

    fn send_pdvs(&mut self, pc_id: u8, value_type: PDataValueType, data: Vec<u8>) -> Result<()> {
        // leave headroom for the PDU and PDV headers
        let chunk_size = (self.max_pdu as usize).saturating_sub(128).max(1024);
        let total = data.len();
        let mut offset = 0;
        loop {
            let end = (offset + chunk_size).min(total);
            let is_last = end == total;
            let pdu = Pdu::PData {
                data: vec![PDataValue {
                    presentation_context_id: pc_id,
                    value_type: value_type.clone(),
                    is_last,
                    data: data[offset..end].to_vec(),
                }],
            };
            self.scu
                .send(&pdu)
                .map_err(|e| DimseError::protocol(format!("Failed to send PDU: {}", e)))?;
            if is_last {
                return Ok(());
            }
            offset = end;
        }
    }

    fn next_pdv(&mut self) -> Result<PDataValue> {
        if let Some(pdv) = self.inbound.pop_front() {
            return Ok(pdv);
        }

        let pdu = self.scu.receive().map_err(|e| {
            DimseError::protocol(format!(
                "Connection timed out, was aborted or received invalid response: {}",
                e
            ))
        })?;

        match pdu {
            Pdu::PData { data } => {
                self.inbound.extend(data);
                self.inbound
                    .pop_front()
                    .ok_or_else(|| DimseError::protocol("Received empty P-DATA PDU"))
            }
            Pdu::AbortRQ { source } => Err(DimseError::protocol(format!(
                "Peer {} aborted the association ({:?})",
                self.peer, source
            ))),
            other => Err(DimseError::protocol(format!(
                "Unexpected PDU from {}: {:?}",
                self.peer, other
            ))),
        }
    }

    /// Accumulate PDVs of one message fragment kind until `is_last`
    fn read_message(&mut self, expected: PDataValueType) -> Result<(u8, Vec<u8>)> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut pc_id = None;
        loop {
            let pdv = self.next_pdv()?;
            if pdv.value_type != expected {
                return Err(DimseError::protocol(format!(
                    "Expected {:?} fragment but received {:?}",
                    expected, pdv.value_type
                )));
            }
            if let Some(id) = pc_id {
                if id != pdv.presentation_context_id {
                    return Err(DimseError::protocol(
                        "Interleaved fragments of different presentation contexts",
                    ));
                }
            } else {
                pc_id = Some(pdv.presentation_context_id);
            }
            let is_last = pdv.is_last;
            buffer.extend(pdv.data);
            if is_last {
                // unwrap is fine, at least one PDV was consumed
                return Ok((pc_id.unwrap(), buffer));
            }
        }
    }

    /// Receive the next command set
    pub(crate) fn read_command(&mut self) -> Result<(u8, InMemDicomObject)> {
        let (pc_id, data) = self.read_message(PDataValueType::Command)?;
        let command = InMemDicomObject::read_dataset_with_ts(
            &data[..],
            &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
        )
        .map_err(|e| DimseError::protocol(format!("Could not read command set: {}", e)))?;
        Ok((pc_id, command))
    }

    /// Receive the next data set, decoded with the transfer syntax
    /// negotiated for its presentation context.
    pub(crate) fn read_data(&mut self) -> Result<(u8, InMemDicomObject)> {
        let (pc_id, data) = self.read_message(PDataValueType::Data)?;
        let ts_uid = self.transfer_syntax_of(pc_id)?;
        let ts = TransferSyntaxRegistry
            .get(&ts_uid)
            .ok_or_else(|| DimseError::protocol(format!("Unknown transfer syntax {}", ts_uid)))?;
        let dataset = InMemDicomObject::read_dataset_with_ts(&data[..], ts)
            .map_err(|e| DimseError::protocol(format!("Could not read data set: {}", e)))?;
        Ok((pc_id, dataset))
    }

    /// Graceful release. Safe to call once per association, errors are
    /// logged but not propagated since the operation already finished.
    pub(crate) fn release(self) {
        let peer = self.peer.clone();
        debug!("Releasing association to {}", peer);
        let mut scu = self.scu;
        if let Err(err) = scu.release() {
            warn!("Failed to release association to {}: {}", peer, err);
        }
    }

    /// Hard abort, used on every error path and on early termination
    pub(crate) fn abort(self) {
        let peer = self.peer.clone();
        debug!("Aborting association to {}", peer);
        let mut scu = self.scu;
        if let Err(err) = scu.abort() {
            debug!("Failed to abort association to {}: {}", peer, err);
        }
    }
}
