//! Association establishment and PDU exchange over TCP.
//!
//! The association is split in two halves after the handshake:
//! a [`PduSender`] for outgoing messages
//! and a [`PduReceiver`] for the inbound dispatcher.
use std::io::Write;
use std::net::{Shutdown, TcpStream};

use dicom_ul::pdu::reader::{read_pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE};
use dicom_ul::pdu::writer::write_pdu;
use dicom_ul::pdu::{
    AbortRQSource, AssociationAC, AssociationRJ, AssociationRQ, PDataValue, PDataValueType, Pdu,
    PresentationContextProposed, PresentationContextResultReason, UserVariableItem,
};
use dicom_ul::{AeAddr, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

/// The identifier of the single presentation context proposed.
pub const PRESENTATION_CONTEXT_ID: u8 = 1;

const PROTOCOL_VERSION: u16 = 1;
const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";
/// PDU type, reserved byte and PDU length
const PDU_HEADER_SIZE: usize = 6;
/// PDV item length, presentation context ID and message control header
const PDV_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not connect to the remote node
    Connect { source: std::io::Error },

    /// could not duplicate the connection handle
    CloneStream { source: std::io::Error },

    /// failed to send association request
    SendRequest { source: dicom_ul::pdu::writer::Error },

    /// failed to receive association response
    ReceiveResponse { source: dicom_ul::pdu::reader::Error },

    #[snafu(display("unexpected response from peer `{}`", pdu.short_description()))]
    UnexpectedResponse { pdu: Box<Pdu> },

    #[snafu(display("protocol version mismatch: expected {}, got {}", expected, got))]
    ProtocolVersionMismatch { expected: u16, got: u16 },

    #[snafu(display("association rejected by the peer: {}", association_rj.source))]
    Rejected { association_rj: AssociationRJ },

    /// failed to encode PDU message
    Send { source: dicom_ul::pdu::writer::Error },

    /// failed to send PDU message on wire
    WireSend { source: std::io::Error },

    #[snafu(display(
        "PDU is too large ({} bytes) to be sent to the remote application entity",
        length
    ))]
    SendTooLongPdu { length: usize },

    #[snafu(display(
        "maximum PDU length admitted by the peer ({} bytes) cannot hold any P-DATA value",
        max_pdu_length
    ))]
    AcceptorMaxPduTooSmall { max_pdu_length: u32 },

    /// failed to receive PDU message
    Receive { source: dicom_ul::pdu::reader::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The A-ASSOCIATE-RQ descriptor of a retrieve session,
/// built once before the association is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRequest {
    calling_ae_title: String,
    called_ae_title: String,
    presentation_context: PresentationContextProposed,
    extended_negotiation: Option<Vec<u8>>,
    max_pdu_length: u32,
}

impl AssociationRequest {
    pub fn new(
        calling_ae_title: impl Into<String>,
        called_ae_title: impl Into<String>,
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
        extended_negotiation: Option<Vec<u8>>,
        max_pdu_length: u32,
    ) -> Self {
        AssociationRequest {
            calling_ae_title: calling_ae_title.into(),
            called_ae_title: called_ae_title.into(),
            presentation_context: PresentationContextProposed {
                id: PRESENTATION_CONTEXT_ID,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
            },
            extended_negotiation,
            max_pdu_length,
        }
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// The one presentation context proposed.
    pub fn presentation_context(&self) -> &PresentationContextProposed {
        &self.presentation_context
    }

    /// The service class application information
    /// of the SOP class extended negotiation sub-item,
    /// if one is to be sent.
    pub fn extended_negotiation(&self) -> Option<&[u8]> {
        self.extended_negotiation.as_deref()
    }

    /// The maximum PDU length this node admits.
    pub fn max_pdu_length(&self) -> u32 {
        self.max_pdu_length
    }

    /// Build the A-ASSOCIATE-RQ PDU.
    pub fn to_pdu(&self) -> Pdu {
        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some(info) = &self.extended_negotiation {
            user_variables.push(UserVariableItem::SopClassExtendedNegotiationSubItem(
                self.presentation_context.abstract_syntax.clone(),
                info.clone(),
            ));
        }

        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: PROTOCOL_VERSION,
            calling_ae_title: self.calling_ae_title.clone(),
            called_ae_title: self.called_ae_title.clone(),
            application_context_name: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: vec![self.presentation_context.clone()],
            user_variables,
        })
    }
}

/// The outcome of a successful association handshake.
#[derive(Debug)]
pub struct Established {
    pub sender: PduSender,
    pub receiver: PduReceiver,
    /// The transfer syntax accepted for the presentation context,
    /// or `None` if the peer did not accept it.
    pub transfer_syntax: Option<String>,
}

/// Connect to the peer and negotiate the association.
///
/// Only one attempt is made.
/// If the peer replies with anything other than
/// an acceptance or a rejection,
/// the connection is aborted.
pub fn establish(
    request: &AssociationRequest,
    address: &AeAddr<String>,
    strict: bool,
) -> Result<Established> {
    let mut socket = TcpStream::connect(address).context(ConnectSnafu)?;
    let mut buffer: Vec<u8> = Vec::with_capacity(request.max_pdu_length as usize);

    write_pdu(&mut buffer, &request.to_pdu()).context(SendRequestSnafu)?;
    socket.write_all(&buffer).context(WireSendSnafu)?;

    let msg = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, strict).context(ReceiveResponseSnafu)?;

    match msg {
        Pdu::AssociationAC(AssociationAC {
            protocol_version,
            presentation_contexts,
            user_variables,
            ..
        }) => {
            ensure!(
                protocol_version == PROTOCOL_VERSION,
                ProtocolVersionMismatchSnafu {
                    expected: PROTOCOL_VERSION,
                    got: protocol_version,
                }
            );

            let acceptor_max_pdu_length = match user_variables.iter().find_map(|item| match item {
                UserVariableItem::MaxLength(len) => Some(*len),
                _ => None,
            }) {
                // 0 stands for no limit
                Some(0) => MAXIMUM_PDU_SIZE,
                Some(len) => len,
                None => DEFAULT_MAX_PDU,
            };
            if acceptor_max_pdu_length <= PDV_HEADER_SIZE {
                warn!(
                    "Peer admits PDUs of at most {} bytes, no data can be sent",
                    acceptor_max_pdu_length
                );
            }

            let transfer_syntax = presentation_contexts
                .into_iter()
                .find(|pc| {
                    pc.id == PRESENTATION_CONTEXT_ID
                        && pc.reason == PresentationContextResultReason::Acceptance
                })
                .map(|pc| pc.transfer_syntax.trim_end_matches('\0').to_string());

            match &transfer_syntax {
                Some(ts) => debug!("Presentation context accepted with transfer syntax {}", ts),
                None => warn!("Presentation context was not accepted by the peer"),
            }

            let receiver = PduReceiver {
                socket: socket.try_clone().context(CloneStreamSnafu)?,
                max_pdu_length: request.max_pdu_length,
                strict,
            };
            buffer.clear();
            Ok(Established {
                sender: PduSender {
                    socket,
                    buffer,
                    acceptor_max_pdu_length,
                },
                receiver,
                transfer_syntax,
            })
        }
        Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
        pdu => {
            buffer.clear();
            let _ = write_pdu(
                &mut buffer,
                &Pdu::AbortRQ {
                    source: AbortRQSource::ServiceUser,
                },
            );
            let _ = socket.write_all(&buffer);
            let _ = socket.shutdown(Shutdown::Both);
            UnexpectedResponseSnafu { pdu }.fail()
        }
    }
}

/// The sending half of an established association.
#[derive(Debug)]
pub struct PduSender {
    socket: TcpStream,
    /// assembles each PDU before sending it on wire
    buffer: Vec<u8>,
    acceptor_max_pdu_length: u32,
}

impl PduSender {
    /// The maximum PDU length admitted by the peer.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Send a PDU message to the peer.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        self.buffer.clear();
        write_pdu(&mut self.buffer, msg).context(SendSnafu)?;
        let length = self.buffer.len() - PDU_HEADER_SIZE;
        ensure!(
            length <= self.acceptor_max_pdu_length as usize,
            SendTooLongPduSnafu { length }
        );
        self.socket.write_all(&self.buffer).context(WireSendSnafu)
    }

    /// Send a full command or data set as a sequence of P-DATA-TF PDUs,
    /// fragmenting it to fit the peer's maximum PDU length.
    pub fn send_pdata(&mut self, value_type: PDataValueType, data: &[u8]) -> Result<()> {
        let max_data_len = self
            .acceptor_max_pdu_length
            .checked_sub(PDV_HEADER_SIZE)
            .filter(|len| *len > 0)
            .context(AcceptorMaxPduTooSmallSnafu {
                max_pdu_length: self.acceptor_max_pdu_length,
            })? as usize;
        let mut chunks = data.chunks(max_data_len).peekable();
        if chunks.peek().is_none() {
            return self.send_pdv(value_type.clone(), true, Vec::new());
        }
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.send_pdv(value_type.clone(), is_last, chunk.to_vec())?;
        }
        Ok(())
    }

    fn send_pdv(&mut self, value_type: PDataValueType, is_last: bool, data: Vec<u8>) -> Result<()> {
        self.send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: PRESENTATION_CONTEXT_ID,
                value_type,
                is_last,
                data,
            }],
        })
    }

    /// Send an A-ABORT and shut down the connection.
    pub fn abort(&mut self) -> Result<()> {
        let out = self.send(&Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        });
        self.shutdown();
        out
    }

    /// Shut down the connection in both directions,
    /// which also unblocks the receiving half.
    pub fn shutdown(&mut self) {
        let _ = self.socket.shutdown(Shutdown::Both);
    }
}

/// The receiving half of an established association.
#[derive(Debug)]
pub struct PduReceiver {
    socket: TcpStream,
    max_pdu_length: u32,
    strict: bool,
}

impl PduReceiver {
    /// Read the next PDU message from the peer.
    pub fn receive(&mut self) -> Result<Pdu> {
        read_pdu(&mut self.socket, self.max_pdu_length, self.strict).context(ReceiveSnafu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study_root_request(extneg: Option<Vec<u8>>) -> AssociationRequest {
        AssociationRequest::new(
            "MOVESCU",
            "ANY-SCP",
            "1.2.840.10008.5.1.4.1.2.2.2",
            &["1.2.840.10008.1.2", "1.2.840.10008.1.2.1"],
            extneg,
            16_384,
        )
    }

    #[test]
    fn request_pdu_without_extended_negotiation() {
        let request = study_root_request(None);
        let Pdu::AssociationRQ(rq) = request.to_pdu() else {
            panic!("expected association request");
        };
        assert_eq!(rq.calling_ae_title, "MOVESCU");
        assert_eq!(rq.called_ae_title, "ANY-SCP");
        assert_eq!(rq.presentation_contexts.len(), 1);
        assert_eq!(rq.presentation_contexts[0].id, 1);
        assert_eq!(rq.presentation_contexts[0].transfer_syntaxes.len(), 2);
        assert!(rq.user_variables.contains(&UserVariableItem::MaxLength(16_384)));
        assert!(!rq
            .user_variables
            .iter()
            .any(|item| matches!(item, UserVariableItem::SopClassExtendedNegotiationSubItem(..))));
    }

    fn sender_with_acceptor_max(acceptor_max_pdu_length: u32) -> (PduSender, TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let socket = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (peer, _) = listener.accept().unwrap();
        let sender = PduSender {
            socket,
            buffer: Vec::new(),
            acceptor_max_pdu_length,
        };
        (sender, peer)
    }

    #[test]
    fn send_pdata_rejects_tiny_acceptor_max_pdu() {
        for max in [0, 4, 6] {
            let (mut sender, _peer) = sender_with_acceptor_max(max);
            let out = sender.send_pdata(PDataValueType::Command, &[1, 2, 3]);
            assert!(
                matches!(out, Err(Error::AcceptorMaxPduTooSmall { max_pdu_length }) if max_pdu_length == max),
                "max PDU length {}: {:?}",
                max,
                out
            );
        }
    }

    #[test]
    fn send_pdata_fragments_to_acceptor_max_pdu() {
        use std::io::Read;

        // one byte of payload per P-DATA-TF
        let (mut sender, mut peer) = sender_with_acceptor_max(7);
        sender
            .send_pdata(PDataValueType::Data, &[1, 2, 3])
            .unwrap();
        sender.shutdown();

        let mut wire = Vec::new();
        peer.read_to_end(&mut wire).unwrap();
        // 6 bytes PDU header, 6 bytes PDV header, 1 byte of data
        assert_eq!(wire.len(), 3 * 13);
        assert_eq!(wire[12], 1);
        assert_eq!(wire[25], 2);
        assert_eq!(wire[38], 3);
        // only the last fragment is flagged as such
        assert_eq!(wire[11] & 0x02, 0);
        assert_eq!(wire[37] & 0x02, 0x02);
    }

    #[test]
    fn request_pdu_with_extended_negotiation() {
        let request = study_root_request(Some(vec![1]));
        assert_eq!(request.extended_negotiation(), Some(&[1_u8][..]));
        let Pdu::AssociationRQ(rq) = request.to_pdu() else {
            panic!("expected association request");
        };
        assert!(rq
            .user_variables
            .contains(&UserVariableItem::SopClassExtendedNegotiationSubItem(
                "1.2.840.10008.5.1.4.1.2.2.2".to_string(),
                vec![1],
            )));
    }
}
