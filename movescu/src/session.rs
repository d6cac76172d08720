//! The retrieve association session.
//!
//! An [`AssociationSession`] owns the association request descriptor,
//! the live association once opened,
//! and the table correlating outstanding C-MOVE requests
//! with their response handlers.
//! Inbound messages are dispatched by a blocking task
//! on the executor of the session's [`Device`].
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_encoding::TransferSyntax;
use dicom_object::{open_file, InMemDicomObject};
use dicom_transfer_syntax_registry::{entries, TransferSyntaxRegistry};
use dicom_ul::pdu::{PDataValueType, Pdu};
use dicom_ul::AeAddr;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{move_req_command, MessageAssembler, MoveResponse};
use crate::extneg::NegotiationMask;
use crate::model::RetrieveModel;
use crate::options::RetrieveSettings;
use crate::transport::{self, AssociationRequest, PduReceiver, PduSender};

const DEFAULT_CALLED_AE_TITLE: &str = "ANY-SCP";

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// the association is already open
    AlreadyOpen,

    /// the session was closed and cannot be reopened
    SessionClosed,

    /// could not establish association
    Establish { source: transport::Error },

    /// the association is not ready for data transfer
    NotReady,

    /// no presentation context was accepted by the peer
    NoPresentationContext,

    /// no more message IDs available in this session
    MessageIdOverflow,

    /// could not encode C-MOVE command
    WriteCommand {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    /// could not encode C-MOVE identifier
    WriteIdentifier {
        #[snafu(source(from(dicom_object::WriteError, Box::new)))]
        source: Box<dicom_object::WriteError>,
    },

    /// could not send C-MOVE request
    SendRequest { source: transport::Error },

    #[snafu(display("could not read DICOM file {}", path.display()))]
    ReadFile {
        path: PathBuf,
        source: dicom_object::ReadError,
    },

    #[snafu(display("association failed: {}", reason))]
    AssociationFailed { reason: String },

    /// could not release association
    Release { source: transport::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Callback receiving every response of one retrieve operation,
/// in arrival order.
pub type ResponseHandler = Box<dyn FnMut(&MoveResponse) + Send>;

/// The execution facilities injected into a session:
/// an executor running the inbound dispatcher
/// and a scheduler whose timer drives the response timeout.
#[derive(Debug, Clone)]
pub struct Device {
    executor: Handle,
    scheduler: Handle,
}

impl Device {
    pub fn new(executor: Handle, scheduler: Handle) -> Self {
        Device {
            executor,
            scheduler,
        }
    }

    /// Use the same runtime for dispatching and scheduling.
    pub fn from_handle(handle: Handle) -> Self {
        Device::new(handle.clone(), handle)
    }
}

/// The SOP class extended negotiation payload to request, if any.
///
/// The item is only sent when the requested capabilities
/// go beyond those implied by the model.
pub fn extended_negotiation(model: RetrieveModel, requested: NegotiationMask) -> Option<Vec<u8>> {
    let default = model.default_negotiation();
    (requested > default).then(|| (requested | default).to_info())
}

#[derive(Default)]
struct Correlation {
    handlers: HashMap<u16, ResponseHandler>,
    failure: Option<String>,
    /// operations which lost their final response to a failure
    dropped: usize,
    closing: bool,
    released: bool,
    last_activity: Option<Instant>,
}

impl Correlation {
    /// Whether something is expected from the peer.
    fn awaiting(&self) -> bool {
        !self.handlers.is_empty() || (self.closing && !self.released)
    }
}

#[derive(Default)]
struct Shared {
    table: Mutex<Correlation>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Correlation> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_while<F>(&self, condition: F) -> MutexGuard<'_, Correlation>
    where
        F: FnMut(&mut Correlation) -> bool,
    {
        self.changed
            .wait_while(self.lock(), condition)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.lock().last_activity = Some(Instant::now());
    }

    /// Record a fatal association failure.
    /// Outstanding operations will not receive any more responses.
    fn fail(&self, reason: String) {
        let mut table = self.lock();
        if !table.handlers.is_empty() {
            warn!(
                "{} retrieve operation(s) left without a final response",
                table.handlers.len()
            );
            table.dropped += table.handlers.len();
            table.handlers.clear();
        }
        table.failure.get_or_insert(reason);
        self.changed.notify_all();
    }

    fn deliver(&self, rsp: MoveResponse) {
        let mut table = self.lock();
        let message_id = rsp.message_id();
        let Some(handler) = table.handlers.get_mut(&message_id) else {
            warn!("Ignoring response to unknown message ID {}", message_id);
            return;
        };
        handler(&rsp);
        if rsp.is_final() {
            table.handlers.remove(&message_id);
            self.changed.notify_all();
        }
    }

    fn set_released(&self) {
        self.lock().released = true;
        self.changed.notify_all();
    }
}

fn lock_sender(sender: &Mutex<PduSender>) -> MutexGuard<'_, PduSender> {
    sender.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Active {
    sender: Arc<Mutex<PduSender>>,
    transfer_syntax: Option<&'static TransferSyntax>,
    watchdog: Option<JoinHandle<()>>,
}

enum State {
    Idle,
    Open(Active),
    Closed,
}

/// A C-MOVE association session with a single retrieve SCP.
///
/// The session is opened once,
/// may issue any number of retrieve operations,
/// and is closed once.
/// Reopening a closed session is not supported.
pub struct AssociationSession {
    device: Device,
    settings: RetrieveSettings,
    address: AeAddr<String>,
    request: AssociationRequest,
    shared: Arc<Shared>,
    next_message_id: u16,
    state: State,
}

impl std::fmt::Debug for AssociationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssociationSession")
            .field("address", &self.address)
            .field("request", &self.request)
            .field("next_message_id", &self.next_message_id)
            .finish_non_exhaustive()
    }
}

impl AssociationSession {
    /// Prepare a session,
    /// building its association request.
    pub fn new(device: Device, settings: RetrieveSettings) -> Self {
        let address: AeAddr<String> = settings
            .remote
            .parse()
            .unwrap_or_else(|e: Infallible| match e {});

        let called_ae_title = match (&settings.called_ae_title, address.ae_title()) {
            (Some(aec), Some(_)) => {
                warn!("Option `called_ae_title` overrides the AE title to `{}`", aec);
                aec.as_str()
            }
            (Some(aec), None) => aec.as_str(),
            (None, Some(aec)) => aec,
            (None, None) => DEFAULT_CALLED_AE_TITLE,
        };

        let request = AssociationRequest::new(
            settings.calling_ae_title.as_str(),
            called_ae_title,
            settings.model.sop_class_uid(),
            settings.transfer_syntax.transfer_syntaxes(),
            extended_negotiation(settings.model, settings.negotiation),
            settings.max_pdu_length,
        );

        AssociationSession {
            device,
            settings,
            address,
            request,
            shared: Arc::default(),
            next_message_id: 1,
            state: State::Idle,
        }
    }

    /// The association request descriptor.
    pub fn request(&self) -> &AssociationRequest {
        &self.request
    }

    pub fn settings(&self) -> &RetrieveSettings {
        &self.settings
    }

    /// Whether the association is established
    /// and has not failed.
    pub fn is_ready_for_data_transfer(&self) -> bool {
        matches!(self.state, State::Open(_)) && self.shared.lock().failure.is_none()
    }

    /// Whether the peer accepted the proposed presentation context.
    pub fn has_accepted_context(&self) -> bool {
        matches!(&self.state, State::Open(Active { transfer_syntax: Some(_), .. }))
    }

    /// Establish the association
    /// and start dispatching inbound messages.
    pub fn open(&mut self) -> Result<()> {
        match self.state {
            State::Idle => {}
            State::Open(_) => return AlreadyOpenSnafu.fail(),
            State::Closed => return SessionClosedSnafu.fail(),
        }

        info!("Establishing association with '{}'...", self.address);
        let transport::Established {
            sender,
            receiver,
            transfer_syntax,
        } = transport::establish(&self.request, &self.address, self.settings.strict)
            .context(EstablishSnafu)?;
        info!("Association established");

        let registry: &'static TransferSyntaxRegistry = &TransferSyntaxRegistry;
        let transfer_syntax = transfer_syntax.and_then(|uid| {
            let ts = registry.get(&uid);
            if ts.is_none() {
                warn!("Negotiated transfer syntax {} is not supported", uid);
            }
            ts
        });
        if let Some(ts) = transfer_syntax {
            debug!("Transfer Syntax: {}", ts.name());
        }

        let sender = Arc::new(Mutex::new(sender));
        self.shared.touch();

        {
            let shared = Arc::clone(&self.shared);
            let sender = Arc::clone(&sender);
            // the task is detached, it ends when the connection does
            let _ = self
                .device
                .executor
                .spawn_blocking(move || dispatch(receiver, transfer_syntax, &shared, &sender));
        }

        let watchdog = self.settings.rsp_timeout.map(|timeout| {
            self.device.scheduler.spawn(watch_responses(
                timeout,
                Arc::clone(&self.shared),
                Arc::clone(&sender),
            ))
        });

        self.state = State::Open(Active {
            sender,
            transfer_syntax,
            watchdog,
        });
        Ok(())
    }

    /// Issue a C-MOVE request with the given identifier.
    ///
    /// At most one operation is outstanding per session:
    /// if a previous request has not received its final response yet,
    /// this blocks until it does.
    /// The handler is called for every response to this request,
    /// the last one being the final response.
    /// Returns the message ID of the request
    /// once it was transmitted.
    pub fn retrieve<F>(&mut self, identifier: &InMemDicomObject, handler: F) -> Result<u16>
    where
        F: FnMut(&MoveResponse) + Send + 'static,
    {
        let State::Open(active) = &self.state else {
            return NotReadySnafu.fail();
        };
        let ts = active.transfer_syntax.context(NoPresentationContextSnafu)?;

        let failure = {
            let table = self
                .shared
                .wait_while(|t| !t.handlers.is_empty() && t.failure.is_none());
            table.failure.clone()
        };
        if let Some(reason) = failure {
            return AssociationFailedSnafu { reason }.fail();
        }

        // 0 marks an exhausted counter
        ensure!(self.next_message_id != 0, MessageIdOverflowSnafu);
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let cmd = move_req_command(
            self.settings.model.sop_class_uid(),
            &self.settings.destination,
            message_id,
            self.settings.priority,
        );
        let mut cmd_data = Vec::with_capacity(128);
        cmd.write_dataset_with_ts(&mut cmd_data, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .context(WriteCommandSnafu)?;
        let mut iod_data = Vec::with_capacity(128);
        identifier
            .write_dataset_with_ts(&mut iod_data, ts)
            .context(WriteIdentifierSnafu)?;

        {
            let mut table = self.shared.lock();
            table.handlers.insert(message_id, Box::new(handler));
            table.last_activity = Some(Instant::now());
        }

        debug!(
            "Sending C-MOVE request #{} ({} B)...",
            message_id,
            cmd_data.len() + iod_data.len()
        );
        let sent = {
            let mut sender = lock_sender(&active.sender);
            sender
                .send_pdata(PDataValueType::Command, &cmd_data)
                .and_then(|_| sender.send_pdata(PDataValueType::Data, &iod_data))
        };
        if let Err(e) = sent {
            self.shared.lock().handlers.remove(&message_id);
            return Err(e).context(SendRequestSnafu);
        }

        Ok(message_id)
    }

    /// Retrieve with the configured matching keys only.
    pub fn retrieve_keys<F>(&mut self, handler: F) -> Result<u16>
    where
        F: FnMut(&MoveResponse) + Send + 'static,
    {
        let identifier = self.settings.keys.to_identifier();
        self.retrieve(&identifier, handler)
    }

    /// Retrieve with the data set of a DICOM file as base identifier,
    /// overridden by the configured matching keys.
    pub fn retrieve_file<P, F>(&mut self, path: P, handler: F) -> Result<u16>
    where
        P: AsRef<Path>,
        F: FnMut(&MoveResponse) + Send + 'static,
    {
        let path = path.as_ref();
        debug!("Opening file '{}'...", path.display());
        let base = open_file(path)
            .context(ReadFileSnafu { path })?
            .into_inner();
        let identifier = self.settings.keys.overlay_on(base);
        self.retrieve(&identifier, handler)
    }

    /// Wait for all outstanding operations to complete,
    /// then release the association.
    ///
    /// Does nothing if the session was never opened,
    /// or if the association already ended
    /// without leaving any operation unfinished.
    /// The connection is shut down even if an error is returned.
    pub fn close(&mut self) -> Result<()> {
        let active = match std::mem::replace(&mut self.state, State::Closed) {
            State::Open(active) => active,
            State::Idle => {
                self.state = State::Idle;
                return Ok(());
            }
            State::Closed => return Ok(()),
        };

        let (failure, dropped) = {
            let table = self.shared.wait_while(|t| !t.handlers.is_empty() && t.failure.is_none());
            (table.failure.clone(), table.dropped)
        };

        let out = match failure {
            Some(reason) if dropped > 0 => AssociationFailedSnafu { reason }.fail(),
            Some(reason) => {
                debug!("Association already ended ({}), nothing to release", reason);
                Ok(())
            }
            None => self.release(&active.sender),
        };

        if let Some(watchdog) = active.watchdog {
            watchdog.abort();
        }
        lock_sender(&active.sender).shutdown();
        out
    }

    fn release(&self, sender: &Mutex<PduSender>) -> Result<()> {
        {
            let mut table = self.shared.lock();
            table.closing = true;
            table.last_activity = Some(Instant::now());
        }
        debug!("Releasing association");
        lock_sender(sender)
            .send(&Pdu::ReleaseRQ)
            .context(ReleaseSnafu)?;

        let table = self.shared.wait_while(|t| !t.released && t.failure.is_none());
        if let Some(reason) = &table.failure {
            return AssociationFailedSnafu {
                reason: reason.clone(),
            }
            .fail();
        }
        info!("Association released");
        Ok(())
    }
}

/// Abort the association if it was not closed.
impl Drop for AssociationSession {
    fn drop(&mut self) {
        if let State::Open(active) = std::mem::replace(&mut self.state, State::Closed) {
            if let Some(watchdog) = active.watchdog {
                watchdog.abort();
            }
            let _ = lock_sender(&active.sender).abort();
        }
    }
}

/// Send an A-ABORT and record the failure.
///
/// The sender stays locked until the abort is written.
fn abort_with(shared: &Shared, sender: &Mutex<PduSender>, reason: String) {
    let mut sender = lock_sender(sender);
    shared.fail(reason);
    if let Err(e) = sender.abort() {
        debug!("Could not send A-ABORT: {}", snafu::Report::from_error(&e));
    }
}

/// Receive and route inbound messages until the association ends.
fn dispatch(
    mut receiver: PduReceiver,
    ts: Option<&'static TransferSyntax>,
    shared: &Shared,
    sender: &Mutex<PduSender>,
) {
    let mut assembler = MessageAssembler::new(ts);
    loop {
        let pdu = match receiver.receive() {
            Ok(pdu) => pdu,
            Err(e) => {
                let table = shared.lock();
                let quiet = table.closing || table.failure.is_some();
                drop(table);
                if quiet {
                    debug!("Connection ended: {}", snafu::Report::from_error(&e));
                } else {
                    error!("Failed to receive message: {}", snafu::Report::from_error(&e));
                }
                shared.fail(format!("could not receive message: {}", e));
                return;
            }
        };
        shared.touch();

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    match assembler.push(pdv) {
                        Ok(Some(rsp)) => {
                            debug!(
                                "Response to #{}: status {:04X}H",
                                rsp.message_id(),
                                rsp.status_code()
                            );
                            shared.deliver(rsp);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!("Invalid response: {}", snafu::Report::from_error(&e));
                            abort_with(shared, sender, format!("invalid response: {}", e));
                            return;
                        }
                    }
                }
            }
            Pdu::ReleaseRP => {
                shared.set_released();
                return;
            }
            Pdu::AbortRQ { source } => {
                warn!("Association aborted by peer: {:?}", source);
                shared.fail(format!("aborted by peer ({:?})", source));
                lock_sender(sender).shutdown();
                return;
            }
            pdu => {
                error!("Unexpected message from peer: {}", pdu.short_description());
                abort_with(
                    shared,
                    sender,
                    format!("unexpected message {}", pdu.short_description()),
                );
                return;
            }
        }
    }
}

/// Abort the association when the peer does not respond in time.
async fn watch_responses(timeout: Duration, shared: Arc<Shared>, sender: Arc<Mutex<PduSender>>) {
    loop {
        let deadline = {
            let table = shared.lock();
            if table.failure.is_some() || table.released {
                return;
            }
            table
                .last_activity
                .filter(|_| table.awaiting())
                .map(|last| last + timeout)
        };

        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!(
                    "No response within {} ms, aborting association",
                    timeout.as_millis()
                );
                abort_with(
                    &shared,
                    &sender,
                    format!("no response received within {} ms", timeout.as_millis()),
                );
                return;
            }
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
            }
            None => tokio::time::sleep(timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RetrieveLevel;
    use crate::options::MoveScuOptions;

    #[test]
    fn extended_negotiation_only_beyond_model_default() {
        for model in RetrieveModel::ALL {
            let default = model.default_negotiation();
            assert_eq!(extended_negotiation(model, NegotiationMask::NONE), None);
            assert_eq!(extended_negotiation(model, default), None);

            let relational = extended_negotiation(model, NegotiationMask::RELATIONAL_RETRIEVE);
            if default == NegotiationMask::NONE {
                assert_eq!(relational, Some(vec![1]), "model {}", model);
            } else {
                assert_eq!(relational, None, "model {}", model);
            }
        }
    }

    #[test]
    fn extended_negotiation_merges_default() {
        assert_eq!(
            extended_negotiation(RetrieveModel::ColorPalette, NegotiationMask::from_bits(4)),
            Some(vec![1, 1, 1])
        );
    }

    #[test]
    fn session_request_descriptor() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let settings = MoveScuOptions::new()
            .remote("QR-SCP@127.0.0.1:11112")
            .model(RetrieveModel::StudyRoot)
            .level(RetrieveLevel::Study)
            .relational_retrieve(true)
            .destination("STORESCP")
            .validate()
            .unwrap();
        let mut session =
            AssociationSession::new(Device::from_handle(runtime.handle().clone()), settings);

        let request = session.request();
        assert_eq!(request.calling_ae_title(), "MOVESCU");
        assert_eq!(request.called_ae_title(), "QR-SCP");
        assert_eq!(request.extended_negotiation(), Some(&[1_u8][..]));
        assert_eq!(
            request.presentation_context().abstract_syntax,
            "1.2.840.10008.5.1.4.1.2.2.2"
        );

        assert!(!session.is_ready_for_data_transfer());
        assert!(matches!(
            session.retrieve_keys(|_| {}),
            Err(Error::NotReady)
        ));
        // closing a session never opened does nothing
        assert!(session.close().is_ok());
    }
}
