//! Concurrent DIMSE request/response exchange for a requesting node.
//!
//! A [`DimseClient`] owns an established association and splits it into
//! one reader thread and a serialized writer:
//! all outbound PDU writes go through a single lock,
//! so the fragments of one message never interleave
//! with another message's on the wire,
//! while inbound PDUs are read and reassembled sequentially
//! and routed to the outstanding request they answer.
//!
//! Each request registers a completion channel
//! in the outstanding-request table under its message ID;
//! responses are delivered by resolving that channel,
//! and a lost session (abort, timeout, protocol violation, closure)
//! resolves every remaining entry exactly once
//! with the corresponding [`SessionLost`] reason.
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::association::client::ClientAssociation;
use crate::association::{read_pdu_from_wire, Error as AssociationError};
use crate::pdu::{AbortRQSource, PDataValue, Pdu, PresentationContextResult};
use crate::service::ServiceRegistry;
use crate::transport::{SplitTransport, TransportControl, TransportOptions};

use super::command::{status, RequestCommand};
use super::{
    fragment_message, DimseMessage, DuplicateMessageIdSnafu, MessageAssembler,
    ReceiveTimeoutSnafu, Result, SessionLost, SessionLostSnafu, TransportSnafu,
    UnknownPresentationContextSnafu,
};

/// How often the reader thread wakes up
/// to check timers and termination.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The release timeout applied when none is configured.
const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// A response to an outstanding DIMSE request.
#[derive(Debug)]
pub struct DimseResponse {
    /// the presentation context the response arrived on
    pub presentation_context_id: u8,
    /// the decoded response command set
    pub command: super::CommandSet,
    /// the response data set, if the command declared one
    pub data: Option<Vec<u8>>,
    /// the status code of the response
    pub status: u16,
}

impl DimseResponse {
    /// Whether this response terminates its request.
    ///
    /// Multi-response services (C-FIND, C-GET, C-MOVE)
    /// emit any number of pending responses
    /// before the final one.
    pub fn is_final(&self) -> bool {
        !status::is_pending(self.status)
    }
}

type Completion = mpsc::Sender<std::result::Result<DimseResponse, SessionLost>>;

/// The responses expected for one outstanding request.
///
/// Obtained from [`DimseClient::send_request`].
/// For single-response services, call [`next`](Self::next) once;
/// for multi-response services, keep calling it
/// until a response with [`is_final`](DimseResponse::is_final) arrives.
#[must_use]
#[derive(Debug)]
pub struct PendingResponses {
    message_id: u16,
    rx: mpsc::Receiver<std::result::Result<DimseResponse, SessionLost>>,
}

impl PendingResponses {
    /// The message ID the responses are correlated with.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// Wait for the next response to this request.
    pub fn next(&self) -> Result<DimseResponse> {
        match self.rx.recv() {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => SessionLostSnafu { reason }.fail(),
            Err(mpsc::RecvError) => SessionLostSnafu {
                reason: SessionLost::Closed,
            }
            .fail(),
        }
    }

    /// Wait for the next response to this request,
    /// giving up after the given duration.
    pub fn next_timeout(&self, timeout: Duration) -> Result<DimseResponse> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => SessionLostSnafu { reason }.fail(),
            Err(mpsc::RecvTimeoutError::Disconnected) => SessionLostSnafu {
                reason: SessionLost::Closed,
            }
            .fail(),
            Err(mpsc::RecvTimeoutError::Timeout) => ReceiveTimeoutSnafu {
                message_id: self.message_id,
            }
            .fail(),
        }
    }
}

struct WriterHalf {
    stream: Box<dyn Write + Send>,
    buffer: Vec<u8>,
}

struct Shared {
    writer: Mutex<WriterHalf>,
    /// outstanding requests by message ID
    pending: Mutex<HashMap<u16, Completion>>,
    /// signal for a release in progress
    release: Mutex<Option<mpsc::Sender<()>>>,
    /// the reason the session ended, set exactly once
    terminated: Mutex<Option<SessionLost>>,
    control: TransportControl,
    presentation_contexts: Vec<PresentationContextResult>,
    calling_ae_title: String,
    called_ae_title: String,
    peer_max_pdu_length: u32,
    registry: Option<Arc<ServiceRegistry>>,
}

impl Shared {
    fn terminated_reason(&self) -> Option<SessionLost> {
        self.terminated.lock().ok().and_then(|guard| guard.clone())
    }

    /// Mark the session as lost,
    /// failing every outstanding request exactly once
    /// and unblocking any release in progress.
    fn terminate(&self, reason: SessionLost) {
        {
            let mut terminated = match self.terminated.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if terminated.is_some() {
                return;
            }
            *terminated = Some(reason.clone());
        }

        if let Ok(mut pending) = self.pending.lock() {
            for (_, completion) in pending.drain() {
                let _ = completion.send(Err(reason.clone()));
            }
        }
        if let Ok(mut release) = self.release.lock() {
            // dropping the sender wakes the waiter with the terminal reason
            release.take();
        }
        let _ = self.control.shutdown();
    }

    /// Serialize the given PDUs onto the wire, in order,
    /// under a single writer lock.
    fn write_pdus<'a>(&self, pdus: impl IntoIterator<Item = &'a Pdu>) -> Result<()> {
        let mut writer = match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let WriterHalf { stream, buffer } = &mut *writer;
        for pdu in pdus {
            crate::association::encode_pdu(buffer, pdu, self.peer_max_pdu_length)
                .context(super::SendSnafu)?;
            if let Err(e) = stream.write_all(buffer) {
                drop(writer);
                // an unusable transport is fatal to the association
                self.terminate(SessionLost::Closed);
                return Err(e).context(super::WireSnafu);
            }
        }
        Ok(())
    }

    /// Best-effort A-ABORT.
    fn write_abort_quietly(&self) {
        let _ = self.write_pdus(&[Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        }]);
    }
}

/// A concurrency-safe DIMSE exchange
/// over an established client association.
///
/// # Example
///
/// ```no_run
/// # use dicom_net::association::ClientAssociationOptions;
/// # use dicom_net::dimse::command::{status, CEchoRq};
/// # use dicom_net::dimse::DimseClient;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///     .with_abstract_syntax("1.2.840.10008.1.1")
///     .establish("10.0.0.100:104")?;
/// let client = DimseClient::new(association)?;
///
/// let context_id = client.presentation_contexts()[0].id;
/// let echo = CEchoRq { message_id: client.next_message_id() };
/// let responses = client.send_request(context_id, &echo, None)?;
/// assert_eq!(responses.next()?.status, status::SUCCESS);
///
/// client.release()?;
/// # Ok(())
/// # }
/// ```
pub struct DimseClient {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
    next_message_id: AtomicU16,
    release_timeout: Duration,
}

impl DimseClient {
    /// Take over an established association
    /// and start its reader thread.
    pub fn new<S>(association: ClientAssociation<S>) -> Result<Self>
    where
        S: SplitTransport,
    {
        Self::new_impl(association, None)
    }

    /// Take over an established association,
    /// routing inbound requests from the peer
    /// (such as C-STORE sub-operations of a C-GET)
    /// to the given service registry.
    pub fn with_registry<S>(
        association: ClientAssociation<S>,
        registry: Arc<ServiceRegistry>,
    ) -> Result<Self>
    where
        S: SplitTransport,
    {
        Self::new_impl(association, Some(registry))
    }

    fn new_impl<S>(
        mut association: ClientAssociation<S>,
        registry: Option<Arc<ServiceRegistry>>,
    ) -> Result<Self>
    where
        S: SplitTransport,
    {
        let presentation_contexts = association.presentation_contexts().to_vec();
        let peer_max_pdu_length = association.acceptor_max_pdu_length();
        let max_pdu_length = association.requestor_max_pdu_length();
        let strict = association.is_strict();
        let options: TransportOptions = association.transport_options().clone();
        let calling_ae_title = association.calling_ae_title().to_string();
        let called_ae_title = association.called_ae_title().to_string();
        let read_buffer = association.take_read_buffer();

        let (read_half, write_half, control) =
            association.detach().try_split().context(TransportSnafu)?;
        drop(association);

        // the reader polls in small slices so that
        // local timers and termination are honored promptly
        control
            .set_read_timeout(Some(POLL_INTERVAL))
            .context(TransportSnafu)?;

        let shared = Arc::new(Shared {
            writer: Mutex::new(WriterHalf {
                stream: Box::new(write_half),
                buffer: Vec::with_capacity(peer_max_pdu_length.min(1 << 20) as usize),
            }),
            pending: Mutex::new(HashMap::new()),
            release: Mutex::new(None),
            terminated: Mutex::new(None),
            control,
            presentation_contexts,
            calling_ae_title,
            called_ae_title,
            peer_max_pdu_length,
            registry,
        });

        let reader_shared = Arc::clone(&shared);
        let idle_timeout = options.read_timeout;
        let reader = std::thread::Builder::new()
            .name("dimse-reader".to_string())
            .spawn(move || {
                reader_loop(
                    Box::new(read_half),
                    read_buffer,
                    reader_shared,
                    max_pdu_length,
                    strict,
                    idle_timeout,
                )
            })
            .context(TransportSnafu)?;

        Ok(DimseClient {
            shared,
            reader: Some(reader),
            next_message_id: AtomicU16::new(1),
            release_timeout: options.release_timeout.unwrap_or(DEFAULT_RELEASE_TIMEOUT),
        })
    }

    /// The presentation contexts accepted for this association.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.shared.presentation_contexts
    }

    /// The AE title of this node.
    pub fn calling_ae_title(&self) -> &str {
        &self.shared.calling_ae_title
    }

    /// The AE title of the peer node.
    pub fn called_ae_title(&self) -> &str {
        &self.shared.called_ae_title
    }

    /// Allocate the next request message ID.
    ///
    /// Message IDs are unique among the currently outstanding
    /// requests of this association.
    pub fn next_message_id(&self) -> u16 {
        self.next_message_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send a DIMSE request over the given presentation context,
    /// registering a completion for its response(s).
    ///
    /// The command set and the data set (when given)
    /// are fragmented into presentation data values
    /// bounded by the peer's maximum PDU length,
    /// command fragments before data fragments,
    /// and written as one uninterrupted sequence of P-DATA-TF PDUs.
    pub fn send_request(
        &self,
        presentation_context_id: u8,
        request: &impl RequestCommand,
        data: Option<Vec<u8>>,
    ) -> Result<PendingResponses> {
        if let Some(reason) = self.shared.terminated_reason() {
            return SessionLostSnafu { reason }.fail();
        }
        snafu::ensure!(
            self.shared
                .presentation_contexts
                .iter()
                .any(|pc| pc.id == presentation_context_id),
            UnknownPresentationContextSnafu {
                id: presentation_context_id
            }
        );

        let message_id = request.message_id();
        let command = request.encode(data.is_some())?;

        let (tx, rx) = mpsc::channel();
        {
            let mut pending = match self.shared.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            snafu::ensure!(
                !pending.contains_key(&message_id),
                DuplicateMessageIdSnafu { message_id }
            );
            pending.insert(message_id, tx);
        }

        let pdus = fragment_message(
            presentation_context_id,
            command,
            data,
            self.shared.peer_max_pdu_length,
        );
        if let Err(e) = self.shared.write_pdus(pdus.iter()) {
            self.forget(message_id);
            return Err(e);
        }

        // the session may have been lost while the request went out;
        // in that case the completion must not linger unresolved
        if let Some(reason) = self.shared.terminated_reason() {
            self.forget(message_id);
            return SessionLostSnafu { reason }.fail();
        }

        Ok(PendingResponses { message_id, rx })
    }

    /// Drop the outstanding entry for the given message ID,
    /// if it is still registered.
    ///
    /// Subsequent responses with this message ID
    /// will be logged and discarded.
    pub fn forget(&self, message_id: u16) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&message_id);
        }
    }

    /// Gracefully release the association,
    /// waiting for the peer's release reply
    /// under the configured release timeout.
    ///
    /// Outstanding requests whose responses have not arrived
    /// by the time the release completes
    /// are resolved with a session-closed failure.
    pub fn release(mut self) -> Result<()> {
        if let Some(reason) = self.shared.terminated_reason() {
            self.join_reader();
            return match reason {
                SessionLost::Closed => Ok(()),
                reason => SessionLostSnafu { reason }.fail(),
            };
        }

        let (tx, rx) = mpsc::channel();
        if let Ok(mut release) = self.shared.release.lock() {
            *release = Some(tx);
        }
        self.shared.write_pdus(&[Pdu::ReleaseRQ])?;

        // the reader may have torn the session down
        // while the request went out
        if let Some(reason) = self.shared.terminated_reason() {
            self.join_reader();
            return match reason {
                SessionLost::Closed => Ok(()),
                reason => SessionLostSnafu { reason }.fail(),
            };
        }

        let out = match rx.recv_timeout(self.release_timeout) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // the reader terminated the session first
                match self.shared.terminated_reason() {
                    None | Some(SessionLost::Closed) => Ok(()),
                    Some(reason) => SessionLostSnafu { reason }.fail(),
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.shared.write_abort_quietly();
                self.shared.terminate(SessionLost::TimedOut);
                SessionLostSnafu {
                    reason: SessionLost::TimedOut,
                }
                .fail()
            }
        };
        self.join_reader();
        out
    }

    /// Abort the association immediately,
    /// discarding any in-flight messages.
    ///
    /// Every outstanding request is resolved
    /// with a connection-aborted failure.
    pub fn abort(mut self) {
        self.shared.write_abort_quietly();
        self.shared
            .terminate(SessionLost::Aborted(AbortRQSource::ServiceUser));
        self.join_reader();
    }

    fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DimseClient {
    fn drop(&mut self) {
        if self.shared.terminated_reason().is_none() {
            self.shared.write_abort_quietly();
            self.shared.terminate(SessionLost::Closed);
        }
        self.join_reader();
    }
}

/// The per-association reader loop:
/// reads PDUs sequentially, reassembles messages,
/// and resolves the outstanding requests they answer.
fn reader_loop(
    mut stream: Box<dyn Read + Send>,
    mut read_buffer: BytesMut,
    shared: Arc<Shared>,
    max_pdu_length: u32,
    strict: bool,
    idle_timeout: Option<Duration>,
) {
    let mut assembler = MessageAssembler::new();
    let mut last_traffic = Instant::now();

    loop {
        if shared.terminated_reason().is_some() {
            return;
        }

        match read_pdu_from_wire(&mut stream, &mut read_buffer, max_pdu_length, strict) {
            Ok(pdu) => {
                last_traffic = Instant::now();
                if !handle_pdu(&shared, pdu, &mut assembler) {
                    return;
                }
            }
            Err(AssociationError::Timeout { .. }) => {
                // poll tick: fire the idle timer only while
                // responses are actually being waited for
                let waiting = shared
                    .pending
                    .lock()
                    .map(|pending| !pending.is_empty())
                    .unwrap_or(false);
                if let Some(idle) = idle_timeout {
                    if waiting && last_traffic.elapsed() >= idle {
                        shared.write_abort_quietly();
                        shared.terminate(SessionLost::TimedOut);
                        return;
                    }
                }
            }
            Err(AssociationError::ConnectionClosed { .. }) => {
                shared.terminate(SessionLost::Closed);
                return;
            }
            Err(e) => {
                debug!("Aborting association on receive error: {}", e);
                shared.write_abort_quietly();
                shared.terminate(SessionLost::ProtocolViolation);
                return;
            }
        }
    }
}

/// Handle one inbound PDU; returns `false` when the loop must stop.
fn handle_pdu(shared: &Shared, pdu: Pdu, assembler: &mut MessageAssembler) -> bool {
    match pdu {
        Pdu::PData { data } => {
            for pdv in data {
                if !handle_pdata_value(shared, pdv, assembler) {
                    return false;
                }
            }
            true
        }
        Pdu::ReleaseRQ => {
            // peer-initiated release, or a release collision;
            // either way the reply closes the session
            let _ = shared.write_pdus(&[Pdu::ReleaseRP]);
            if let Ok(mut release) = shared.release.lock() {
                if let Some(tx) = release.take() {
                    let _ = tx.send(());
                }
            }
            shared.terminate(SessionLost::Closed);
            false
        }
        Pdu::ReleaseRP => {
            let notified = shared
                .release
                .lock()
                .ok()
                .and_then(|mut release| release.take())
                .map(|tx| tx.send(()).is_ok())
                .unwrap_or(false);
            if !notified {
                warn!("Unsolicited A-RELEASE-RP, closing the association");
            }
            shared.terminate(SessionLost::Closed);
            false
        }
        Pdu::AbortRQ { source } => {
            shared.terminate(SessionLost::Aborted(source));
            false
        }
        pdu => {
            warn!(
                "Unexpected PDU `{}` on an established association",
                pdu.short_description()
            );
            shared.write_abort_quietly();
            shared.terminate(SessionLost::ProtocolViolation);
            false
        }
    }
}

fn handle_pdata_value(shared: &Shared, pdv: PDataValue, assembler: &mut MessageAssembler) -> bool {
    // a context ID outside the negotiated table is a protocol violation
    if !shared
        .presentation_contexts
        .iter()
        .any(|pc| pc.id == pdv.presentation_context_id)
    {
        warn!(
            "Received fragment on unknown presentation context {}",
            pdv.presentation_context_id
        );
        shared.write_abort_quietly();
        shared.terminate(SessionLost::ProtocolViolation);
        return false;
    }

    let message = match assembler.push(pdv) {
        Ok(None) => return true,
        Ok(Some(message)) => message,
        Err(e) => {
            debug!("Aborting association on malformed message: {}", e);
            shared.write_abort_quietly();
            shared.terminate(SessionLost::ProtocolViolation);
            return false;
        }
    };

    match message.command.is_response() {
        Ok(true) => {
            route_response(shared, message);
            true
        }
        Ok(false) => {
            handle_inbound_request(shared, message);
            true
        }
        Err(e) => {
            debug!("Aborting association on malformed command set: {}", e);
            shared.write_abort_quietly();
            shared.terminate(SessionLost::ProtocolViolation);
            false
        }
    }
}

/// Correlate a response to its outstanding request
/// and resolve the completion.
///
/// An unmatched response is logged and dropped, never fatal.
fn route_response(shared: &Shared, message: DimseMessage) {
    let (message_id, response_status) = match (
        message.command.message_id_being_responded_to(),
        message.command.status(),
    ) {
        (Ok(message_id), Ok(response_status)) => (message_id, response_status),
        _ => {
            warn!("Discarding response with no usable correlation fields");
            return;
        }
    };

    let mut pending = match shared.pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match pending.get(&message_id) {
        Some(completion) => {
            let delivered = completion
                .send(Ok(DimseResponse {
                    presentation_context_id: message.presentation_context_id,
                    command: message.command,
                    data: message.data,
                    status: response_status,
                }))
                .is_ok();
            // pending statuses keep the entry registered
            // until the final response arrives
            if !status::is_pending(response_status) || !delivered {
                pending.remove(&message_id);
            }
        }
        None => {
            warn!(
                "Discarding response to unknown message ID {}",
                message_id
            );
        }
    }
}

/// Handle a request sent by the peer on this association,
/// such as a C-STORE sub-operation of an ongoing C-GET.
fn handle_inbound_request(shared: &Shared, message: DimseMessage) {
    let context_id = message.presentation_context_id;
    let transfer_syntax = shared
        .presentation_contexts
        .iter()
        .find(|pc| pc.id == context_id)
        .map(|pc| pc.transfer_syntax.clone())
        .unwrap_or_default();

    let pdus = match &shared.registry {
        Some(registry) => crate::service::dispatch_to_pdus(
            registry,
            &shared.called_ae_title,
            &shared.calling_ae_title,
            context_id,
            &transfer_syntax,
            message,
            shared.peer_max_pdu_length,
        ),
        None => {
            warn!("No service registry to handle inbound request, answering as unsupported");
            crate::service::unsupported_to_pdus(&message, shared.peer_max_pdu_length)
        }
    };
    match pdus {
        Ok(pdus) => {
            let _ = shared.write_pdus(pdus.iter());
        }
        Err(e) => {
            warn!("Could not answer inbound request: {}", e);
        }
    }
}
