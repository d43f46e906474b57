//! Association acceptor module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity listens to incoming association requests.
//! See [`ServerAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

use bytes::BytesMut;
use snafu::{ensure, ResultExt};

use crate::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ, AssociationRJResult,
    AssociationRJServiceProviderAsceReason, AssociationRJServiceUserReason, AssociationRJSource,
    AssociationRQ, Pdu, PresentationContextResult, UserIdentity, UserVariableItem,
    DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE,
};
use crate::transport::{TransportOptions, TransportStream};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::negotiate::{
    negotiate_presentation_contexts, negotiate_roles, PresentationContextNegotiated,
};
use super::pdata::{PDataReader, PDataWriter};
use super::uid::trim_uid;
use super::{
    encode_pdu, pdu_legal_to_send, read_pdu_from_wire, state_after_send, AbortedSnafu,
    AssociationState, Error, IllegalReceiveSnafu, IllegalSendSnafu, MissingAbstractSyntaxSnafu,
    NegotiatedOptions, RejectedSnafu, Result, UnexpectedPduSnafu, UnknownPduSnafu, WireSendSnafu,
};

/// Common interface for application entity access control policies.
///
/// Existing implementations include [`AcceptAny`] and [`AcceptCalledAeTitle`],
/// but users are free to implement their own.
pub trait AccessControl {
    /// Obtain the decision of whether to accept an incoming association request
    /// based on the recorded application entity titles and/or user identity.
    ///
    /// Returns `Ok(())` if the requesting node should be given clearance.
    /// Otherwise, a concrete association RJ service user reason is given.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason>;
}

/// An access control rule that accepts any incoming association request.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptAny;

impl AccessControl for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        Ok(())
    }
}

/// An access control rule that accepts association requests
/// whose called AE title matches the node's AE title.
#[derive(Debug, Default, Copy, Clone, Eq, Hash, PartialEq)]
pub struct AcceptCalledAeTitle;

impl AccessControl for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<(), AssociationRJServiceUserReason> {
        if this_ae_title == called_ae_title {
            Ok(())
        } else {
            Err(AssociationRJServiceUserReason::CalledAETitleNotRecognized)
        }
    }
}

/// A DICOM association builder for an acceptor node,
/// often taking the role of a service class provider (SCP).
///
/// This is the standard way of negotiating and establishing
/// an association with a requesting node.
/// The outcome is a [`ServerAssociation`].
/// Unlike the client options,
/// a value of this type is intended to be reused
/// across many incoming connections.
///
/// The acceptor catalogue is built from
/// [`with_abstract_syntax`](Self::with_abstract_syntax) calls
/// (the recognized abstract syntaxes),
/// [`with_transfer_syntax`](Self::with_transfer_syntax) calls
/// (the transfer syntax preference list, scanned in the order given),
/// and [`with_role_selection`](Self::with_role_selection) calls
/// (the roles this node can accept per SOP class).
///
/// Access control logic is also available,
/// enabling application entities to decide on
/// whether to accept or reject the association request
/// based on the _called_ and _calling_ AE titles:
///
/// - By default, the application will accept requests from anyone
///   ([`AcceptAny`]);
/// - To only accept requests with a matching _called_ AE title,
///   add a call to [`accept_called_ae_title`](Self::accept_called_ae_title)
///   ([`AcceptCalledAeTitle`]);
/// - Any other policy can be implemented through the [`AccessControl`] trait.
///
/// # Example
///
/// ```no_run
/// # use std::net::TcpListener;
/// # use dicom_net::association::server::ServerAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// # let tcp_listener: TcpListener = unimplemented!();
/// let scp_options = ServerAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .with_transfer_syntax("1.2.840.10008.1.2.1");
///
/// let (stream, _address) = tcp_listener.accept()?;
/// scp_options.establish(stream)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the application entity access control policy
    ae_access_control: A,
    /// the AE title of this DICOM node
    ae_title: Cow<'a, str>,
    /// the expected application context name
    application_context_name: Cow<'a, str>,
    /// the list of recognized abstract syntaxes
    abstract_syntax_uids: Vec<Cow<'a, str>>,
    /// the transfer syntax preference list, in order
    transfer_syntax_uids: Vec<Cow<'a, str>>,
    /// the roles this node can accept, per SOP class
    supported_roles: HashMap<String, (bool, bool)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length this node is willing to receive
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// whether to accept unknown abstract syntaxes
    promiscuous: bool,
    /// socket-level timeouts
    transport_options: TransportOptions,
    /// TLS configuration for the underlying TCP socket
    #[cfg(feature = "tls")]
    tls_config: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            ae_access_control: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            abstract_syntax_uids: Vec::new(),
            transfer_syntax_uids: Vec::new(),
            supported_roles: HashMap::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            promiscuous: false,
            transport_options: TransportOptions::default(),
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    /// Create a new set of options for accepting associations.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessControl,
{
    /// Change the access control policy to accept any association
    /// regardless of the specified AE titles.
    ///
    /// This is the default behavior when the options are first created.
    pub fn accept_any(self) -> ServerAssociationOptions<'a, AcceptAny> {
        self.ae_access_control(AcceptAny)
    }

    /// Change the access control policy to accept an association
    /// if the called AE title matches this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.ae_access_control(AcceptCalledAeTitle)
    }

    /// Change the access control policy.
    pub fn ae_access_control<P>(self, access_control: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessControl,
    {
        let ServerAssociationOptions {
            ae_access_control: _,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            supported_roles,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            transport_options,
            #[cfg(feature = "tls")]
            tls_config,
        } = self;

        ServerAssociationOptions {
            ae_access_control: access_control,
            ae_title,
            application_context_name,
            abstract_syntax_uids,
            transfer_syntax_uids,
            supported_roles,
            protocol_version,
            max_pdu_length,
            strict,
            promiscuous,
            transport_options,
            #[cfg(feature = "tls")]
            tls_config,
        }
    }

    /// Define the application entity title referring to this DICOM node.
    ///
    /// The default is `THIS-SCP`.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Include this abstract syntax
    /// in the set of recognized abstract syntaxes.
    pub fn with_abstract_syntax<T>(mut self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.abstract_syntax_uids
            .push(trim_uid(abstract_syntax_uid.into()));
        self
    }

    /// Append this transfer syntax to the preference list.
    ///
    /// During negotiation,
    /// the first entry of the preference list
    /// which also appears among a context's proposed candidates is chosen.
    /// An empty preference list accepts
    /// any transfer syntax supported by the registry,
    /// in the order of the proposal.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.transfer_syntax_uids
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Declare the roles this node can accept from the requestor
    /// for the given SOP class:
    /// `scu` for the requestor acting as SCU,
    /// `scp` for the requestor acting as SCP.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.supported_roles
            .insert(trim_uid(sop_class_uid.into()).to_string(), (scu, scp));
        self
    }

    /// Override the maximum expected PDU length.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether receiving PDUs must not
    /// surpass the negotiated maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Override promiscuous mode:
    /// whether to accept unknown abstract syntaxes.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Set the timeout for the association request
    /// after the transport is accepted.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.transport_options.response_timeout = Some(timeout);
        self
    }

    /// Set the read timeout applied while the association is established.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.transport_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for outbound PDUs.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.transport_options.write_timeout = Some(timeout);
        self
    }

    /// Set the timeout for the release reply
    /// after requesting an orderly release.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.transport_options.release_timeout = Some(timeout);
        self
    }

    /// Set the TLS configuration
    /// for accepting associations over a secure transport.
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ServerConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Negotiate an association with the given TCP stream.
    pub fn establish(&self, socket: TcpStream) -> Result<ServerAssociation<TcpStream>> {
        socket
            .set_write_timeout(self.transport_options.write_timeout)
            .context(super::ConfigureSocketSnafu)?;
        self.handshake(socket)
    }

    /// Accept the TLS handshake on the given TCP stream
    /// under the configured [`tls_config`](Self::tls_config),
    /// then negotiate an association over the secure stream.
    #[cfg(feature = "tls")]
    pub fn establish_tls(
        &self,
        socket: TcpStream,
    ) -> Result<ServerAssociation<crate::transport::ServerTlsStream>> {
        use snafu::OptionExt;

        let tls_config = self
            .tls_config
            .as_ref()
            .context(super::TlsConfigMissingSnafu)?;
        socket
            .set_write_timeout(self.transport_options.write_timeout)
            .context(super::ConfigureSocketSnafu)?;
        let conn =
            rustls::ServerConnection::new(tls_config.clone()).context(super::TlsSnafu)?;
        let stream = rustls::StreamOwned::new(conn, socket);
        self.handshake(stream)
    }

    /// Wait for the association request on the open transport
    /// and answer it.
    fn handshake<S>(&self, mut socket: S) -> Result<ServerAssociation<S>>
    where
        S: TransportStream,
    {
        ensure!(
            !self.abstract_syntax_uids.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        // state: AwaitingAssociateRequest,
        // bounded by the request timeout
        socket
            .set_read_timeout(self.transport_options.response_timeout)
            .context(super::ConfigureSocketSnafu)?;

        let mut read_buffer = BytesMut::with_capacity(
            (self.max_pdu_length.min(MAXIMUM_PDU_SIZE) + PDU_HEADER_SIZE) as usize,
        );
        let mut write_buffer: Vec<u8> = Vec::with_capacity(self.max_pdu_length as usize);

        let msg = match read_pdu_from_wire(
            &mut socket,
            &mut read_buffer,
            self.max_pdu_length,
            self.strict,
        ) {
            Ok(msg) => msg,
            Err(e) => {
                // malformed request or timer expiry: abort
                let _ = encode_pdu(
                    &mut write_buffer,
                    &Pdu::AbortRQ {
                        source: AbortRQSource::ServiceProvider(
                            AbortRQServiceProviderReason::UnrecognizedPdu,
                        ),
                    },
                    MAXIMUM_PDU_SIZE,
                );
                let _ = socket.write_all(&write_buffer);
                let _ = socket.shutdown();
                return Err(e);
            }
        };

        match self.process_a_association_rq(msg) {
            Ok((
                pdu,
                NegotiatedOptions {
                    peer_max_pdu_length,
                    user_variables,
                    presentation_contexts,
                    peer_ae_title,
                },
            )) => {
                encode_pdu(&mut write_buffer, &pdu, MAXIMUM_PDU_SIZE)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;

                // entering Established: switch to the idle read timeout
                socket
                    .set_read_timeout(self.transport_options.read_timeout)
                    .context(super::ConfigureSocketSnafu)?;

                Ok(ServerAssociation {
                    state: AssociationState::Established,
                    presentation_contexts,
                    requestor_max_pdu_length: peer_max_pdu_length,
                    acceptor_max_pdu_length: self.max_pdu_length,
                    socket,
                    read_buffer,
                    write_buffer,
                    strict: self.strict,
                    this_ae_title: self.ae_title.to_string(),
                    client_ae_title: peer_ae_title,
                    user_variables,
                    transport_options: self.transport_options.clone(),
                    detached: false,
                })
            }
            Err((pdu, err)) => {
                // send the rejection or abort PDU and close
                encode_pdu(&mut write_buffer, &pdu, MAXIMUM_PDU_SIZE)?;
                socket.write_all(&write_buffer).context(WireSendSnafu)?;
                let _ = socket.shutdown();
                Err(err)
            }
        }
    }

    /// Process an association request PDU.
    ///
    /// In the success case, returns the A-ASSOCIATE-AC to write back
    /// and the negotiated options.
    /// In the error case, returns the A-ASSOCIATE-RJ or A-ABORT
    /// to write back and the error to surface.
    #[allow(clippy::result_large_err)]
    fn process_a_association_rq(
        &self,
        msg: Pdu,
    ) -> std::result::Result<(Pdu, NegotiatedOptions), (Pdu, Error)> {
        match msg {
            Pdu::AssociationRQ(AssociationRQ {
                protocol_version,
                calling_ae_title,
                called_ae_title,
                application_context_name,
                presentation_contexts,
                user_variables,
            }) => {
                // association-level preconditions first:
                // common protocol version, application context, access policy
                if protocol_version & self.protocol_version == 0 {
                    return Err(reject(
                        AssociationRJSource::ServiceProviderAsce(
                            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
                        ),
                    ));
                }

                if application_context_name != self.application_context_name {
                    return Err(reject(AssociationRJSource::ServiceUser(
                        AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
                    )));
                }

                if let Err(reason) = self.ae_access_control.check_access(
                    &self.ae_title,
                    &calling_ae_title,
                    &called_ae_title,
                    user_variables
                        .iter()
                        .find_map(|user_variable| match user_variable {
                            UserVariableItem::UserIdentityItem(user_identity) => {
                                Some(user_identity)
                            }
                            _ => None,
                        }),
                ) {
                    return Err(reject(AssociationRJSource::ServiceUser(reason)));
                }

                let requestor_max_pdu_length =
                    super::peer_max_pdu_length(&user_variables, u32::MAX);

                let presentation_contexts_negotiated = negotiate_presentation_contexts(
                    &presentation_contexts,
                    &self.abstract_syntax_uids,
                    &self.transfer_syntax_uids,
                    self.promiscuous,
                );

                let mut ac_user_variables = vec![
                    UserVariableItem::MaxLength(self.max_pdu_length),
                    UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
                    UserVariableItem::ImplementationVersionName(
                        IMPLEMENTATION_VERSION_NAME.to_string(),
                    ),
                ];
                ac_user_variables
                    .extend(negotiate_roles(&user_variables, &self.supported_roles));

                let pdu = Pdu::AssociationAC(AssociationAC {
                    protocol_version: self.protocol_version,
                    calling_ae_title: calling_ae_title.clone(),
                    called_ae_title,
                    application_context_name,
                    presentation_contexts: presentation_contexts_negotiated
                        .iter()
                        .map(PresentationContextResult::from)
                        .collect(),
                    user_variables: ac_user_variables,
                });

                Ok((
                    pdu,
                    NegotiatedOptions {
                        peer_max_pdu_length: requestor_max_pdu_length,
                        user_variables,
                        presentation_contexts: presentation_contexts_negotiated,
                        peer_ae_title: calling_ae_title,
                    },
                ))
            }
            Pdu::ReleaseRQ => Err((
                Pdu::ReleaseRP,
                AbortedSnafu {
                    origin: AbortRQSource::ServiceUser,
                }
                .build(),
            )),
            pdu @ Pdu::AssociationAC { .. }
            | pdu @ Pdu::AssociationRJ { .. }
            | pdu @ Pdu::PData { .. }
            | pdu @ Pdu::ReleaseRP
            | pdu @ Pdu::AbortRQ { .. } => Err((
                Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnexpectedPdu,
                    ),
                },
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state: AssociationState::AwaitingAssociateRequest,
                }
                .build(),
            )),
            pdu @ Pdu::Unknown { .. } => Err((
                Pdu::AbortRQ {
                    source: AbortRQSource::ServiceProvider(
                        AbortRQServiceProviderReason::UnrecognizedPdu,
                    ),
                },
                UnknownPduSnafu { pdu: Box::new(pdu) }.build(),
            )),
        }
    }
}

/// Build the rejection PDU and error for the given source/reason.
fn reject(source: AssociationRJSource) -> (Pdu, Error) {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Permanent,
        source,
    };
    (
        Pdu::AssociationRJ(association_rj.clone()),
        RejectedSnafu { association_rj }.build(),
    )
}

/// A DICOM upper level association from the perspective
/// of an accepting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send)
/// and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier through the P-Data writer
/// abstraction (see [`send_pdata`](Self::send_pdata)).
///
/// When the value falls out of scope,
/// the program will shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ServerAssociation<S>
where
    S: TransportStream,
{
    /// the current state of the association
    state: AssociationState,
    /// The negotiated presentation contexts, accepted and rejected
    presentation_contexts: Vec<PresentationContextNegotiated>,
    /// The maximum PDU length that the remote application entity accepts
    requestor_max_pdu_length: u32,
    /// The maximum PDU length that this application entity is expecting to receive
    acceptor_max_pdu_length: u32,
    /// The stream to the other DICOM node
    socket: S,
    /// Buffer for incoming wire bytes, possibly holding partial PDUs
    read_buffer: BytesMut,
    /// Reusable buffer for assembling PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// The application entity title of this node
    this_ae_title: String,
    /// The application entity title of the other DICOM node
    client_ae_title: String,
    /// User variables received from the peer
    user_variables: Vec<UserVariableItem>,
    /// The timeouts the association was established with
    transport_options: TransportOptions,
    /// Whether the socket was handed over to another owner
    detached: bool,
}

impl<S> ServerAssociation<S>
where
    S: TransportStream,
{
    /// Retrieve the current association state.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Obtain a view of the negotiated presentation contexts,
    /// including the rejected ones.
    pub fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
        &self.presentation_contexts
    }

    /// Retrieve the maximum PDU length
    /// admitted by this application entity.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Retrieve the maximum PDU length
    /// that the requestor is expecting to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// Obtain the remote DICOM node's application entity title.
    pub fn client_ae_title(&self) -> &str {
        &self.client_ae_title
    }

    /// Obtain this node's application entity title.
    pub fn ae_title(&self) -> &str {
        &self.this_ae_title
    }

    /// Retrieve the user variables received from the peer.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.user_variables
    }

    /// Send a PDU message to the peer.
    ///
    /// The PDU must be legal for the current association state.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        ensure!(
            pdu_legal_to_send(self.state, msg),
            IllegalSendSnafu {
                description: msg.short_description().to_string(),
                state: self.state,
            }
        );
        encode_pdu(&mut self.write_buffer, msg, self.requestor_max_pdu_length)?;
        match self.socket.write_all(&self.write_buffer) {
            Ok(()) => {
                self.state = state_after_send(self.state, msg);
                Ok(())
            }
            Err(e) => {
                self.state = AssociationState::Aborted;
                let _ = self.socket.shutdown();
                Err(e).context(WireSendSnafu)
            }
        }
    }

    /// Read a PDU message from the peer.
    ///
    /// A malformed PDU, a PDU illegal for the current state,
    /// or the expiry of the configured timer
    /// aborts the association and surfaces the corresponding error.
    pub fn receive(&mut self) -> Result<Pdu> {
        match self.state {
            AssociationState::Established
            | AssociationState::AwaitingReleaseResponse
            | AssociationState::ReleaseIndicated => {}
            state => return IllegalReceiveSnafu { state }.fail(),
        }

        let pdu = match read_pdu_from_wire(
            &mut self.socket,
            &mut self.read_buffer,
            self.acceptor_max_pdu_length,
            self.strict,
        ) {
            Ok(pdu) => pdu,
            Err(e @ Error::ConnectionClosed { .. }) => {
                self.state = AssociationState::Aborted;
                let _ = self.socket.shutdown();
                return Err(e);
            }
            Err(e) => {
                self.abort_now();
                return Err(e);
            }
        };

        match pdu {
            Pdu::PData { .. }
                if self.state == AssociationState::Established
                    || self.state == AssociationState::AwaitingReleaseResponse =>
            {
                Ok(pdu)
            }
            Pdu::ReleaseRQ
                if self.state == AssociationState::Established
                    || self.state == AssociationState::AwaitingReleaseResponse =>
            {
                if self.state == AssociationState::Established {
                    self.state = AssociationState::ReleaseIndicated;
                }
                Ok(pdu)
            }
            Pdu::ReleaseRP if self.state == AssociationState::AwaitingReleaseResponse => {
                self.state = AssociationState::Closed;
                Ok(pdu)
            }
            Pdu::AbortRQ { source } => {
                self.state = AssociationState::Aborted;
                let _ = self.socket.shutdown();
                AbortedSnafu { origin: source }.fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                self.abort_now();
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
            pdu => {
                let state = self.state;
                self.abort_now();
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state,
                }
                .fail()
            }
        }
    }

    /// Gracefully terminate the association from the acceptor side
    /// by exchanging release messages
    /// and then shutting down the TCP connection.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.shutdown();
        out
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            ),
        };
        let out = self.send(&pdu);
        self.state = AssociationState::Aborted;
        let _ = self.socket.shutdown();
        out
    }

    /// Obtain access to the inner stream
    /// connected to the association requestor.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut S> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.requestor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        let Self {
            socket,
            read_buffer,
            acceptor_max_pdu_length,
            ..
        } = self;
        PDataReader::new(socket, read_buffer, *acceptor_max_pdu_length)
    }

    fn release_impl(&mut self) -> Result<()> {
        self.send(&Pdu::ReleaseRQ)?;
        let _ = self
            .socket
            .set_read_timeout(self.transport_options.release_timeout);

        loop {
            match self.receive()? {
                Pdu::ReleaseRP => return Ok(()),
                Pdu::ReleaseRQ => {
                    self.send(&Pdu::ReleaseRP)?;
                    return Ok(());
                }
                Pdu::PData { .. } => {
                    tracing::debug!("Discarding P-Data received while releasing");
                }
                pdu => {
                    let state = self.state;
                    self.abort_now();
                    return UnexpectedPduSnafu {
                        pdu: Box::new(pdu),
                        state,
                    }
                    .fail();
                }
            }
        }
    }

    fn abort_now(&mut self) {
        self.write_buffer.clear();
        if crate::pdu::write_pdu(
            &mut self.write_buffer,
            &Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu,
                ),
            },
        )
        .is_ok()
        {
            let _ = self.socket.write_all(&self.write_buffer);
        }
        self.state = AssociationState::Aborted;
        let _ = self.socket.shutdown();
    }
}

/// Shut down the connection when the association falls out of scope.
impl<S> Drop for ServerAssociation<S>
where
    S: TransportStream,
{
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let _ = self.socket.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PresentationContextProposed;

    const VERIFICATION: &str = "1.2.840.10008.1.1";
    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";

    fn request() -> Pdu {
        Pdu::AssociationRQ(AssociationRQ {
            protocol_version: 1,
            calling_ae_title: "ECHO-SCU".to_string(),
            called_ae_title: "THIS-SCP".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: vec![PresentationContextProposed {
                id: 1,
                abstract_syntax: VERIFICATION.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            }],
            user_variables: vec![UserVariableItem::MaxLength(16384)],
        })
    }

    #[test]
    fn acceptable_request_yields_one_associate_ac() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, negotiated) = options.process_a_association_rq(request()).unwrap();
        match pdu {
            Pdu::AssociationAC(ac) => {
                assert_eq!(ac.presentation_contexts.len(), 1);
                assert!(ac.presentation_contexts[0].is_accepted());
            }
            pdu => panic!("expected A-ASSOCIATE-AC, got {:?}", pdu),
        }
        assert_eq!(negotiated.peer_ae_title, "ECHO-SCU");
        assert_eq!(negotiated.peer_max_pdu_length, 16384);
    }

    #[test]
    fn mismatched_called_ae_title_is_rejected() {
        let options = ServerAssociationOptions::new()
            .accept_called_ae_title()
            .ae_title("OTHER-SCP")
            .with_abstract_syntax(VERIFICATION);
        let (pdu, err) = options.process_a_association_rq(request()).unwrap_err();
        assert!(matches!(pdu, Pdu::AssociationRJ(_)));
        assert!(matches!(err, Error::Rejected { .. }));
    }

    #[test]
    fn no_common_protocol_version_is_rejected() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let mut msg = request();
        if let Pdu::AssociationRQ(rq) = &mut msg {
            rq.protocol_version = 0x0002;
        }
        let (pdu, _err) = options.process_a_association_rq(msg).unwrap_err();
        match pdu {
            Pdu::AssociationRJ(rj) => assert_eq!(
                rj.source,
                AssociationRJSource::ServiceProviderAsce(
                    AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported
                )
            ),
            pdu => panic!("expected A-ASSOCIATE-RJ, got {:?}", pdu),
        }
    }

    #[test]
    fn data_before_establishment_is_answered_with_abort() {
        let options = ServerAssociationOptions::new().with_abstract_syntax(VERIFICATION);
        let (pdu, err) = options
            .process_a_association_rq(Pdu::PData { data: vec![] })
            .unwrap_err();
        assert!(matches!(
            pdu,
            Pdu::AbortRQ {
                source: AbortRQSource::ServiceProvider(
                    AbortRQServiceProviderReason::UnexpectedPdu
                )
            }
        ));
        assert!(matches!(err, Error::UnexpectedPdu { .. }));
    }
}
