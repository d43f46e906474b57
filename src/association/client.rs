//! Association requester module
//!
//! The module provides an abstraction for a DICOM association
//! in which this application entity is the one requesting the association.
//! See [`ClientAssociationOptions`]
//! for details and examples on how to create an association.
use std::borrow::Cow;
use std::convert::{TryFrom, TryInto};
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};

use bytes::BytesMut;
use snafu::{ensure, ResultExt};

use crate::address::AeAddr;
use crate::pdu::{
    AbortRQSource, AssociationAC, AssociationRQ, Pdu, PresentationContextProposed,
    PresentationContextResult, RoleSelection, UserVariableItem, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::transport::{self, ProxyOptions, TransportOptions, TransportStream};
use crate::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::pdata::{PDataReader, PDataWriter};
use super::uid::trim_uid;
use super::{
    encode_pdu, pdu_legal_to_send, read_pdu_from_wire, state_after_send, AbortedSnafu,
    AssociationState, ConnectSnafu, Error, IllegalReceiveSnafu, IllegalSendSnafu,
    MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    ProtocolVersionMismatchSnafu, ProxyTunnelSnafu, RejectedSnafu, Result, UnexpectedPduSnafu,
    UnknownPduSnafu, WireSendSnafu,
};

/// A DICOM association builder for a requesting node,
/// usually taking the role of a service class user (SCU).
/// The final outcome is a [`ClientAssociation`].
///
/// # Example
///
/// ```no_run
/// # use dicom_net::association::client::ClientAssociationOptions;
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let association = ClientAssociationOptions::new()
///    .with_presentation_context(
///        "1.2.840.10008.1.1",
///        vec!["1.2.840.10008.1.2.1", "1.2.840.10008.1.2"],
///    )
///    .establish("129.168.0.5:104")?;
/// # Ok(())
/// # }
/// ```
///
/// At least one presentation context must be specified,
/// either through [`with_presentation_context`](Self::with_presentation_context)
/// with an explicit transfer syntax list,
/// or through [`with_abstract_syntax`](Self::with_abstract_syntax),
/// which proposes the default transfer syntaxes
/// _Implicit VR Little Endian_ and _Explicit VR Little Endian_.
///
/// The options value is reusable:
/// `establish` borrows it,
/// so one configuration can open any number of independent associations,
/// including multiple simultaneous associations to the same peer.
#[derive(Debug, Clone)]
pub struct ClientAssociationOptions<'a> {
    /// the calling AE title
    calling_ae_title: Cow<'a, str>,
    /// the called AE title, when overriding the one in the address
    called_ae_title: Option<Cow<'a, str>>,
    /// the requested application context name
    application_context_name: Cow<'a, str>,
    /// the list of requested presentation contexts
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// the SCP/SCU role selections to propose
    role_selections: Vec<RoleSelection>,
    /// the asynchronous operations window to propose, if any
    async_operations_window: Option<(u16, u16)>,
    /// the expected protocol version
    protocol_version: u16,
    /// the maximum PDU length requested for receiving PDUs
    max_pdu_length: u32,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// socket-level timeouts
    transport_options: TransportOptions,
    /// HTTP proxy to tunnel the connection through, if any
    proxy: Option<ProxyOptions>,
    /// TLS configuration for the connection
    #[cfg(feature = "tls")]
    tls_config: Option<std::sync::Arc<rustls::ClientConfig>>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: "1.2.840.10008.3.1.1.1".into(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            async_operations_window: None,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            transport_options: TransportOptions::default(),
            proxy: None,
            #[cfg(feature = "tls")]
            tls_config: None,
        }
    }
}

impl<'a> ClientAssociationOptions<'a> {
    /// Create a new set of options for establishing an association.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling application entity title for the association,
    /// which refers to this DICOM node.
    ///
    /// The default is `THIS-SCU`.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called application entity title for the association,
    /// which refers to the target DICOM node.
    ///
    /// The default is `ANY-SCP`.
    /// Passing an empty string resets the AE title to the default
    /// (or to the one in the address passed to
    /// [`establish_with`](Self::establish_with)).
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let cae = called_ae_title.into();
        if cae.is_empty() {
            self.called_ae_title = None;
        } else {
            self.called_ae_title = Some(cae);
        }
        self
    }

    /// Include this presentation context
    /// in the list of proposed presentation contexts.
    pub fn with_presentation_context<T>(
        mut self,
        abstract_syntax_uid: T,
        transfer_syntax_uids: Vec<T>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let transfer_syntaxes: Vec<Cow<'a, str>> = transfer_syntax_uids
            .into_iter()
            .map(|t| trim_uid(t.into()))
            .collect();
        self.presentation_contexts
            .push((trim_uid(abstract_syntax_uid.into()), transfer_syntaxes));
        self
    }

    /// Helper to add this abstract syntax
    /// with the default transfer syntaxes
    /// to the list of proposed presentation contexts.
    pub fn with_abstract_syntax<T>(self, abstract_syntax_uid: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        let default_transfer_syntaxes: Vec<Cow<'a, str>> =
            vec!["1.2.840.10008.1.2.1".into(), "1.2.840.10008.1.2".into()];
        self.with_presentation_context(abstract_syntax_uid.into(), default_transfer_syntaxes)
    }

    /// Propose an SCP/SCU role selection for the given SOP class,
    /// stating the roles this node intends to take.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: trim_uid(sop_class_uid.into()).to_string(),
            scu_role: scu,
            scp_role: scp,
        });
        self
    }

    /// Propose an asynchronous operations window,
    /// declaring the maximum number of operations
    /// this node may invoke and perform concurrently.
    pub fn async_operations_window(mut self, invoked: u16, performed: u16) -> Self {
        self.async_operations_window = Some((invoked, performed));
        self
    }

    /// Override the maximum PDU length
    /// that this application entity will admit.
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

    /// Set the timeout for opening the TCP connection.
    pub fn connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.connect_timeout = Some(timeout);
        self
    }

    /// Set the timeout for the association response
    /// after sending the association request.
    pub fn response_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.response_timeout = Some(timeout);
        self
    }

    /// Set the read timeout applied while the association is established.
    pub fn read_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout for outbound PDUs.
    pub fn write_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.write_timeout = Some(timeout);
        self
    }

    /// Set the timeout for the release reply
    /// after requesting an orderly release.
    pub fn release_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.transport_options.release_timeout = Some(timeout);
        self
    }

    /// Tunnel the connection through the given HTTP proxy,
    /// via a plain-text `CONNECT` handshake.
    pub fn proxy(mut self, proxy: ProxyOptions) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Set the TLS configuration to wrap the connection with.
    ///
    /// Only used by [`establish_tls`](Self::establish_tls).
    #[cfg(feature = "tls")]
    pub fn tls_config(mut self, config: impl Into<std::sync::Arc<rustls::ClientConfig>>) -> Self {
        self.tls_config = Some(config.into());
        self
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    pub fn establish<A: ToSocketAddrs>(&self, address: A) -> Result<ClientAssociation<TcpStream>> {
        self.establish_impl(AeAddr::new_socket_addr(address), None)
    }

    /// Initiate the TCP connection to the given address
    /// and request a new DICOM association,
    /// negotiating the presentation contexts in the process.
    ///
    /// This method allows the called AE title to be specified
    /// alongside the socket address,
    /// in the form `AE-TITLE@host:port`
    /// (see [`AeAddr`] for more details).
    /// The AE title in the address
    /// is overridden by any `called_ae_title` option
    /// previously set.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use dicom_net::association::client::ClientAssociationOptions;
    /// # fn run() -> Result<(), Box<dyn std::error::Error>> {
    /// let association = ClientAssociationOptions::new()
    ///     .with_abstract_syntax("1.2.840.10008.1.1")
    ///     // called AE title in address
    ///     .establish_with("MY-STORAGE@10.0.0.100:104")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn establish_with(&self, ae_address: &str) -> Result<ClientAssociation<TcpStream>> {
        match ae_address.try_into() {
            Ok(ae_address) => {
                let ae_address: AeAddr<String> = ae_address;
                let target = ae_address.socket_addr().clone();
                self.establish_impl(ae_address, Some(target))
            }
            Err(_) => self.establish_impl(AeAddr::new_socket_addr(ae_address), None),
        }
    }

    /// Initiate the connection to the given address,
    /// perform the TLS handshake under the configured
    /// [`tls_config`](Self::tls_config),
    /// and request a new DICOM association over the secure stream.
    ///
    /// The server name for certificate validation
    /// is taken from the host portion of the address.
    #[cfg(feature = "tls")]
    pub fn establish_tls(
        &self,
        ae_address: &str,
    ) -> Result<ClientAssociation<crate::transport::ClientTlsStream>> {
        use snafu::OptionExt;

        let ae_address: AeAddr<String> = ae_address
            .try_into()
            .unwrap_or_else(|_| AeAddr::new_socket_addr(ae_address.to_string()));
        let target = ae_address.socket_addr().clone();

        let config = self
            .tls_config
            .clone()
            .context(super::TlsConfigMissingSnafu)?;
        let host = crate::address::host_of(&target).to_string();
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .ok()
            .with_context(|| super::InvalidServerNameSnafu { name: host })?;

        let socket = self.connect_raw(&ae_address, Some(&target))?;
        let conn = rustls::ClientConnection::new(config, server_name).context(super::TlsSnafu)?;
        let stream = crate::transport::SharedTlsStream::new(rustls::StreamOwned::new(conn, socket))
            .context(super::ConfigureSocketSnafu)?;
        self.handshake(stream, ae_address.ae_title())
    }

    fn establish_impl<T>(
        &self,
        ae_address: AeAddr<T>,
        target_name: Option<String>,
    ) -> Result<ClientAssociation<TcpStream>>
    where
        T: ToSocketAddrs,
    {
        let socket = self.connect_raw(&ae_address, target_name.as_deref())?;
        self.handshake(socket, ae_address.ae_title())
    }

    /// Open the TCP connection,
    /// tunneling through the HTTP proxy when one is configured.
    fn connect_raw<T>(&self, ae_address: &AeAddr<T>, target_name: Option<&str>) -> Result<TcpStream>
    where
        T: ToSocketAddrs,
    {
        match &self.proxy {
            None => transport::connect_tcp(ae_address, &self.transport_options).context(ConnectSnafu),
            Some(proxy) => {
                // the proxy resolves named targets;
                // targets given as generic addresses are resolved locally
                let target = match target_name {
                    Some(name) => name.to_string(),
                    None => ae_address
                        .to_socket_addrs()
                        .context(ConnectSnafu)?
                        .next()
                        .ok_or_else(|| {
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidInput,
                                "could not resolve any socket address",
                            )
                        })
                        .context(ConnectSnafu)?
                        .to_string(),
                };
                let mut socket =
                    transport::connect_tcp(proxy.address(), &self.transport_options)
                        .context(ConnectSnafu)?;
                transport::proxy::tunnel(&mut socket, &target, proxy).context(ProxyTunnelSnafu)?;
                Ok(socket)
            }
        }
    }

    /// Send the association request over the open transport
    /// and wait for the association response.
    fn handshake<S>(&self, mut socket: S, address_ae_title: Option<&str>) -> Result<ClientAssociation<S>>
    where
        S: TransportStream,
    {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );

        // choose called AE title
        let called_ae_title: &str = match (self.called_ae_title.as_deref(), address_ae_title) {
            (Some(aec), Some(_)) => {
                tracing::warn!("Option `called_ae_title` overrides the AE title to `{}`", aec);
                aec
            }
            (Some(aec), None) => aec,
            (None, Some(aec)) => aec,
            (None, None) => "ANY-SCP",
        };

        let presentation_contexts: Vec<_> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| PresentationContextProposed {
                // odd identifiers, unique within the association
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|uid| uid.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariableItem::MaxLength(self.max_pdu_length),
            UserVariableItem::ImplementationClassUID(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if let Some((invoked, performed)) = self.async_operations_window {
            user_variables.push(UserVariableItem::AsyncOperationsWindow(invoked, performed));
        }
        user_variables.extend(
            self.role_selections
                .iter()
                .cloned()
                .map(UserVariableItem::RoleSelection),
        );

        let msg = Pdu::AssociationRQ(AssociationRQ {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts,
            user_variables,
        });

        // state: AwaitingTransportConnect → AwaitingAssociateResponse
        let mut write_buffer: Vec<u8> = Vec::with_capacity(self.max_pdu_length as usize);
        encode_pdu(&mut write_buffer, &msg, MAXIMUM_PDU_SIZE)?;
        socket.write_all(&write_buffer).context(WireSendSnafu)?;

        // the associate-response timeout governs this wait state
        socket
            .set_read_timeout(self.transport_options.response_timeout)
            .context(super::ConfigureSocketSnafu)?;

        let mut read_buffer = BytesMut::with_capacity(MAXIMUM_PDU_SIZE as usize);
        let msg = match read_pdu_from_wire(&mut socket, &mut read_buffer, MAXIMUM_PDU_SIZE, self.strict)
        {
            Ok(msg) => msg,
            Err(e) => {
                // timer expiry or bad PDU in a wait state: abort
                abort_quietly(&mut socket, &mut write_buffer);
                return Err(e);
            }
        };

        match msg {
            Pdu::AssociationAC(AssociationAC {
                protocol_version: protocol_version_scp,
                application_context_name: _,
                presentation_contexts: presentation_contexts_scp,
                calling_ae_title: _,
                called_ae_title: _,
                user_variables,
            }) => {
                if self.protocol_version != protocol_version_scp {
                    abort_quietly(&mut socket, &mut write_buffer);
                    return ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: protocol_version_scp,
                    }
                    .fail();
                }

                let acceptor_max_pdu_length =
                    super::peer_max_pdu_length(&user_variables, MAXIMUM_PDU_SIZE);

                let presentation_contexts: Vec<_> = presentation_contexts_scp
                    .into_iter()
                    .filter(PresentationContextResult::is_accepted)
                    .collect();
                if presentation_contexts.is_empty() {
                    // negotiation failure: zero usable contexts
                    abort_quietly(&mut socket, &mut write_buffer);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }

                // entering Established: switch to the idle read timeout
                socket
                    .set_read_timeout(self.transport_options.read_timeout)
                    .context(super::ConfigureSocketSnafu)?;

                Ok(ClientAssociation {
                    state: AssociationState::Established,
                    presentation_contexts,
                    requestor_max_pdu_length: self.max_pdu_length,
                    acceptor_max_pdu_length,
                    socket,
                    read_buffer,
                    write_buffer,
                    strict: self.strict,
                    calling_ae_title: self.calling_ae_title.to_string(),
                    called_ae_title: called_ae_title.to_string(),
                    user_variables,
                    transport_options: self.transport_options.clone(),
                    detached: false,
                })
            }
            Pdu::AssociationRJ(association_rj) => RejectedSnafu { association_rj }.fail(),
            pdu @ Pdu::AbortRQ { .. }
            | pdu @ Pdu::ReleaseRQ
            | pdu @ Pdu::AssociationRQ { .. }
            | pdu @ Pdu::PData { .. }
            | pdu @ Pdu::ReleaseRP => {
                abort_quietly(&mut socket, &mut write_buffer);
                UnexpectedPduSnafu {
                    pdu: Box::new(pdu),
                    state: AssociationState::AwaitingAssociateResponse,
                }
                .fail()
            }
            pdu @ Pdu::Unknown { .. } => {
                abort_quietly(&mut socket, &mut write_buffer);
                UnknownPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

/// Write an A-ABORT and shut the transport down,
/// ignoring any outcome.
fn abort_quietly<S: TransportStream>(socket: &mut S, buffer: &mut Vec<u8>) {
    buffer.clear();
    if crate::pdu::write_pdu(
        buffer,
        &Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        },
    )
    .is_ok()
    {
        let _ = socket.write_all(buffer);
    }
    let _ = socket.shutdown();
}

/// A DICOM upper level association from the perspective
/// of a requesting application entity.
///
/// The most common operations of an established association are
/// [`send`](Self::send)
/// and [`receive`](Self::receive).
/// Sending large P-Data fragments may be easier through the P-Data writer
/// abstraction (see [`send_pdata`](Self::send_pdata)).
///
/// When the value falls out of scope while still established,
/// the program will automatically try to gracefully release the association
/// through a standard release message exchange,
/// then shut down the underlying TCP connection.
#[derive(Debug)]
pub struct ClientAssociation<S>
where
    S: TransportStream,
{
    /// the current state of the association
    state: AssociationState,
    /// The accepted presentation contexts
    presentation_contexts: Vec<PresentationContextResult>,
    /// The maximum PDU length that this application entity is expecting to receive
    requestor_max_pdu_length: u32,
    /// The maximum PDU length that the remote application entity accepts
    acceptor_max_pdu_length: u32,
    /// The stream to the other DICOM node
    socket: S,
    /// Buffer for incoming wire bytes, possibly holding partial PDUs
    read_buffer: BytesMut,
    /// Reusable buffer for assembling PDUs before sending them on the wire
    write_buffer: Vec<u8>,
    /// whether to receive PDUs in strict mode
    strict: bool,
    /// The AE title of this node
    calling_ae_title: String,
    /// The AE title of the peer node
    called_ae_title: String,
    /// The user variables received from the peer
    user_variables: Vec<UserVariableItem>,
    /// The timeouts the association was established with
    transport_options: TransportOptions,
    /// Whether the socket was handed over to the DIMSE exchange layer,
    /// which then owns release and shutdown
    detached: bool,
}

impl<S> ClientAssociation<S>
where
    S: TransportStream,
{
    /// Retrieve the current association state.
    pub fn state(&self) -> AssociationState {
        self.state
    }

    /// Retrieve the list of negotiated presentation contexts
    /// accepted by the peer.
    pub fn presentation_contexts(&self) -> &[PresentationContextResult] {
        &self.presentation_contexts
    }

    /// Retrieve the maximum PDU length
    /// admitted by the association acceptor.
    pub fn acceptor_max_pdu_length(&self) -> u32 {
        self.acceptor_max_pdu_length
    }

    /// Retrieve the maximum PDU length
    /// that this application entity is expecting to receive.
    pub fn requestor_max_pdu_length(&self) -> u32 {
        self.requestor_max_pdu_length
    }

    /// Retrieve the user variables the peer answered with,
    /// including any accepted role selections.
    pub fn user_variables(&self) -> &[UserVariableItem] {
        &self.user_variables
    }

    /// The AE title of this node.
    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    /// The AE title of the peer node.
    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    /// Send a PDU message to the peer.
    ///
    /// The PDU must be legal for the current association state;
    /// in particular, no DIMSE traffic may be sent
    /// before establishment or after a release or abort was initiated.
    pub fn send(&mut self, msg: &Pdu) -> Result<()> {
        ensure!(
            pdu_legal_to_send(self.state, msg),
            IllegalSendSnafu {
                description: msg.short_description().to_string(),
                state: self.state,
            }
        );
        encode_pdu(&mut self.write_buffer, msg, self.acceptor_max_pdu_length)?;
        match self.socket.write_all(&self.write_buffer) {
            Ok(()) => {
                self.state = state_after_send(self.state, msg);
                Ok(())
            }
            Err(e) => {
                // an unusable transport is fatal to the association
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
    /// A peer-initiated abort surfaces [`Error::Aborted`].
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
            self.requestor_max_pdu_length,
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
                // either the peer initiates a release,
                // or both sides did (release collision);
                // in both cases the caller answers with A-RELEASE-RP
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

    /// Gracefully terminate the association
    /// by exchanging release messages
    /// and then shutting down the TCP connection.
    ///
    /// A release collision
    /// (both peers requesting a release within the same round trip)
    /// is resolved without deadlock:
    /// the peer's release request satisfies this node's wait.
    pub fn release(mut self) -> Result<()> {
        let out = self.release_impl();
        let _ = self.socket.shutdown();
        out
    }

    /// Send an abort message and shut down the TCP connection,
    /// terminating the association.
    pub fn abort(mut self) -> Result<()> {
        let pdu = Pdu::AbortRQ {
            source: AbortRQSource::ServiceUser,
        };
        let out = self.send(&pdu);
        self.state = AssociationState::Aborted;
        let _ = self.socket.shutdown();
        out
    }

    /// Obtain access to the inner stream
    /// connected to the association acceptor.
    ///
    /// This can be used to send the PDU in semantic fragments of the message,
    /// thus using less memory.
    ///
    /// **Note:** reading and writing should be done with care
    /// to avoid inconsistencies in the association state.
    /// Do not call `send` and `receive` while not in a PDU boundary.
    pub fn inner_stream(&mut self) -> &mut S {
        &mut self.socket
    }

    /// Prepare a P-Data writer for sending
    /// one or more data items.
    ///
    /// Returns a writer which automatically
    /// splits the inner data into separate PDUs if necessary.
    pub fn send_pdata(&mut self, presentation_context_id: u8) -> PDataWriter<&mut S> {
        PDataWriter::new(
            &mut self.socket,
            presentation_context_id,
            self.acceptor_max_pdu_length,
        )
    }

    /// Prepare a P-Data reader for receiving
    /// one or more data item PDUs.
    ///
    /// Returns a reader which automatically
    /// receives more data PDUs once the bytes collected are consumed.
    pub fn receive_pdata(&mut self) -> PDataReader<'_, &mut S> {
        let Self {
            socket,
            read_buffer,
            requestor_max_pdu_length,
            ..
        } = self;
        PDataReader::new(socket, read_buffer, *requestor_max_pdu_length)
    }

    /// The timeouts this association was established with.
    pub(crate) fn transport_options(&self) -> &TransportOptions {
        &self.transport_options
    }

    /// Whether PDUs are received in strict mode.
    pub(crate) fn is_strict(&self) -> bool {
        self.strict
    }

    /// Take any wire bytes already buffered but not yet decoded.
    pub(crate) fn take_read_buffer(&mut self) -> BytesMut {
        std::mem::take(&mut self.read_buffer)
    }

    /// Hand the transport over to another owner:
    /// dropping the association will no longer
    /// release the session nor shut the socket down.
    pub(crate) fn detach(&mut self) -> &S {
        self.detached = true;
        &self.socket
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
                    // collision: answer the peer and close
                    self.send(&Pdu::ReleaseRP)?;
                    return Ok(());
                }
                Pdu::PData { .. } => {
                    // in-flight data during release is discarded
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

    /// Send an A-ABORT to the peer (best effort),
    /// mark the association as aborted
    /// and shut down the transport.
    fn abort_now(&mut self) {
        abort_quietly(&mut self.socket, &mut self.write_buffer);
        self.state = AssociationState::Aborted;
    }
}

/// Automatically release the association and shut down the connection,
/// unless the transport was handed over to the DIMSE exchange layer.
impl<S> Drop for ClientAssociation<S>
where
    S: TransportStream,
{
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if self.state == AssociationState::Established {
            let _ = self.release_impl();
        }
        let _ = self.socket.shutdown();
    }
}
