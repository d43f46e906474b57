//! Protocol data unit module
//!
//! This module comprises the data structures representing
//! the protocol data units (PDUs) of the upper layer protocol,
//! as well as the readers and writers
//! translating them from and to their binary frame format.
//! All PDUs are length-prefixed,
//! with multi-byte numeric fields in big endian.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The default maximum PDU size
pub const DEFAULT_MAX_PDU: u32 = 16_384;

/// The minimum PDU size,
/// as specified by the standard
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The maximum PDU size,
/// as specified by the standard
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

/// An in-memory representation of a full protocol data unit.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Pdu {
    /// Unrecognized PDU type
    Unknown { pdu_type: u8, data: Vec<u8> },
    /// Association request (A-ASSOCIATE-RQ)
    AssociationRQ(AssociationRQ),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociationAC(AssociationAC),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociationRJ(AssociationRJ),
    /// P-Data (P-DATA-TF)
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRQ,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRP,
    /// Association abort (A-ABORT)
    AbortRQ { source: AbortRQSource },
}

impl Pdu {
    /// Provide a short description of the PDU,
    /// which elides P-Data fragment contents.
    pub fn short_description(&self) -> impl Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::PData { data } => {
                write!(f, "PData [")?;
                for (i, pdv) in data.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "({:?}, {} bytes)", pdv.value_type, pdv.data.len())?;
                }
                write!(f, "]")
            }
            pdu => std::fmt::Debug::fmt(pdu, f),
        }
    }
}

/// An in-memory representation of an association request.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRQ {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// An in-memory representation of an association acknowledgement.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationAC {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq)]
pub struct AssociationRJ {
    pub result: AssociationRJResult,
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// Message component for a proposed presentation context.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextProposed {
    /// the presentation context identifier,
    /// an odd integer between 1 and 255
    pub id: u8,
    /// the proposed abstract syntax UID
    /// (commonly referring to the requested SOP class)
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs for this context,
    /// in order of preference of the proposer
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the outcome of a single
/// presentation context negotiation.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier,
    /// as proposed by the requestor
    pub id: u8,
    /// whether the context was accepted, and if not, why
    pub reason: PresentationContextResultReason,
    /// the transfer syntax chosen for this context,
    /// only significant on acceptance
    pub transfer_syntax: String,
}

impl PresentationContextResult {
    /// Whether this context was accepted by the peer.
    pub fn is_accepted(&self) -> bool {
        self.reason == PresentationContextResultReason::Acceptance
    }
}

/// The reason field of a presentation context result.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PresentationContextResultReason {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    fn from_code(reason: u8) -> Option<Self> {
        match reason {
            0 => Some(PresentationContextResultReason::Acceptance),
            1 => Some(PresentationContextResultReason::UserRejection),
            2 => Some(PresentationContextResultReason::NoReason),
            3 => Some(PresentationContextResultReason::AbstractSyntaxNotSupported),
            4 => Some(PresentationContextResultReason::TransferSyntaxesNotSupported),
            _ => None,
        }
    }
}

impl Display for PresentationContextResultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            PresentationContextResultReason::Acceptance => "acceptance",
            PresentationContextResultReason::UserRejection => "user rejection",
            PresentationContextResultReason::NoReason => "no reason",
            PresentationContextResultReason::AbstractSyntaxNotSupported => {
                "abstract syntax not supported"
            }
            PresentationContextResultReason::TransferSyntaxesNotSupported => {
                "transfer syntaxes not supported"
            }
        };
        f.write_str(msg)
    }
}

/// The result field of an association rejection.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJResult {
    /// rejected-permanent
    Permanent = 1,
    /// rejected-transient
    Transient = 2,
}

impl AssociationRJResult {
    fn from_code(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source and reason/diagnostic fields of an association rejection.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJSource {
    /// DICOM UL service-user
    ServiceUser(AssociationRJServiceUserReason),
    /// DICOM UL service-provider (ACSE related function)
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// DICOM UL service-provider (presentation related function)
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    fn from_codes(source: u8, reason: u8) -> Option<Self> {
        use AssociationRJServiceUserReason as User;
        let out = match (source, reason) {
            (1, 1) => AssociationRJSource::ServiceUser(User::NoReasonGiven),
            (1, 2) => AssociationRJSource::ServiceUser(User::ApplicationContextNameNotSupported),
            (1, 3) => AssociationRJSource::ServiceUser(User::CallingAETitleNotRecognized),
            (1, 7) => AssociationRJSource::ServiceUser(User::CalledAETitleNotRecognized),
            (1, x @ 4..=6) | (1, x @ 8..=10) => AssociationRJSource::ServiceUser(User::Reserved(x)),
            (2, 1) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            ),
            (2, 2) => AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            ),
            (3, 1) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            ),
            (3, 2) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            ),
            (3, x @ 0) | (3, x @ 3..=7) => AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            ),
            _ => return None,
        };
        Some(out)
    }

    fn codes(&self) -> (u8, u8) {
        use AssociationRJServiceUserReason as User;
        match self {
            AssociationRJSource::ServiceUser(r) => {
                let reason = match r {
                    User::NoReasonGiven => 1,
                    User::ApplicationContextNameNotSupported => 2,
                    User::CallingAETitleNotRecognized => 3,
                    User::CalledAETitleNotRecognized => 7,
                    User::Reserved(x) => *x,
                };
                (1, reason)
            }
            AssociationRJSource::ServiceProviderAsce(r) => {
                let reason = match r {
                    AssociationRJServiceProviderAsceReason::NoReasonGiven => 1,
                    AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => 2,
                };
                (2, reason)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                let reason = match r {
                    AssociationRJServiceProviderPresentationReason::TemporaryCongestion => 1,
                    AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => 2,
                    AssociationRJServiceProviderPresentationReason::Reserved(x) => *x,
                };
                (3, reason)
            }
        }
    }
}

impl Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderAsce(r) => Display::fmt(r, f),
            AssociationRJSource::ServiceProviderPresentation(r) => Display::fmt(r, f),
        }
    }
}

/// Association rejection reasons attributed to the service user.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceUserReason {
    NoReasonGiven,
    ApplicationContextNameNotSupported,
    CallingAETitleNotRecognized,
    CalledAETitleNotRecognized,
    Reserved(u8),
}

impl Display for AssociationRJServiceUserReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceUserReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceUserReason::ApplicationContextNameNotSupported => {
                f.write_str("application context name not supported")
            }
            AssociationRJServiceUserReason::CallingAETitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            AssociationRJServiceUserReason::CalledAETitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            AssociationRJServiceUserReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// Association rejection reasons attributed to the service provider
/// (ACSE related function).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderAsceReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AssociationRJServiceProviderAsceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderAsceReason::NoReasonGiven => f.write_str("no reason given"),
            AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

/// Association rejection reasons attributed to the service provider
/// (presentation related function).
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AssociationRJServiceProviderPresentationReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for AssociationRJServiceProviderPresentationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJServiceProviderPresentationReason::TemporaryCongestion => {
                f.write_str("temporary congestion")
            }
            AssociationRJServiceProviderPresentationReason::LocalLimitExceeded => {
                f.write_str("local limit exceeded")
            }
            AssociationRJServiceProviderPresentationReason::Reserved(code) => {
                write!(f, "reserved code {}", code)
            }
        }
    }
}

/// A presentation data value fragment in a P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct PDataValue {
    /// the identifier of the presentation context this fragment
    /// travels on
    pub presentation_context_id: u8,
    /// whether the fragment carries command set or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment of the command set or data
    /// set it belongs to
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// Whether a presentation data value fragment belongs to
/// a command set or a data set.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum PDataValueType {
    Command,
    Data,
}

/// The source (and provider reason) fields of an A-ABORT PDU.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQSource {
    /// DICOM UL service-user initiated abort
    ServiceUser,
    /// DICOM UL service-provider initiated abort
    ServiceProvider(AbortRQServiceProviderReason),
    /// reserved source code
    Reserved,
}

impl AbortRQSource {
    fn from_codes(source: u8, reason: u8) -> Option<Self> {
        use AbortRQServiceProviderReason as Provider;
        let out = match (source, reason) {
            (0, _) => AbortRQSource::ServiceUser,
            (1, _) => AbortRQSource::Reserved,
            (2, 0) => AbortRQSource::ServiceProvider(Provider::ReasonNotSpecified),
            (2, 1) => AbortRQSource::ServiceProvider(Provider::UnrecognizedPdu),
            (2, 2) => AbortRQSource::ServiceProvider(Provider::UnexpectedPdu),
            (2, 3) => AbortRQSource::ServiceProvider(Provider::Reserved),
            (2, 4) => AbortRQSource::ServiceProvider(Provider::UnrecognizedPduParameter),
            (2, 5) => AbortRQSource::ServiceProvider(Provider::UnexpectedPduParameter),
            (2, 6) => AbortRQSource::ServiceProvider(Provider::InvalidPduParameter),
            (_, _) => return None,
        };
        Some(out)
    }

    fn codes(&self) -> (u8, u8) {
        use AbortRQServiceProviderReason as Provider;
        match self {
            AbortRQSource::ServiceUser => (0, 0),
            AbortRQSource::Reserved => (1, 0),
            AbortRQSource::ServiceProvider(reason) => {
                let reason = match reason {
                    Provider::ReasonNotSpecified => 0,
                    Provider::UnrecognizedPdu => 1,
                    Provider::UnexpectedPdu => 2,
                    Provider::Reserved => 3,
                    Provider::UnrecognizedPduParameter => 4,
                    Provider::UnexpectedPduParameter => 5,
                    Provider::InvalidPduParameter => 6,
                };
                (2, reason)
            }
        }
    }
}

/// An enumeration of supported A-ABORT provider reasons.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum AbortRQServiceProviderReason {
    /// Reason not specified
    ReasonNotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl Display for AbortRQServiceProviderReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortRQServiceProviderReason::ReasonNotSpecified => "reason not specified",
            AbortRQServiceProviderReason::UnrecognizedPdu => "unrecognized PDU",
            AbortRQServiceProviderReason::UnexpectedPdu => "unexpected PDU",
            AbortRQServiceProviderReason::Reserved => "reserved code",
            AbortRQServiceProviderReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            AbortRQServiceProviderReason::UnexpectedPduParameter => "unexpected PDU parameter",
            AbortRQServiceProviderReason::InvalidPduParameter => "invalid PDU parameter",
        };
        f.write_str(msg)
    }
}

/// A variable item in the body of an association request or response.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum PduVariableItem {
    Unknown(u8),
    ApplicationContext(String),
    PresentationContextProposed(PresentationContextProposed),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariableItem>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub enum UserVariableItem {
    /// an unrecognized sub-item, kept with its type code and raw data
    Unknown(u8, Vec<u8>),
    /// Maximum Length (0x51):
    /// the maximum PDU length the emitting node is willing to receive,
    /// where 0 means unlimited
    MaxLength(u32),
    /// Implementation Class UID (0x52)
    ImplementationClassUID(String),
    /// Asynchronous Operations Window (0x53):
    /// maximum number of operations invoked and performed
    AsyncOperationsWindow(u16, u16),
    /// SCP/SCU Role Selection (0x54)
    RoleSelection(RoleSelection),
    /// Implementation Version Name (0x55)
    ImplementationVersionName(String),
    /// SOP Class Extended Negotiation (0x56)
    SopClassExtendedNegotiationSubItem(String, Vec<u8>),
    /// SOP Class Common Extended Negotiation (0x57)
    SopClassCommonExtendedNegotiationSubItem(SopClassCommonExtendedNegotiation),
    /// User Identity Negotiation (0x58)
    UserIdentityItem(UserIdentity),
}

/// An SCP/SCU role selection sub-item,
/// proposing or acknowledging the roles to take
/// for one SOP class.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class UID the roles apply to
    pub sop_class_uid: String,
    /// whether the emitting node takes (or accepts) the SCU role
    pub scu_role: bool,
    /// whether the emitting node takes (or accepts) the SCP role
    pub scp_role: bool,
}

/// An SOP class common extended negotiation sub-item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct SopClassCommonExtendedNegotiation {
    pub sop_class_uid: String,
    pub service_class_uid: String,
    pub related_general_sop_class_uids: Vec<String>,
}

/// A user identity negotiation sub-item.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}

/// The type discriminant of a user identity sub-item.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    Username,
    UsernamePassword,
    KerberosServiceTicket,
    SamlAssertion,
    Jwt,
}

impl UserIdentityType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePassword => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}
