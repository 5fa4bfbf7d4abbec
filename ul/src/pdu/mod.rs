//! Protocol data unit module
//!
//! This module comprises the data types for all protocol data units
//! (PDUs) defined in the DICOM upper layer protocol,
//! as well as readers and writers of PDUs from arbitrary data sources.
pub mod reader;
pub mod writer;

#[cfg(test)]
mod test;

pub use reader::read_pdu;
pub use writer::write_pdu;

/// The size of a PDU header in bytes: PDU type, reserved byte,
/// and the 4-byte PDU length.
pub const PDU_HEADER_SIZE: u32 = 6;

/// The default maximum PDU length admitted by an application entity.
pub const DEFAULT_MAX_PDU: u32 = 16_382;

/// The minimum admitted value for an application entity's
/// maximum PDU length.
pub const MINIMUM_PDU_SIZE: u32 = 4_096;

/// The hard ceiling for the maximum PDU length,
/// above which incoming PDUs are always refused.
pub const MAXIMUM_PDU_SIZE: u32 = 131_072;

/// An upper bound for the initial read buffer capacity,
/// so that permissive maximum PDU lengths
/// do not result in equally large allocations up front.
pub const LARGE_PDU_SIZE: u32 = 33_554_432;

/// The DICOM application context name,
/// the only one defined by the standard.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// An in-memory representation of a full protocol data unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    /// A-ASSOCIATE-RQ
    AssociationRQ(AssociationRQ),
    /// A-ASSOCIATE-AC
    AssociationAC(AssociationAC),
    /// A-ASSOCIATE-RJ
    AssociationRJ(AssociationRJ),
    /// P-DATA-TF
    PData {
        /// the presentation data values
        data: Vec<PDataValue>,
    },
    /// A-RELEASE-RQ
    ReleaseRQ,
    /// A-RELEASE-RP
    ReleaseRP,
    /// A-ABORT
    AbortRQ {
        /// the source of the abort
        source: AbortRQSource,
    },
    /// A PDU of an unrecognized type,
    /// retained in full for forward compatibility
    Unknown {
        /// the PDU type byte found
        pdu_type: u8,
        /// the PDU body, excluding the 6 bytes of the common header
        data: Vec<u8>,
    },
}

impl Pdu {
    /// Provide a short description of the PDU, for logging purposes.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::AssociationRQ(AssociationRQ {
                calling_ae_title,
                called_ae_title,
                presentation_contexts,
                ..
            }) => write!(
                f,
                "A-ASSOCIATE-RQ {} -> {} ({} presentation contexts)",
                calling_ae_title,
                called_ae_title,
                presentation_contexts.len(),
            ),
            Pdu::AssociationAC(AssociationAC {
                presentation_contexts,
                ..
            }) => write!(
                f,
                "A-ASSOCIATE-AC ({} presentation contexts)",
                presentation_contexts.len()
            ),
            Pdu::AssociationRJ(AssociationRJ { result, .. }) => {
                write!(f, "A-ASSOCIATE-RJ ({:?})", result)
            }
            Pdu::PData { data } => {
                let total: usize = data.iter().map(|pdv| pdv.data.len()).sum();
                write!(f, "P-DATA-TF ({} PDVs, {} bytes)", data.len(), total)
            }
            Pdu::ReleaseRQ => f.write_str("A-RELEASE-RQ"),
            Pdu::ReleaseRP => f.write_str("A-RELEASE-RP"),
            Pdu::AbortRQ { source } => write!(f, "A-ABORT ({:?})", source),
            Pdu::Unknown { pdu_type, data } => {
                write!(f, "Unknown PDU type {:#04x} ({} bytes)", pdu_type, data.len())
            }
        }
    }
}

/// The contents of an A-ASSOCIATE-RQ PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationRQ {
    /// the protocol version (bit 0 set for version 1)
    pub protocol_version: u16,
    /// the application entity title of the association requestor
    pub calling_ae_title: String,
    /// the application entity title of the intended acceptor
    pub called_ae_title: String,
    /// the application context name
    pub application_context_name: String,
    /// the list of proposed presentation contexts
    pub presentation_contexts: Vec<PresentationContextProposed>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationRQ> for Pdu {
    fn from(value: AssociationRQ) -> Self {
        Pdu::AssociationRQ(value)
    }
}

/// The contents of an A-ASSOCIATE-AC PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct AssociationAC {
    /// the protocol version (bit 0 set for version 1)
    pub protocol_version: u16,
    /// the calling AE title mirrored from the request
    /// (a reserved field, not to be tested by receivers)
    pub calling_ae_title: String,
    /// the called AE title mirrored from the request
    /// (a reserved field, not to be tested by receivers)
    pub called_ae_title: String,
    /// the application context name
    pub application_context_name: String,
    /// the presentation context negotiation results
    pub presentation_contexts: Vec<PresentationContextResult>,
    /// the user information sub-items
    pub user_variables: Vec<UserVariableItem>,
}

impl From<AssociationAC> for Pdu {
    fn from(value: AssociationAC) -> Self {
        Pdu::AssociationAC(value)
    }
}

/// The contents of an A-ASSOCIATE-RJ PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociationRJ {
    /// whether the rejection is transient or permanent
    pub result: AssociationRJResult,
    /// the source of the rejection, with the associated reason
    pub source: AssociationRJSource,
}

impl From<AssociationRJ> for Pdu {
    fn from(value: AssociationRJ) -> Self {
        Pdu::AssociationRJ(value)
    }
}

/// A presentation context as proposed in an A-ASSOCIATE-RQ:
/// one abstract syntax with one or more candidate transfer syntaxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextProposed {
    /// the presentation context ID (odd integer between 1 and 255)
    pub id: u8,
    /// the abstract syntax UID
    pub abstract_syntax: String,
    /// the candidate transfer syntax UIDs
    pub transfer_syntaxes: Vec<String>,
}

/// A presentation context negotiation result
/// as found in an A-ASSOCIATE-AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextResult {
    /// the presentation context ID matching the proposal
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the single transfer syntax selected by the acceptor
    /// (not significant unless the context was accepted)
    pub transfer_syntax: String,
}

/// A fully negotiated presentation context,
/// joining the abstract syntax from the proposal
/// with the result returned by the acceptor
/// and the outcome of role selection negotiation.
///
/// Values of this type are immutable views produced at negotiation time;
/// accepted contexts do not change for the lifetime of the association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentationContextNegotiated {
    /// the presentation context ID
    pub id: u8,
    /// the outcome of the negotiation for this context
    pub reason: PresentationContextResultReason,
    /// the abstract syntax UID from the proposal
    pub abstract_syntax: String,
    /// the transfer syntax selected by the acceptor
    pub transfer_syntax: String,
    /// whether this application entity may act as an SCU
    /// on this context (Part 7 Annex D role selection)
    pub scu_role: bool,
    /// whether this application entity may act as an SCP
    /// on this context (Part 7 Annex D role selection)
    pub scp_role: bool,
}

/// The reason of a presentation context negotiation result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentationContextResultReason {
    /// The presentation context was accepted.
    Acceptance = 0,
    /// User rejection.
    UserRejection = 1,
    /// Provider rejection, no reason given.
    NoReason = 2,
    /// The abstract syntax is not supported.
    AbstractSyntaxNotSupported = 3,
    /// None of the proposed transfer syntaxes are supported.
    TransferSyntaxesNotSupported = 4,
}

impl PresentationContextResultReason {
    pub(crate) fn from(reason: u8) -> Option<Self> {
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

/// The result of an association rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJResult {
    /// Rejected permanently: retrying is not expected to succeed.
    Permanent = 1,
    /// Rejected transiently: the association may be retried later.
    Transient = 2,
}

impl AssociationRJResult {
    pub(crate) fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(AssociationRJResult::Permanent),
            2 => Some(AssociationRJResult::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection,
/// carrying the respective reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJSource {
    /// The DICOM UL service user rejected the association.
    ServiceUser(AssociationRJServiceUserReason),
    /// The DICOM UL service provider rejected the association
    /// (ACSE related function).
    ServiceProviderAsce(AssociationRJServiceProviderAsceReason),
    /// The DICOM UL service provider rejected the association
    /// (presentation related function).
    ServiceProviderPresentation(AssociationRJServiceProviderPresentationReason),
}

impl AssociationRJSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (1, 1) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::NoReasonGiven,
            )),
            (1, 2) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::ApplicationContextNameNotSupported,
            )),
            (1, 3) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CallingAeTitleNotRecognized,
            )),
            (1, 7) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::CalledAeTitleNotRecognized,
            )),
            (1, x @ 4..=6) | (1, x @ 8..=10) => Some(AssociationRJSource::ServiceUser(
                AssociationRJServiceUserReason::Reserved(x),
            )),
            (2, 1) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::NoReasonGiven,
            )),
            (2, 2) => Some(AssociationRJSource::ServiceProviderAsce(
                AssociationRJServiceProviderAsceReason::ProtocolVersionNotSupported,
            )),
            (3, 1) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::TemporaryCongestion,
            )),
            (3, 2) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
            )),
            (3, x @ 0) | (3, x @ 3..=7) => Some(AssociationRJSource::ServiceProviderPresentation(
                AssociationRJServiceProviderPresentationReason::Reserved(x),
            )),
            _ => None,
        }
    }
}

impl std::fmt::Display for AssociationRJSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssociationRJSource::ServiceUser(r) => write!(f, "by the service user: {:?}", r),
            AssociationRJSource::ServiceProviderAsce(r) => {
                write!(f, "by the service provider (ACSE): {:?}", r)
            }
            AssociationRJSource::ServiceProviderPresentation(r) => {
                write!(f, "by the service provider (presentation): {:?}", r)
            }
        }
    }
}

/// A rejection reason given by the UL service user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceUserReason {
    /// No reason given.
    NoReasonGiven,
    /// The application context name is not supported.
    ApplicationContextNameNotSupported,
    /// The calling AE title is not recognized.
    CallingAeTitleNotRecognized,
    /// The called AE title is not recognized.
    CalledAeTitleNotRecognized,
    /// A reserved reason code.
    Reserved(u8),
}

/// A rejection reason given by the UL service provider,
/// ACSE related function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderAsceReason {
    /// No reason given.
    NoReasonGiven,
    /// The protocol version is not supported.
    ProtocolVersionNotSupported,
}

/// A rejection reason given by the UL service provider,
/// presentation related function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssociationRJServiceProviderPresentationReason {
    /// Temporary congestion.
    TemporaryCongestion,
    /// Local limit exceeded.
    LocalLimitExceeded,
    /// A reserved reason code.
    Reserved(u8),
}

/// A presentation data value, one fragment of a P-DATA-TF PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PDataValue {
    /// the presentation context ID of the message this fragment is part of
    pub presentation_context_id: u8,
    /// whether the fragment carries command or data set bytes
    pub value_type: PDataValueType,
    /// whether this is the last fragment
    /// of the respective command or data set
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of content carried by a presentation data value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PDataValueType {
    /// Command set bytes (always Implicit VR Little Endian).
    Command,
    /// Data set bytes in the context's negotiated transfer syntax.
    Data,
}

/// The source of an A-ABORT PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortRQSource {
    /// The abort was initiated by the UL service user.
    ServiceUser,
    /// The abort was initiated by the UL service provider,
    /// with the given reason.
    ServiceProvider(AbortRQServiceProviderReason),
    /// A reserved source code.
    Reserved,
}

impl AbortRQSource {
    pub(crate) fn from(source: u8, reason: u8) -> Option<Self> {
        match (source, reason) {
            (0, _) => Some(AbortRQSource::ServiceUser),
            (1, _) => Some(AbortRQSource::Reserved),
            (2, 0) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::ReasonNotSpecified,
            )),
            (2, 1) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPdu,
            )),
            (2, 2) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPdu,
            )),
            (2, 3) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::Reserved,
            )),
            (2, 4) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnrecognizedPduParameter,
            )),
            (2, 5) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::UnexpectedPduParameter,
            )),
            (2, 6) => Some(AbortRQSource::ServiceProvider(
                AbortRQServiceProviderReason::InvalidPduParameter,
            )),
            _ => None,
        }
    }
}

/// An abort reason given by the UL service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortRQServiceProviderReason {
    /// Reason not specified.
    ReasonNotSpecified,
    /// The PDU was not recognized.
    UnrecognizedPdu,
    /// The PDU was not expected in the current state.
    UnexpectedPdu,
    /// A reserved reason code.
    Reserved,
    /// A PDU parameter was not recognized.
    UnrecognizedPduParameter,
    /// A PDU parameter was not expected.
    UnexpectedPduParameter,
    /// A PDU parameter had an invalid value.
    InvalidPduParameter,
}

/// A user information sub-item
/// as found in A-ASSOCIATE-RQ and A-ASSOCIATE-AC PDUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserVariableItem {
    /// Maximum Length (0x51): the maximum PDU length
    /// this application entity is willing to receive
    /// (0 means unlimited).
    MaxLength(u32),
    /// Implementation Class UID (0x52).
    ImplementationClassUid(String),
    /// Asynchronous Operations Window (0x53):
    /// maximum operations invoked and maximum operations performed.
    AsyncOperationsWindow(u16, u16),
    /// SCP/SCU Role Selection (0x54) for one abstract syntax.
    RoleSelection(RoleSelection),
    /// Implementation Version Name (0x55).
    ImplementationVersionName(String),
    /// SOP Class Extended Negotiation (0x56).
    SopClassExtendedNegotiation(SopClassExtendedNegotiation),
    /// SOP Class Common Extended Negotiation (0x57).
    SopClassCommonExtendedNegotiation(SopClassCommonExtendedNegotiation),
    /// User Identity negotiation request (0x58).
    UserIdentity(UserIdentity),
    /// User Identity negotiation response (0x59):
    /// the server response field.
    UserIdentityResponse(Vec<u8>),
    /// A sub-item of an unrecognized type,
    /// preserved verbatim so that it can be re-emitted unchanged.
    Unknown(u8, Vec<u8>),
}

/// An SCP/SCU role selection for a single abstract syntax
/// (Part 7 Annex D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSelection {
    /// the abstract syntax UID that the roles apply to
    pub sop_class_uid: String,
    /// whether the emitter proposes or accepts the SCU role
    pub scu_role: bool,
    /// whether the emitter proposes or accepts the SCP role
    pub scp_role: bool,
}

/// An SOP Class Extended Negotiation sub-item (Part 7 Annex D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SopClassExtendedNegotiation {
    /// the SOP class UID the information applies to
    pub sop_class_uid: String,
    /// service class application information, opaque at this layer
    pub application_information: Vec<u8>,
}

/// An SOP Class Common Extended Negotiation sub-item (Part 7 Annex D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SopClassCommonExtendedNegotiation {
    /// the SOP class UID the information applies to
    pub sop_class_uid: String,
    /// the service class UID
    pub service_class_uid: String,
    /// related general SOP class UIDs
    pub related_general_sop_classes: Vec<String>,
}

/// The type of user identity provided in negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserIdentityType {
    /// Username only.
    Username = 1,
    /// Username and passcode.
    UsernamePassword = 2,
    /// Kerberos service ticket.
    KerberosServiceTicket = 3,
    /// SAML assertion.
    SamlAssertion = 4,
    /// JSON Web Token.
    Jwt = 5,
}

impl UserIdentityType {
    pub(crate) fn from(value: u8) -> Option<Self> {
        match value {
            1 => Some(UserIdentityType::Username),
            2 => Some(UserIdentityType::UsernamePassword),
            3 => Some(UserIdentityType::KerberosServiceTicket),
            4 => Some(UserIdentityType::SamlAssertion),
            5 => Some(UserIdentityType::Jwt),
            _ => None,
        }
    }
}

/// A user identity negotiation request (sub-item 0x58).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    /// whether a positive server response is requested
    positive_response_requested: bool,
    /// the form of identity being provided
    identity_type: UserIdentityType,
    /// the primary identity field (username, ticket, assertion or token)
    primary_field: Vec<u8>,
    /// the secondary identity field (the passcode, when applicable)
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    /// Create a new user identity negotiation item.
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

    /// Whether a positive server response was requested.
    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    /// The form of identity being provided.
    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    /// The primary identity field.
    pub fn primary_field(&self) -> &[u8] {
        &self.primary_field
    }

    /// The secondary identity field.
    pub fn secondary_field(&self) -> &[u8] {
        &self.secondary_field
    }
}
