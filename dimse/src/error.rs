//! The error taxonomy of the message exchange layer.
use netdicom_ul::pdu::AbortRQSource;
use snafu::{Backtrace, Snafu};

/// An error which may occur while exchanging DIMSE messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// An error at the association level.
    /// Fatal to the association.
    #[snafu(display("association error: {}", source))]
    Association {
        #[snafu(backtrace)]
        source: netdicom_ul::association::Error,
    },

    #[snafu(display("failed to encode command set: {}", source))]
    EncodeCommand {
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to decode command set: {}", source))]
    DecodeCommand {
        source: Box<dicom_object::ReadError>,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to encode data set: {}", source))]
    EncodeDataSet {
        source: Box<dicom_object::WriteError>,
        backtrace: Backtrace,
    },

    #[snafu(display("failed to decode data set: {}", source))]
    DecodeDataSet {
        source: Box<dicom_object::ReadError>,
        backtrace: Backtrace,
    },

    #[snafu(display("missing command set element `{}`", name))]
    MissingCommandElement {
        name: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("invalid value in command set element `{}`: {}", name, source))]
    ConvertCommandElement {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
        backtrace: Backtrace,
    },

    #[snafu(display("unknown command field {:#06x}", value))]
    UnknownCommandField { value: u16, backtrace: Backtrace },

    #[snafu(display("data set is missing attribute `{}`", name))]
    MissingAttribute {
        name: &'static str,
        backtrace: Backtrace,
    },

    /// no accepted presentation context matches the request
    #[snafu(display("no accepted presentation context for `{}`", sop_class_uid))]
    NoMatchingPresentationContext {
        sop_class_uid: String,
        backtrace: Backtrace,
    },

    #[snafu(display("unsupported transfer syntax `{}`", uid))]
    UnsupportedTransferSyntax { uid: String, backtrace: Backtrace },

    /// message reassembly failed; the association is aborted
    #[snafu(display("message reassembly failed: {}", source))]
    Assembly {
        #[snafu(backtrace)]
        source: crate::assembler::AssemblyError,
    },

    #[snafu(display(
        "response correlates to unknown message ID {} on presentation context {}",
        message_id,
        presentation_context_id
    ))]
    UnexpectedResponse {
        presentation_context_id: u8,
        message_id: u16,
        backtrace: Backtrace,
    },

    /// the association was aborted by the peer
    #[snafu(display("association aborted by the peer ({:?})", source_info))]
    AssociationAborted {
        source_info: AbortRQSource,
        backtrace: Backtrace,
    },

    /// the peer requested a release while a request was outstanding
    ReleasedByPeer { backtrace: Backtrace },

    /// no response arrived within the DIMSE timeout;
    /// the association has been aborted
    DimseTimeout { backtrace: Backtrace },

    /// failed to set up the server socket
    StartServer {
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

impl Error {
    /// Whether the error implies the association is no longer usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Association { .. }
            | Error::Assembly { .. }
            | Error::UnexpectedResponse { .. }
            | Error::AssociationAborted { .. }
            | Error::ReleasedByPeer { .. }
            | Error::DimseTimeout { .. } => true,
            _ => false,
        }
    }
}
