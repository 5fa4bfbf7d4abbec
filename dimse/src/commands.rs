//! Command field and status vocabulary of the DIMSE services.

/// The priority of a composite service request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Priority {
    /// Low priority (0x0002).
    Low = 0x0002,
    /// Medium priority (0x0000), the default.
    Medium = 0x0000,
    /// High priority (0x0001).
    High = 0x0001,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// The value of the Command Field (0000,0100) element,
/// identifying the DIMSE service and direction of a message.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommandField {
    CStoreRq = 0x0001,
    CStoreRsp = 0x8001,
    CGetRq = 0x0010,
    CGetRsp = 0x8010,
    CFindRq = 0x0020,
    CFindRsp = 0x8020,
    CMoveRq = 0x0021,
    CMoveRsp = 0x8021,
    CEchoRq = 0x0030,
    CEchoRsp = 0x8030,
    NEventReportRq = 0x0100,
    NEventReportRsp = 0x8100,
    NGetRq = 0x0110,
    NGetRsp = 0x8110,
    NSetRq = 0x0120,
    NSetRsp = 0x8120,
    NActionRq = 0x0130,
    NActionRsp = 0x8130,
    NCreateRq = 0x0140,
    NCreateRsp = 0x8140,
    NDeleteRq = 0x0150,
    NDeleteRsp = 0x8150,
    CCancelRq = 0x0FFF,
}

impl CommandField {
    /// Whether this command field identifies a response message.
    pub fn is_response(self) -> bool {
        (self as u16) & 0x8000 != 0
    }

    /// Whether this command field identifies a request message
    /// (including C-CANCEL-RQ).
    pub fn is_request(self) -> bool {
        !self.is_response()
    }
}

impl TryFrom<u16> for CommandField {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(CommandField::CStoreRq),
            0x8001 => Ok(CommandField::CStoreRsp),
            0x0010 => Ok(CommandField::CGetRq),
            0x8010 => Ok(CommandField::CGetRsp),
            0x0020 => Ok(CommandField::CFindRq),
            0x8020 => Ok(CommandField::CFindRsp),
            0x0021 => Ok(CommandField::CMoveRq),
            0x8021 => Ok(CommandField::CMoveRsp),
            0x0030 => Ok(CommandField::CEchoRq),
            0x8030 => Ok(CommandField::CEchoRsp),
            0x0100 => Ok(CommandField::NEventReportRq),
            0x8100 => Ok(CommandField::NEventReportRsp),
            0x0110 => Ok(CommandField::NGetRq),
            0x8110 => Ok(CommandField::NGetRsp),
            0x0120 => Ok(CommandField::NSetRq),
            0x8120 => Ok(CommandField::NSetRsp),
            0x0130 => Ok(CommandField::NActionRq),
            0x8130 => Ok(CommandField::NActionRsp),
            0x0140 => Ok(CommandField::NCreateRq),
            0x8140 => Ok(CommandField::NCreateRsp),
            0x0150 => Ok(CommandField::NDeleteRq),
            0x8150 => Ok(CommandField::NDeleteRsp),
            0x0FFF => Ok(CommandField::CCancelRq),
            other => Err(other),
        }
    }
}

/// The broad category of a DIMSE status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// The operation completed (0x0000).
    Success,
    /// More responses follow (0xFF00, 0xFF01).
    Pending,
    /// The operation completed with warnings.
    Warning,
    /// The operation failed.
    Failure,
    /// The operation was cancelled (0xFE00).
    Cancel,
}

/// A DIMSE status code, as carried in the Status (0000,0900) element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u16);

impl Status {
    /// Success.
    pub const SUCCESS: Status = Status(0x0000);
    /// Pending: more responses follow.
    pub const PENDING: Status = Status(0xFF00);
    /// Pending, with optional keys unsupported.
    pub const PENDING_WARNING: Status = Status(0xFF01);
    /// The operation was cancelled.
    pub const CANCEL: Status = Status(0xFE00);
    /// Refused: SOP class not supported.
    pub const SOP_CLASS_NOT_SUPPORTED: Status = Status(0x0122);
    /// Failure: unable to process.
    pub const PROCESSING_FAILURE: Status = Status(0x0110);
    /// Refused: out of resources.
    pub const OUT_OF_RESOURCES: Status = Status(0xA700);

    /// The broad category of this status code.
    pub fn class(self) -> StatusClass {
        match self.0 {
            0x0000 => StatusClass::Success,
            0xFF00 | 0xFF01 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusClass::Warning,
            0xB000..=0xBFFF => StatusClass::Warning,
            _ => StatusClass::Failure,
        }
    }

    /// Whether more responses are to follow this one.
    pub fn is_pending(self) -> bool {
        self.class() == StatusClass::Pending
    }

    /// Whether the operation completed successfully.
    pub fn is_success(self) -> bool {
        self.class() == StatusClass::Success
    }

    /// Whether this status ends a response stream.
    pub fn is_terminal(self) -> bool {
        !self.is_pending()
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        Status(code)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04X}H", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_field_codes_roundtrip() {
        for field in [
            CommandField::CStoreRq,
            CommandField::CStoreRsp,
            CommandField::CGetRq,
            CommandField::CFindRsp,
            CommandField::CMoveRq,
            CommandField::CEchoRq,
            CommandField::NEventReportRq,
            CommandField::NGetRsp,
            CommandField::NSetRq,
            CommandField::NActionRsp,
            CommandField::NCreateRq,
            CommandField::NDeleteRsp,
            CommandField::CCancelRq,
        ] {
            assert_eq!(CommandField::try_from(field as u16), Ok(field));
        }
        assert_eq!(CommandField::try_from(0x4242), Err(0x4242));
    }

    #[test]
    fn cancel_is_a_request() {
        assert!(CommandField::CCancelRq.is_request());
        assert!(CommandField::CStoreRsp.is_response());
        assert!(CommandField::CStoreRq.is_request());
    }

    #[test]
    fn status_classification() {
        assert_eq!(Status(0x0000).class(), StatusClass::Success);
        assert_eq!(Status(0xFF00).class(), StatusClass::Pending);
        assert_eq!(Status(0xFF01).class(), StatusClass::Pending);
        assert_eq!(Status(0xFE00).class(), StatusClass::Cancel);
        assert_eq!(Status(0xB007).class(), StatusClass::Warning);
        assert_eq!(Status(0x0107).class(), StatusClass::Warning);
        assert_eq!(Status(0xA700).class(), StatusClass::Failure);
        assert_eq!(Status(0xC123).class(), StatusClass::Failure);
        assert_eq!(Status(0x0122).class(), StatusClass::Failure);
    }
}
