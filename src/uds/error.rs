use std::fmt;

/// UDS Negative Response Codes (ISO 14229)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum NegativeResponseCode {
    GeneralReject,                             // 0x10
    ServiceNotSupported,                       // 0x11
    SubFunctionNotSupported,                   // 0x12
    IncorrectMessageLengthOrInvalidFormat,     // 0x13
    ResponseTooLong,                           // 0x14
    BusyRepeatRequest,                         // 0x21
    ConditionsNotCorrect,                      // 0x22
    RequestSequenceError,                      // 0x24
    NoResponseFromSubnetComponent,             // 0x25
    FailurePreventsExecutionOfRequestedAction, // 0x26
    RequestOutOfRange,                         // 0x31
    SecurityAccessDenied,                      // 0x33
    AuthenticationRequired,                    // 0x34
    InvalidKey,                                // 0x35
    ExceededNumberOfAttempts,                  // 0x36
    RequiredTimeDelayNotExpired,               // 0x37
    SecureDataTransmissionRequired,            // 0x38
    SecureDataTransmissionNotAllowed,          // 0x39
    SecureDataVerificationFailed,              // 0x3A
    UploadDownloadNotAccepted,                 // 0x70
    TransferDataSuspended,                     // 0x71
    GeneralProgrammingFailure,                 // 0x72
    WrongBlockSequenceCounter,                 // 0x73
    RequestCorrectlyReceivedResponsePending,   // 0x78
    SubFunctionNotSupportedInActiveSession,    // 0x7E
    ServiceNotSupportedInActiveSession,        // 0x7F
    Unknown(u8),
}

impl NegativeResponseCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnetComponent,
            0x26 => Self::FailurePreventsExecutionOfRequestedAction,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x34 => Self::AuthenticationRequired,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x38 => Self::SecureDataTransmissionRequired,
            0x39 => Self::SecureDataTransmissionNotAllowed,
            0x3A => Self::SecureDataVerificationFailed,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::Unknown(other),
        }
    }

    pub fn to_byte(&self) -> u8 {
        match self {
            Self::GeneralReject => 0x10,
            Self::ServiceNotSupported => 0x11,
            Self::SubFunctionNotSupported => 0x12,
            Self::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Self::ResponseTooLong => 0x14,
            Self::BusyRepeatRequest => 0x21,
            Self::ConditionsNotCorrect => 0x22,
            Self::RequestSequenceError => 0x24,
            Self::NoResponseFromSubnetComponent => 0x25,
            Self::FailurePreventsExecutionOfRequestedAction => 0x26,
            Self::RequestOutOfRange => 0x31,
            Self::SecurityAccessDenied => 0x33,
            Self::AuthenticationRequired => 0x34,
            Self::InvalidKey => 0x35,
            Self::ExceededNumberOfAttempts => 0x36,
            Self::RequiredTimeDelayNotExpired => 0x37,
            Self::SecureDataTransmissionRequired => 0x38,
            Self::SecureDataTransmissionNotAllowed => 0x39,
            Self::SecureDataVerificationFailed => 0x3A,
            Self::UploadDownloadNotAccepted => 0x70,
            Self::TransferDataSuspended => 0x71,
            Self::GeneralProgrammingFailure => 0x72,
            Self::WrongBlockSequenceCounter => 0x73,
            Self::RequestCorrectlyReceivedResponsePending => 0x78,
            Self::SubFunctionNotSupportedInActiveSession => 0x7E,
            Self::ServiceNotSupportedInActiveSession => 0x7F,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::RequestCorrectlyReceivedResponsePending)
    }

    /// ISO 14229 mnemonic, as printed in test reports
    pub fn name(&self) -> &'static str {
        match self {
            Self::GeneralReject => "generalReject",
            Self::ServiceNotSupported => "serviceNotSupported",
            Self::SubFunctionNotSupported => "subFunctionNotSupported",
            Self::IncorrectMessageLengthOrInvalidFormat => "incorrectMessageLengthOrInvalidFormat",
            Self::ResponseTooLong => "responseTooLong",
            Self::BusyRepeatRequest => "busyRepeatRequest",
            Self::ConditionsNotCorrect => "conditionsNotCorrect",
            Self::RequestSequenceError => "requestSequenceError",
            Self::NoResponseFromSubnetComponent => "noResponseFromSubnetComponent",
            Self::FailurePreventsExecutionOfRequestedAction => {
                "failurePreventsExecutionOfRequestedAction"
            }
            Self::RequestOutOfRange => "requestOutOfRange",
            Self::SecurityAccessDenied => "securityAccessDenied",
            Self::AuthenticationRequired => "authenticationRequired",
            Self::InvalidKey => "invalidKey",
            Self::ExceededNumberOfAttempts => "exceededNumberOfAttempts",
            Self::RequiredTimeDelayNotExpired => "requiredTimeDelayNotExpired",
            Self::SecureDataTransmissionRequired => "secureDataTransmissionRequired",
            Self::SecureDataTransmissionNotAllowed => "secureDataTransmissionNotAllowed",
            Self::SecureDataVerificationFailed => "secureDataVerificationFailed",
            Self::UploadDownloadNotAccepted => "uploadDownloadNotAccepted",
            Self::TransferDataSuspended => "transferDataSuspended",
            Self::GeneralProgrammingFailure => "generalProgrammingFailure",
            Self::WrongBlockSequenceCounter => "wrongBlockSequenceCounter",
            Self::RequestCorrectlyReceivedResponsePending => "responsePending",
            Self::SubFunctionNotSupportedInActiveSession => {
                "subFunctionNotSupportedInActiveSession"
            }
            Self::ServiceNotSupportedInActiveSession => "serviceNotSupportedInActiveSession",
            Self::Unknown(_) => "unknownNrc",
        }
    }
}

/// `requestOutOfRange (0x31)`, used in error messages
pub fn nrc_label(byte: u8) -> String {
    NegativeResponseCode::from_byte(byte).to_string()
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.to_byte())
    }
}
