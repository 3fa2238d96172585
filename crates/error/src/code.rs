use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric error codes following CIRRUS-XXXX format.
///
/// ## Code Ranges
/// - **1000-1999**: Transport errors (the request never produced an HTTP answer)
/// - **2000-2999**: Remote errors (non-2xx, `success=false`, unusable payloads)
/// - **3000-3999**: Configuration errors
/// - **4000-4999**: Unsupported operations and transaction state
/// - **5000-5999**: Internal/System errors
///
/// Codes are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
#[non_exhaustive]
pub enum ErrorCode {
    // === Transport Errors (1000-1999) ===
    /// CIRRUS-1001: Connection could not be established or was reset
    ConnectionFailed = 1001,
    /// CIRRUS-1002: Request exceeded the fixed timeout
    ConnectionTimeout = 1002,

    // === Remote Errors (2000-2999) ===
    /// CIRRUS-2001: Remote answered with a non-2xx status
    HttpStatus = 2001,
    /// CIRRUS-2002: Remote answered `success: false`
    RemoteRejected = 2002,
    /// CIRRUS-2003: Response body could not be interpreted
    MalformedResponse = 2003,
    /// CIRRUS-2004: No database matches the given name
    DatabaseNotFound = 2004,
    /// CIRRUS-2005: Remote table does not exist or has no columns
    TableNotFound = 2005,
    /// CIRRUS-2006: One statement of a batch failed
    StatementFailed = 2006,
    /// CIRRUS-2007: Remote text could not be converted to the mapped type
    ConversionFailed = 2007,

    // === Configuration Errors (3000-3999) ===
    /// CIRRUS-3001: Account id or API token could not be resolved
    MissingCredential = 3001,
    /// CIRRUS-3002: Target database could not be resolved
    MissingDatabase = 3002,
    /// CIRRUS-3003: Named secret does not exist
    SecretNotFound = 3003,
    /// CIRRUS-3004: Named secret belongs to another service
    SecretKindMismatch = 3004,
    /// CIRRUS-3005: Argument has the wrong shape or type
    InvalidArgument = 3005,
    /// CIRRUS-3006: Alias is already attached and overwrite was refused
    AlreadyAttached = 3006,
    /// CIRRUS-3007: Configuration file or values are invalid
    InvalidConfig = 3007,

    // === Operation Errors (4000-4999) ===
    /// CIRRUS-4001: Operation is not supported on a remote catalog
    UnsupportedOperation = 4001,
    /// CIRRUS-4002: Transaction id is unknown
    TransactionNotFound = 4002,
    /// CIRRUS-4003: Transaction is in the wrong state for the request
    InvalidTransactionState = 4003,

    // === Internal Errors (5000-5999) ===
    /// CIRRUS-5001: Internal DataFusion error
    DataFusionInternal = 5001,
    /// CIRRUS-5002: Serialization/deserialization failed
    SerializationFailed = 5002,
    /// CIRRUS-5003: Unexpected internal state
    Internal = 5003,

    /// CIRRUS-9999: Unknown/unclassified error
    Unknown = 9999,
}

impl ErrorCode {
    /// Get the numeric code value
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    /// Get the formatted code string (e.g., "CIRRUS-2002")
    pub fn as_str(&self) -> String {
        format!("CIRRUS-{:04}", self.as_u16())
    }

    pub fn category(&self) -> ErrorCategory {
        match self.as_u16() {
            1000..=1999 => ErrorCategory::Transport,
            2007 => ErrorCategory::Conversion,
            2000..=2999 => ErrorCategory::Remote,
            3000..=3999 => ErrorCategory::Configuration,
            4000..=4999 => ErrorCategory::Unsupported,
            _ => ErrorCategory::Internal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> String {
        code.as_str()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let num: u16 = s
            .strip_prefix("CIRRUS-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| "Invalid format".to_string())?;
        Self::try_from(num).map_err(|_| "Unknown code".to_string())
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(n: u16) -> std::result::Result<Self, Self::Error> {
        match n {
            1001 => Ok(Self::ConnectionFailed),
            1002 => Ok(Self::ConnectionTimeout),
            2001 => Ok(Self::HttpStatus),
            2002 => Ok(Self::RemoteRejected),
            2003 => Ok(Self::MalformedResponse),
            2004 => Ok(Self::DatabaseNotFound),
            2005 => Ok(Self::TableNotFound),
            2006 => Ok(Self::StatementFailed),
            2007 => Ok(Self::ConversionFailed),
            3001 => Ok(Self::MissingCredential),
            3002 => Ok(Self::MissingDatabase),
            3003 => Ok(Self::SecretNotFound),
            3004 => Ok(Self::SecretKindMismatch),
            3005 => Ok(Self::InvalidArgument),
            3006 => Ok(Self::AlreadyAttached),
            3007 => Ok(Self::InvalidConfig),
            4001 => Ok(Self::UnsupportedOperation),
            4002 => Ok(Self::TransactionNotFound),
            4003 => Ok(Self::InvalidTransactionState),
            5001 => Ok(Self::DataFusionInternal),
            5002 => Ok(Self::SerializationFailed),
            5003 => Ok(Self::Internal),
            9999 => Ok(Self::Unknown),
            _ => Err(format!("Unknown error code: {}", n)),
        }
    }
}

/// Failure class a caller can branch on without knowing individual codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ErrorCategory {
    Transport,
    Remote,
    Conversion,
    Configuration,
    Unsupported,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_formatting() {
        assert_eq!(ErrorCode::ConnectionFailed.as_str(), "CIRRUS-1001");
        assert_eq!(ErrorCode::RemoteRejected.as_str(), "CIRRUS-2002");
        assert_eq!(ErrorCode::Unknown.as_str(), "CIRRUS-9999");
    }

    #[test]
    fn test_error_code_parsing() {
        assert_eq!(
            ErrorCode::try_from("CIRRUS-2006".to_string()).unwrap(),
            ErrorCode::StatementFailed
        );
        assert_eq!(
            ErrorCode::try_from("CIRRUS-9999".to_string()).unwrap(),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn test_error_code_parsing_errors() {
        assert!(ErrorCode::try_from("INVALID".to_string()).is_err());
        assert!(ErrorCode::try_from("CIRRUS-0000".to_string()).is_err());
        assert!(ErrorCode::try_from("ERR-1001".to_string()).is_err());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            ErrorCode::ConnectionTimeout.category(),
            ErrorCategory::Transport
        );
        assert_eq!(ErrorCode::HttpStatus.category(), ErrorCategory::Remote);
        assert_eq!(
            ErrorCode::ConversionFailed.category(),
            ErrorCategory::Conversion
        );
        assert_eq!(
            ErrorCode::MissingCredential.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            ErrorCode::UnsupportedOperation.category(),
            ErrorCategory::Unsupported
        );
        assert_eq!(ErrorCode::Unknown.category(), ErrorCategory::Internal);
    }
}
