use crate::{CirrusError, ErrorCode, ErrorContext};
use datafusion::arrow::error::ArrowError;
use datafusion::error::DataFusionError;

impl From<DataFusionError> for CirrusError {
    fn from(err: DataFusionError) -> Self {
        // Errors raised by our own providers travel through DataFusion as
        // `External`; hand them back unchanged.
        if let DataFusionError::External(inner) = err.find_root() {
            if let Some(cirrus) = inner.downcast_ref::<CirrusError>() {
                return cirrus.clone();
            }
        }
        match &err {
            DataFusionError::SQL(parse_err, _) => {
                CirrusError::new(ErrorCode::InvalidArgument, parse_err.to_string())
            }
            DataFusionError::NotImplemented(msg) => {
                CirrusError::new(ErrorCode::UnsupportedOperation, msg.clone())
            }
            _ => CirrusError::new(ErrorCode::DataFusionInternal, err.to_string()),
        }
    }
}

impl From<CirrusError> for DataFusionError {
    fn from(err: CirrusError) -> Self {
        DataFusionError::External(Box::new(err))
    }
}

impl From<ArrowError> for CirrusError {
    fn from(err: ArrowError) -> Self {
        CirrusError::new(ErrorCode::DataFusionInternal, err.to_string())
    }
}

impl From<reqwest::Error> for CirrusError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::ConnectionTimeout
        } else if err.is_decode() {
            ErrorCode::MalformedResponse
        } else {
            ErrorCode::ConnectionFailed
        };
        let mut error = CirrusError::new(code, err.to_string());
        if let Some(url) = err.url() {
            error = error.with_context(ErrorContext::Request {
                method: String::new(),
                url: url.to_string(),
                status: err.status().map(|s| s.as_u16()),
            });
        }
        error
    }
}

impl From<std::io::Error> for CirrusError {
    fn from(err: std::io::Error) -> Self {
        CirrusError::new(ErrorCode::Internal, err.to_string())
    }
}

impl From<serde_json::Error> for CirrusError {
    fn from(err: serde_json::Error) -> Self {
        CirrusError::new(ErrorCode::SerializationFailed, err.to_string())
    }
}
