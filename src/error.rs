use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("Account not found")]
    AccountNotFound,
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Bad public key: {0}")]
    BadKey(String),
    #[error("Public key is already registered to another account")]
    DuplicateKey,
    #[error("{family} address pool exhausted")]
    PoolExhausted { family: &'static str },
    #[error("Account id already exists")]
    AccountIdConflict,
    #[error("Upstream unavailable: {0}")]
    UpstreamError(String),
    #[error("Startup error: {0}")]
    StartupError(String),
    #[error("Internal storage error: {0}")]
    InternalError(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),
}

impl MeterError {
    pub fn upstream(context: &str, err: impl std::fmt::Display) -> Self {
        Self::UpstreamError(format!("{context}: {err}"))
    }

    /// Status code the web layer should answer with for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            MeterError::AccountNotFound => 404,
            MeterError::ValidationError(_) | MeterError::BadKey(_) | MeterError::DuplicateKey => {
                400
            }
            MeterError::PoolExhausted { .. } => 503,
            MeterError::UpstreamError(_) => 502,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for MeterError {
    fn from(err: serde_json::Error) -> Self {
        MeterError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, MeterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(MeterError::AccountNotFound.http_status(), 404);
        assert_eq!(MeterError::DuplicateKey.http_status(), 400);
        assert_eq!(
            MeterError::PoolExhausted { family: "IPv4" }.http_status(),
            503
        );
        assert_eq!(MeterError::upstream("wg", "boom").http_status(), 502);
    }

    #[test]
    fn test_pool_exhausted_is_not_a_storage_error() {
        let err = MeterError::PoolExhausted { family: "IPv4" };
        assert_eq!(err.to_string(), "IPv4 address pool exhausted");
        assert!(!matches!(err, MeterError::InternalError(_)));
    }
}
