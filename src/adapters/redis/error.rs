//! Redis error classification.

use crate::error::{ConnectionError, QueueError};
use redis::{ErrorKind, RedisError};

/// Errors that a fresh connection may cure: dropped or refused sockets,
/// timeouts, and replica/failover responses such as `READONLY`.
pub fn is_transient(err: &RedisError) -> bool {
    err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_io_error()
        || err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::ReadOnly
                | ErrorKind::TryAgain
                | ErrorKind::MasterDown
                | ErrorKind::BusyLoadingError
        )
}

impl From<RedisError> for ConnectionError {
    fn from(err: RedisError) -> Self {
        if is_transient(&err) {
            ConnectionError::Transient(err.to_string())
        } else {
            ConnectionError::Fatal(err.to_string())
        }
    }
}

impl From<RedisError> for QueueError {
    fn from(err: RedisError) -> Self {
        QueueError::Broker {
            transient: is_transient(&err),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readonly_redirect_is_transient() {
        let err = RedisError::from((ErrorKind::ReadOnly, "READONLY replica"));
        assert!(is_transient(&err));
        assert!(ConnectionError::from(err).is_transient());
    }

    #[test]
    fn test_connection_reset_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(is_transient(&RedisError::from(io)));
    }

    #[test]
    fn test_auth_failure_is_fatal() {
        let err = RedisError::from((ErrorKind::AuthenticationFailed, "WRONGPASS"));
        assert!(!is_transient(&err));
        assert!(matches!(
            QueueError::from(err),
            QueueError::Broker {
                transient: false,
                ..
            }
        ));
    }
}
