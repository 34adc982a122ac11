use thiserror::Error;
use uuid::Uuid;

/// Failures reported by the radio adapter or raised while driving it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RadioError {
    #[error("no bluetooth adapter available")]
    NoAdapter,

    #[error("scan permission refused")]
    PermissionDenied,

    #[error("scan failed: {0}")]
    Scan(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("service discovery failed: {0}")]
    Discovery(String),

    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("read of {uuid} failed: {reason}")]
    Read { uuid: Uuid, reason: String },

    #[error("write to {uuid} failed: {reason}")]
    Write { uuid: Uuid, reason: String },

    #[error("notification error: {0}")]
    Notification(String),

    #[error("device disconnected: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid scan allow-list: {0}")]
    AllowList(String),

    #[error("notification and write characteristic must differ ({0})")]
    CharacteristicClash(Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_error_display() {
        let err = RadioError::Connect("timed out".to_string());
        assert_eq!(err.to_string(), "connection failed: timed out");

        let uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
        let err = RadioError::Write {
            uuid,
            reason: "GATT 0x03".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "write to 6e400002-b5a3-f393-e0a9-e50e24dcca9e failed: GATT 0x03"
        );

        assert_eq!(
            RadioError::PermissionDenied.to_string(),
            "scan permission refused"
        );
    }
}
