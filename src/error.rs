//! Error taxonomy shared by every handler and by the protocol dispatcher.
//!
//! Mirrors the AWS error model: every failure carries a `code` string, an
//! HTTP status, and a human-readable message. Handlers return `ApiError`
//! via `?`; the dispatcher is the only place that renders it to wire format.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidAction(String),

    #[error("{0}")]
    MethodNotAllowed(String),

    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    IncorrectState(String),

    #[error("{0}")]
    InstanceNotFound(String),

    #[error("{0}")]
    VolumeNotFound(String),

    #[error("{0}")]
    AttachmentNotFound(String),

    #[error("{0}")]
    AddressNotFound(String),

    #[error("{0}")]
    AddressIdNotFound(String),

    #[error("{0}")]
    AssociationIdNotFound(String),

    #[error("{0}")]
    AddressInUse(String),

    #[error("{0}")]
    AddressLimitExceeded(String),

    #[error("{0}")]
    NoSuchHostedZone(String),

    #[error("{0}")]
    HostedZoneNotEmpty(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    InvalidChangeBatch(String),

    #[error("{0}")]
    NoSuchChange(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// AWS-style error code string, e.g. `InvalidParameterValue`.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidAction(_) => "InvalidAction",
            ApiError::MethodNotAllowed(_) => "InvalidAction",
            ApiError::InvalidParameter(_) => "InvalidParameterValue",
            ApiError::IncorrectState(_) => "IncorrectState",
            ApiError::InstanceNotFound(_) => "InvalidInstanceID.NotFound",
            ApiError::VolumeNotFound(_) => "InvalidVolume.NotFound",
            ApiError::AttachmentNotFound(_) => "InvalidAttachment.NotFound",
            ApiError::AddressNotFound(_) => "InvalidAddress.NotFound",
            ApiError::AddressIdNotFound(_) => "InvalidAddressID.NotFound",
            ApiError::AssociationIdNotFound(_) => "InvalidAssociationID.NotFound",
            ApiError::AddressInUse(_) => "InvalidIPAddress.InUse",
            ApiError::AddressLimitExceeded(_) => "AddressLimitExceeded",
            ApiError::NoSuchHostedZone(_) => "NoSuchHostedZone",
            ApiError::HostedZoneNotEmpty(_) => "HostedZoneNotEmpty",
            ApiError::InvalidInput(_) => "InvalidInput",
            ApiError::InvalidChangeBatch(_) => "InvalidChangeBatch",
            ApiError::NoSuchChange(_) => "NoSuchChange",
            ApiError::Internal(_) => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            ApiError::InvalidAction(_) => 400,
            ApiError::MethodNotAllowed(_) => 405,
            ApiError::InvalidParameter(_) => 400,
            ApiError::IncorrectState(_) => 400,
            ApiError::InstanceNotFound(_) => 400,
            ApiError::VolumeNotFound(_) => 400,
            ApiError::AttachmentNotFound(_) => 400,
            ApiError::AddressNotFound(_) => 400,
            ApiError::AddressIdNotFound(_) => 400,
            ApiError::AssociationIdNotFound(_) => 400,
            ApiError::AddressInUse(_) => 400,
            ApiError::AddressLimitExceeded(_) => 400,
            ApiError::NoSuchHostedZone(_) => 404,
            ApiError::HostedZoneNotEmpty(_) => 400,
            ApiError::InvalidInput(_) => 400,
            ApiError::InvalidChangeBatch(_) => 400,
            ApiError::NoSuchChange(_) => 404,
            ApiError::Internal(_) => 500,
        }
    }

    /// Wrap an arbitrary lower-layer error (libvirt, sqlx, guest-agent) as
    /// `InternalError`, capturing its message for local debugging.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        ApiError::Internal(err.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::internal(format!("database error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_allowed_uses_invalid_action_code() {
        let err = ApiError::MethodNotAllowed("nope".into());
        assert_eq!(err.code(), "InvalidAction");
        assert_eq!(err.http_status(), 405);
    }

    #[test]
    fn not_found_codes_are_distinct() {
        assert_eq!(ApiError::AddressNotFound("x".into()).code(), "InvalidAddress.NotFound");
        assert_eq!(ApiError::AddressIdNotFound("x".into()).code(), "InvalidAddressID.NotFound");
        assert_eq!(
            ApiError::AssociationIdNotFound("x".into()).code(),
            "InvalidAssociationID.NotFound"
        );
    }

    #[test]
    fn hosted_zone_not_found_is_404() {
        assert_eq!(ApiError::NoSuchHostedZone("z".into()).http_status(), 404);
        assert_eq!(ApiError::NoSuchChange("c".into()).http_status(), 404);
    }
}
