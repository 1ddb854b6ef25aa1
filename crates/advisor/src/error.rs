//! Error taxonomy for the irrigation core.
//!
//! Every failure is a returned value. Callers match on the variant to pick a
//! response; the reason code identifies the precise rule that rejected the
//! request.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Machine-readable reason attached to a rejected request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    OutOfRange,
    MissingField,
    DeviceInactive,
    IrrigationActive,
    InvalidTransition,
    ZoneNotInFarm,
    EmptyZoneSet,
    ForecastUnavailable,
    NotificationUnavailable,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::OutOfRange => "OUT_OF_RANGE",
            Reason::MissingField => "MISSING_FIELD",
            Reason::DeviceInactive => "DEVICE_INACTIVE",
            Reason::IrrigationActive => "IRRIGATION_ACTIVE",
            Reason::InvalidTransition => "INVALID_TRANSITION",
            Reason::ZoneNotInFarm => "ZONE_NOT_IN_FARM",
            Reason::EmptyZoneSet => "EMPTY_ZONE_SET",
            Reason::ForecastUnavailable => "FORECAST_UNAVAILABLE",
            Reason::NotificationUnavailable => "NOTIFICATION_UNAVAILABLE",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed or out-of-range input, rejected before anything is persisted.
    #[error("validation failed ({reason}): {message}")]
    Validation { reason: Reason, message: String },

    /// An active run already exists, or a run was asked for a transition its
    /// current status does not allow.
    #[error("conflict ({reason}): {message}")]
    Conflict { reason: Reason, message: String },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Forecast or notification collaborator unavailable. Never fatal.
    #[error("dependency unavailable ({reason}): {message}")]
    Dependency { reason: Reason, message: String },

    /// The request contradicts the farm layout. Aborts only that request.
    #[error("invariant violated ({reason}): {message}")]
    Invariant { reason: Reason, message: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl CoreError {
    pub fn validation(reason: Reason, message: impl Into<String>) -> Self {
        CoreError::Validation {
            reason,
            message: message.into(),
        }
    }

    pub fn conflict(reason: Reason, message: impl Into<String>) -> Self {
        CoreError::Conflict {
            reason,
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn dependency(reason: Reason, message: impl Into<String>) -> Self {
        CoreError::Dependency {
            reason,
            message: message.into(),
        }
    }

    pub fn invariant(reason: Reason, message: impl Into<String>) -> Self {
        CoreError::Invariant {
            reason,
            message: message.into(),
        }
    }

    /// Reason code, if the variant carries one.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            CoreError::Validation { reason, .. }
            | CoreError::Conflict { reason, .. }
            | CoreError::Dependency { reason, .. }
            | CoreError::Invariant { reason, .. } => Some(*reason),
            CoreError::NotFound { .. } | CoreError::Storage(_) => None,
        }
    }

    /// Short label for the error family, used in API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Storage(_) => "STORAGE",
            other => other.reason().map(Reason::as_str).unwrap_or("UNKNOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_screaming_snake() {
        assert_eq!(Reason::IrrigationActive.to_string(), "IRRIGATION_ACTIVE");
        assert_eq!(
            serde_json::to_string(&Reason::OutOfRange).unwrap(),
            "\"OUT_OF_RANGE\""
        );
    }

    #[test]
    fn display_includes_reason_and_message() {
        let err = CoreError::conflict(Reason::IrrigationActive, "farm f1 already running");
        let msg = err.to_string();
        assert!(msg.contains("IRRIGATION_ACTIVE"), "got: {msg}");
        assert!(msg.contains("farm f1 already running"), "got: {msg}");
    }

    #[test]
    fn code_falls_back_for_reasonless_variants() {
        assert_eq!(CoreError::not_found("device", "d1").code(), "NOT_FOUND");
        let storage: CoreError = anyhow::anyhow!("disk full").into();
        assert_eq!(storage.code(), "STORAGE");
        assert_eq!(storage.reason(), None);
    }
}
