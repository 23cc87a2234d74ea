use meshroom_protocol::PeerId;

/// Why local capture could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure talking to an HTTP collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no collaborator base URL configured")]
    NotConfigured,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collaborator returned {status}: {message}")]
    Status { status: u16, message: String },
}

/// Session-level failures. Everything except a first-time `PermissionDenied`
/// is handled where it happens and only logged.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("signaling unavailable after {attempts} attempts")]
    SignalingUnavailable { attempts: u32 },
    #[error("negotiation with {peer} rejected: {reason}")]
    NegotiationRejected { peer: PeerId, reason: String },
    #[error("transport to {peer} failed while the peer was still present")]
    TransportFailed { peer: PeerId },
    #[error("adaptation service unavailable: {0}")]
    AdaptationUnavailable(#[source] ServiceError),
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => SessionError::PermissionDenied,
            CaptureError::DeviceUnavailable(reason) => SessionError::DeviceUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_errors_map_into_session_taxonomy() {
        assert!(matches!(
            SessionError::from(CaptureError::PermissionDenied),
            SessionError::PermissionDenied
        ));
        let err = SessionError::from(CaptureError::DeviceUnavailable("no camera".to_string()));
        assert_eq!(err.to_string(), "capture device unavailable: no camera");
    }

    #[test]
    fn negotiation_rejected_names_peer() {
        let err = SessionError::NegotiationRejected {
            peer: "abc".to_string(),
            reason: "bad sdp".to_string(),
        };
        assert_eq!(err.to_string(), "negotiation with abc rejected: bad sdp");
    }
}
