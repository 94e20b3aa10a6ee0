//! Validation of inbound tunnel notifications
//!
//! Checks run in a fixed order and the first failure wins: client mode,
//! service count, access token, region. Duplicate detection and service
//! resolution need orchestrator state and happen afterwards.

use crate::services::ServiceError;
use edgetunnel_proto::{ClientMode, TunnelNotification};
use thiserror::Error;

/// Reasons a notification is dropped without creating a session
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Unexpected client mode: {0}")]
    UnexpectedClientMode(String),

    #[error("No service requested")]
    NoService,

    #[error("Received a multi-port tunnel request ({0} services), but multi-port tunneling is not supported")]
    MultiPortUnsupported(usize),

    #[error("Access token cannot be empty")]
    MissingAccessToken,

    #[error("Region cannot be empty")]
    MissingRegion,

    #[error("Duplicate notification for an active tunnel")]
    Duplicate,

    #[error("Requested service {service} is not supported: {source}")]
    UnsupportedService {
        service: String,
        #[source]
        source: ServiceError,
    },

    #[error("Failed to open tunnel: {0}")]
    Connect(#[from] crate::session::SessionError),
}

/// A notification that passed the stateless checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub access_token: String,
    pub region: String,
    pub service: String,
}

/// Run the stateless checks on a notification
pub fn validate(notification: &TunnelNotification) -> Result<TunnelRequest, NotificationError> {
    match notification.mode() {
        Ok(ClientMode::Destination) => {}
        _ => {
            return Err(NotificationError::UnexpectedClientMode(
                notification.client_mode.clone(),
            ))
        }
    }

    let service = match notification.services() {
        [] => return Err(NotificationError::NoService),
        [service] => service.clone(),
        services => return Err(NotificationError::MultiPortUnsupported(services.len())),
    };

    let access_token = notification
        .access_token()
        .ok_or(NotificationError::MissingAccessToken)?
        .to_string();

    let region = notification
        .region()
        .ok_or(NotificationError::MissingRegion)?
        .to_string();

    Ok(TunnelRequest {
        access_token,
        region,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(services: &[&str]) -> TunnelNotification {
        TunnelNotification {
            client_mode: "destination".to_string(),
            services: Some(services.iter().map(|s| s.to_string()).collect()),
            client_access_token: Some("token-1".to_string()),
            region: Some("us-east-1".to_string()),
        }
    }

    #[test]
    fn test_valid_notification() {
        let request = validate(&notification(&["SSH"])).unwrap();
        assert_eq!(
            request,
            TunnelRequest {
                access_token: "token-1".to_string(),
                region: "us-east-1".to_string(),
                service: "SSH".to_string(),
            }
        );
    }

    #[test]
    fn test_source_mode_rejected() {
        let mut n = notification(&["SSH"]);
        n.client_mode = "source".to_string();
        assert!(matches!(
            validate(&n),
            Err(NotificationError::UnexpectedClientMode(mode)) if mode == "source"
        ));

        n.client_mode = String::new();
        assert!(matches!(
            validate(&n),
            Err(NotificationError::UnexpectedClientMode(_))
        ));
    }

    #[test]
    fn test_service_count() {
        assert!(matches!(
            validate(&notification(&[])),
            Err(NotificationError::NoService)
        ));

        let mut absent = notification(&[]);
        absent.services = None;
        assert!(matches!(validate(&absent), Err(NotificationError::NoService)));

        assert!(matches!(
            validate(&notification(&["SSH", "GW"])),
            Err(NotificationError::MultiPortUnsupported(2))
        ));
    }

    #[test]
    fn test_missing_token_and_region() {
        let mut n = notification(&["SSH"]);
        n.client_access_token = Some(String::new());
        assert!(matches!(
            validate(&n),
            Err(NotificationError::MissingAccessToken)
        ));

        let mut n = notification(&["SSH"]);
        n.region = None;
        assert!(matches!(validate(&n), Err(NotificationError::MissingRegion)));
    }

    #[test]
    fn test_multi_port_rejected_before_token_checks() {
        let mut n = notification(&["SSH", "GW"]);
        n.client_access_token = None;
        n.region = None;
        assert!(matches!(
            validate(&n),
            Err(NotificationError::MultiPortUnsupported(2))
        ));
    }
}
