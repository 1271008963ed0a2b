use async_trait::async_trait;
use courtbook_core::{EmailSender, NotificationError};
use courtbook_shared::{EmailRequest, Masked};
use std::time::Duration;
use tracing::{error, info};

/// Posts email requests as JSON to the mail relay endpoint
/// (the legacy `sendEmail` script, or anything speaking the same body).
#[derive(Clone)]
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEmailSender {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.to_string() })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, request: &EmailRequest) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| NotificationError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            error!("Mail relay rejected {} for {}: {}", request.kind, Masked(&request.recipient), status);
            return Err(NotificationError::Delivery(format!("relay answered {}", status)));
        }

        info!("Sent {} email to {}", request.kind, Masked(&request.recipient));
        Ok(())
    }
}

/// Development sender: logs the request and reports success
#[derive(Debug, Clone, Default)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, request: &EmailRequest) -> Result<(), NotificationError> {
        let fields = serde_json::Value::Object(request.fields.clone());
        info!(kind = %request.kind, recipient = %Masked(&request.recipient), %fields, "Email (log mode)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtbook_shared::EmailKind;

    #[tokio::test]
    async fn test_log_sender_always_succeeds() {
        let request = EmailRequest::new(EmailKind::WaitlistConfirmation, "dee@example.com", "Dee")
            .field("position", 2);
        assert!(LogEmailSender.send(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_http_sender_reports_unreachable_relay() {
        // Port 9 (discard) on localhost is closed in test environments.
        let sender = HttpEmailSender::new("http://127.0.0.1:9/sendEmail", Duration::from_millis(500)).unwrap();
        let request = EmailRequest::new(EmailKind::Cancellation, "dee@example.com", "Dee");
        let err = sender.send(&request).await.unwrap_err();
        assert!(matches!(err, NotificationError::Delivery(_)));
    }
}
