//! Stock session driver: verify the session's query against the desktop.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::protocol::SessionConfig;
use super::server::{ServerPeer, SessionDriver};
use crate::verifier::{ScreenshotProvider, Task, Verifier, VerifyError};

/// Captures the current screenshot, streams it to the client, and reports
/// the verdict for `user_query` in a `"Process processing"` envelope.
pub struct VerificationDriver {
    verifier: Arc<Verifier>,
    screenshots: Arc<dyn ScreenshotProvider>,
}

impl VerificationDriver {
    pub fn new(verifier: Arc<Verifier>, screenshots: Arc<dyn ScreenshotProvider>) -> Self {
        Self {
            verifier,
            screenshots,
        }
    }
}

#[async_trait]
impl SessionDriver for VerificationDriver {
    async fn drive(&self, config: &SessionConfig, peer: &mut ServerPeer<'_>) -> anyhow::Result<()> {
        let screenshot = self
            .screenshots
            .capture()
            .await
            .map_err(|e| VerifyError::MissingScreenshot(e.to_string()))?
            .filter(|bytes| !bytes.is_empty())
            .ok_or_else(|| VerifyError::MissingScreenshot("no image captured".to_string()))?;

        peer.send_image(screenshot.clone()).await?;

        let task = Task::new(config.user_query.clone());
        let verification = self.verifier.verify(&task, &screenshot).await?;

        let mut payload = Map::new();
        payload.insert("task".to_string(), Value::String(task.task));
        payload.insert(
            "thinking".to_string(),
            Value::String(verification.verdict.thinking.clone()),
        );
        payload.insert(
            "is_completed".to_string(),
            Value::Bool(verification.verdict.is_completed),
        );
        payload.insert("model".to_string(), Value::String(verification.model.clone()));
        payload.insert(
            "checked_at".to_string(),
            Value::String(verification.checked_at.to_rfc3339()),
        );
        peer.send_progress(payload).await?;

        tracing::info!(
            session = %peer.session_id(),
            is_completed = verification.verdict.is_completed,
            "Verification reported"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::protocol::tests::sample_config;
    use crate::session::protocol::{ControlMessage, Envelope};
    use crate::session::server::serve_session;
    use crate::session::transport::{memory_pair, FrameTransport, WireFrame};
    use crate::verifier::tests::MockLlm;
    use crate::verifier::PromptBuilder;

    struct Fixed(Option<Vec<u8>>);

    #[async_trait]
    impl ScreenshotProvider for Fixed {
        async fn capture(&self) -> std::io::Result<Option<Vec<u8>>> {
            Ok(self.0.clone())
        }
    }

    fn driver(llm: Arc<MockLlm>, screenshot: Option<Vec<u8>>) -> VerificationDriver {
        let verifier = Verifier::new(llm, "qwen-vl-max", PromptBuilder::new("Windows"));
        VerificationDriver::new(Arc::new(verifier), Arc::new(Fixed(screenshot)))
    }

    #[tokio::test]
    async fn reports_verdict_over_the_session() {
        let llm = MockLlm::replying(
            "```json\n{\"thinking\": \"Word shows the project list.\", \"is_completed\": true}\n```",
        );
        let (server_end, mut client_end) = memory_pair();
        client_end.send(WireFrame::Text(r#"{"token":"t"}"#.into())).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();
        client_end.send(Envelope::ack().to_frame()).await.unwrap();

        let report = serve_session(server_end, "t", &driver(llm.clone(), Some(vec![5; 8])))
            .await
            .unwrap();

        assert_eq!(report.end, ControlMessage::Complete);
        assert_eq!(
            client_end.recv().await.unwrap().unwrap(),
            WireFrame::Binary(vec![5; 8])
        );
        let Some(Ok(WireFrame::Text(progress))) = client_end.recv().await else {
            panic!("expected progress envelope");
        };
        let progress: Value = serde_json::from_str(&progress).unwrap();
        assert_eq!(progress["message"], "Process processing");
        assert_eq!(progress["is_completed"], true);
        assert_eq!(progress["task"], sample_config().user_query);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn missing_screenshot_interrupts_without_model_call() {
        let llm = MockLlm::replying("{}");
        let (server_end, mut client_end) = memory_pair();
        client_end.send(WireFrame::Text(r#"{"token":"t"}"#.into())).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();

        let report = serve_session(server_end, "t", &driver(llm.clone(), None))
            .await
            .unwrap();

        assert_eq!(report.end, ControlMessage::Interruption);
        assert_eq!(report.images_sent, 0);
        assert_eq!(llm.call_count(), 0);
        let Some(Ok(WireFrame::Text(notice))) = client_end.recv().await else {
            panic!("expected interruption envelope");
        };
        assert!(notice.contains("no screenshot available"));
    }

    #[tokio::test]
    async fn malformed_verdict_interrupts_session() {
        let llm = MockLlm::replying("The task looks done to me.");
        let (server_end, mut client_end) = memory_pair();
        client_end.send(WireFrame::Text(r#"{"token":"t"}"#.into())).await.unwrap();
        client_end.send(sample_config().to_frame()).await.unwrap();

        let report = serve_session(server_end, "t", &driver(llm, Some(vec![1])))
            .await
            .unwrap();

        assert_eq!(report.end, ControlMessage::Interruption);
        assert_eq!(report.images_sent, 1);
        assert_eq!(report.acks_received, 0);
        // image frame, then the interruption
        client_end.recv().await.unwrap().unwrap();
        let Some(Ok(WireFrame::Text(notice))) = client_end.recv().await else {
            panic!("expected interruption envelope");
        };
        assert!(notice.contains("malformed verdict"));
    }
}
