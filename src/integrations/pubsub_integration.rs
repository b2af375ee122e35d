use crate::errors::ListenerError;
use crate::integrations::command_runner::{CommandRunner, Invocation};
use crate::integrations::pubsub_response::PulledMessage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use failure::Error;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// A pulled message with its body already base64-decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

pub struct PubSubIntegration<'a, R: CommandRunner> {
    runner: &'a R,
    gcloud: &'a str,
    timeout: Duration,
}

impl<'a, R: CommandRunner> PubSubIntegration<'a, R> {
    pub fn new(runner: &'a R, gcloud: &'a str, timeout: Duration) -> PubSubIntegration<'a, R> {
        PubSubIntegration {
            runner,
            gcloud,
            timeout,
        }
    }

    /// Pulls at most one message. The message is acked as part of the pull,
    /// so whatever happens to it afterwards it won't be redelivered.
    pub fn pull_one(&self, subscription: &str) -> Result<Option<ReceivedMessage>, Error> {
        let invocation = Invocation::new(self.gcloud, self.timeout)
            .args(vec!["pubsub", "subscriptions", "pull"])
            .arg(subscription)
            .args(vec!["--limit=1", "--auto-ack", "--format=json"]);
        let output = self.runner.run_checked(&invocation)?;
        parse_pull_output(&output.stdout)
    }

    /// Publishes `payload` as JSON. Failures are logged and reported as false;
    /// they never propagate.
    pub fn publish<T: Serialize>(
        &self,
        topic: &str,
        attributes: &BTreeMap<String, String>,
        payload: &T,
        encode_base64: bool,
    ) -> bool {
        match self.try_publish(topic, attributes, payload, encode_base64) {
            Ok(()) => {
                info!("--PubSub--: Published to {}", topic);
                true
            }
            Err(e) => {
                error!("--PubSub--: Failed to publish to {}: {}", topic, e);
                false
            }
        }
    }

    fn try_publish<T: Serialize>(
        &self,
        topic: &str,
        attributes: &BTreeMap<String, String>,
        payload: &T,
        encode_base64: bool,
    ) -> Result<(), Error> {
        let json = serde_json::to_string(payload)?;
        let body = if encode_base64 { STANDARD.encode(json) } else { json };

        let mut invocation = Invocation::new(self.gcloud, self.timeout)
            .args(vec!["pubsub", "topics", "publish"])
            .arg(topic)
            .arg(format!("--message={}", body))
            // Reporting a result should still happen while shutting down.
            .not_cancellable();
        for (key, value) in attributes {
            invocation = invocation.arg(format!("--attribute={}={}", key, value));
        }
        self.runner.run_checked(&invocation)?;
        Ok(())
    }
}

pub fn parse_pull_output(stdout: &str) -> Result<Option<ReceivedMessage>, Error> {
    let trimmed = stdout.trim();
    // gcloud prints nothing at all (not even []) when the subscription is empty.
    if trimmed.is_empty() {
        return Ok(None);
    }
    let mut pulled: Vec<PulledMessage> =
        serde_json::from_str(trimmed).map_err(|e| ListenerError::Parse {
            reason: format!("pull output is not valid JSON: {}", e),
        })?;
    if pulled.is_empty() {
        return Ok(None);
    }
    if pulled.len() > 1 {
        warn!("--PubSub--: Asked for one message but got {}; only the first is handled.", pulled.len());
    }

    let pulled = pulled.remove(0);
    debug!(
        "--PubSub--: Pulled {} (ack {}, published {})",
        pulled.message.message_id, pulled.ack_id, pulled.message.publish_time
    );
    let message = pulled.message;
    let decoded = STANDARD
        .decode(message.data.trim())
        .map_err(|e| ListenerError::Parse {
            reason: format!("message {} body is not base64: {}", message.message_id, e),
        })?;
    let body = String::from_utf8(decoded).map_err(|e| ListenerError::Parse {
        reason: format!("message {} body is not UTF-8: {}", message.message_id, e),
    })?;

    Ok(Some(ReceivedMessage {
        message_id: message.message_id,
        body,
        attributes: message.attributes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::command_runner::testing::*;

    fn pull_json(body: &str, attributes: &str) -> String {
        format!(
            r#"[{{"ackId":"ack-1","message":{{"data":"{}","attributes":{},"messageId":"m-1","publishTime":"2024-01-01T00:00:00Z"}}}}]"#,
            STANDARD.encode(body),
            attributes
        )
    }

    #[test]
    fn empty_pull_means_no_message() {
        assert_eq!(parse_pull_output("").unwrap(), None);
        assert_eq!(parse_pull_output("[]\n").unwrap(), None);
    }

    #[test]
    fn pull_decodes_body_and_attributes() {
        let stdout = pull_json("start_build:main", r#"{"build_id":"7","nobuild":"true"}"#);
        let message = parse_pull_output(&stdout).unwrap().unwrap();
        assert_eq!(message.message_id, "m-1");
        assert_eq!(message.body, "start_build:main");
        assert_eq!(message.attributes.get("nobuild").map(String::as_str), Some("true"));
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        let stdout = r#"[{"ackId":"a","message":{"data":"%%%not-base64","messageId":"m"}}]"#;
        match parse_pull_output(stdout).unwrap_err().downcast::<ListenerError>() {
            Ok(ListenerError::Parse { .. }) => {}
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn pull_uses_auto_ack_and_a_limit_of_one() {
        let runner = ScriptedRunner::new(|_| ok(""));
        let pubsub = PubSubIntegration::new(&runner, "gcloud", Duration::from_secs(5));
        assert_eq!(pubsub.pull_one("projects/p/subscriptions/s").unwrap(), None);

        let calls = runner.calls();
        let call = &calls[0];
        assert_eq!(
            call.args,
            vec![
                "pubsub",
                "subscriptions",
                "pull",
                "projects/p/subscriptions/s",
                "--limit=1",
                "--auto-ack",
                "--format=json"
            ]
        );
    }

    #[test]
    fn publish_encodes_body_and_repeats_attribute_flags() {
        let runner = ScriptedRunner::new(|_| ok(""));
        let pubsub = PubSubIntegration::new(&runner, "gcloud", Duration::from_secs(5));
        let mut attributes = BTreeMap::new();
        attributes.insert("build_id".to_string(), "42".to_string());
        attributes.insert("status".to_string(), "success".to_string());

        let payload = serde_json::json!({"build_id": "42"});
        assert!(pubsub.publish("projects/p/topics/done", &attributes, &payload, true));

        let calls = runner.calls();
        let call = &calls[0];
        assert!(!call.cancellable);
        let message = call.args.iter().find(|a| a.starts_with("--message=")).unwrap();
        let decoded = STANDARD.decode(&message["--message=".len()..]).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), r#"{"build_id":"42"}"#);
        assert!(call.args.contains(&"--attribute=build_id=42".to_string()));
        assert!(call.args.contains(&"--attribute=status=success".to_string()));
    }

    #[test]
    fn publish_failure_is_swallowed() {
        let runner = ScriptedRunner::new(|_| exit(1, "PERMISSION_DENIED"));
        let pubsub = PubSubIntegration::new(&runner, "gcloud", Duration::from_secs(5));
        let payload = serde_json::json!({});
        assert!(!pubsub.publish("t", &BTreeMap::new(), &payload, false));
    }
}
