use std::collections::BTreeMap;

/// One entry of `gcloud pubsub subscriptions pull --format=json`.
#[derive(Deserialize, Debug)]
pub struct PulledMessage {
    #[serde(rename = "ackId", default)]
    pub ack_id: String,
    pub message: PubSubMessage,
}

#[derive(Deserialize, Debug)]
pub struct PubSubMessage {
    /// Base64 encoded body.
    #[serde(default)]
    pub data: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(rename = "messageId", default)]
    pub message_id: String,

    #[serde(rename = "publishTime", default)]
    pub publish_time: String,
}
