use crate::errors::ListenerError;
use crate::integrations::pubsub_integration::ReceivedMessage;
use std::fmt;

pub const START_BUILD: &str = "start_build";
pub const BUILD_ASSET_BUNDLES: &str = "build_asset_bundles";

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BuildCommand {
    StartBuild,
    BuildAssetBundles,
}

impl BuildCommand {
    pub fn parse(command: &str) -> Result<BuildCommand, ListenerError> {
        match command.trim() {
            START_BUILD => Ok(BuildCommand::StartBuild),
            BUILD_ASSET_BUNDLES => Ok(BuildCommand::BuildAssetBundles),
            other => Err(ListenerError::UnrecognizedCommand {
                command: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildCommand::StartBuild => write!(f, "{}", START_BUILD),
            BuildCommand::BuildAssetBundles => write!(f, "{}", BUILD_ASSET_BUNDLES),
        }
    }
}

/// Body of a structured (JSON) build request.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub command: String,
    pub build_id: String,
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub is_test_build: bool,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Older senders put a bare command string in the body, optionally followed
/// by `:<gitRef>`, and carry everything else as attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyRequest {
    pub command: String,
    pub git_ref: Option<String>,
    pub build_id: String,
    pub nobuild: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Structured(BuildRequest),
    Legacy(LegacyRequest),
}

impl InboundMessage {
    pub fn command(&self) -> &str {
        match self {
            InboundMessage::Structured(request) => &request.command,
            InboundMessage::Legacy(request) => &request.command,
        }
    }

    pub fn build_id(&self) -> &str {
        match self {
            InboundMessage::Structured(request) => &request.build_id,
            InboundMessage::Legacy(request) => &request.build_id,
        }
    }

    /// The branch asked for; for legacy requests, the git ref if any.
    pub fn branch_name(&self) -> &str {
        match self {
            InboundMessage::Structured(request) => request.branch_name.trim(),
            InboundMessage::Legacy(request) => request.git_ref.as_ref().map(String::as_str).unwrap_or(""),
        }
    }

    pub fn commit_hash(&self) -> &str {
        match self {
            InboundMessage::Structured(request) => request.commit_hash.trim(),
            InboundMessage::Legacy(_) => "",
        }
    }

    /// Falls back to the build id when the sender gave no session.
    pub fn session_id(&self) -> &str {
        let session_id = match self {
            InboundMessage::Structured(request) => &request.session_id,
            InboundMessage::Legacy(request) => &request.session_id,
        };
        session_id.as_ref().map(String::as_str).unwrap_or_else(|| self.build_id())
    }
}

pub trait MessageDecoder {
    fn name(&self) -> &'static str;
    /// Whether this decoder understands the shape of the message at all.
    fn accepts(&self, message: &ReceivedMessage) -> bool;
    fn decode(&self, message: &ReceivedMessage) -> Result<InboundMessage, ListenerError>;
}

pub struct StructuredDecoder;

impl MessageDecoder for StructuredDecoder {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn accepts(&self, message: &ReceivedMessage) -> bool {
        message.body.trim_start().starts_with('{')
    }

    fn decode(&self, message: &ReceivedMessage) -> Result<InboundMessage, ListenerError> {
        let request: BuildRequest =
            serde_json::from_str(message.body.trim()).map_err(|e| ListenerError::Parse {
                reason: format!("build request JSON is malformed: {}", e),
            })?;
        Ok(InboundMessage::Structured(request))
    }
}

pub struct LegacyDecoder;

impl MessageDecoder for LegacyDecoder {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn accepts(&self, message: &ReceivedMessage) -> bool {
        let body = message.body.trim();
        !body.is_empty() && !body.starts_with('{') && !body.starts_with('[')
    }

    fn decode(&self, message: &ReceivedMessage) -> Result<InboundMessage, ListenerError> {
        let body = message.body.trim();
        let (command, git_ref) = match body.find(':') {
            Some(split) => {
                let git_ref = body[split + 1..].trim();
                let git_ref = if git_ref.is_empty() {
                    None
                } else {
                    Some(git_ref.to_string())
                };
                (body[..split].trim().to_string(), git_ref)
            }
            None => (body.to_string(), None),
        };

        let build_id = message
            .attributes
            .get("build_id")
            .cloned()
            .unwrap_or_else(|| message.message_id.clone());
        let nobuild = message
            .attributes
            .get("nobuild")
            .map(|value| value.trim().eq_ignore_ascii_case("true") || value.trim() == "1")
            .unwrap_or(false);

        Ok(InboundMessage::Legacy(LegacyRequest {
            command,
            git_ref,
            build_id,
            nobuild,
            session_id: message.attributes.get("session_id").cloned(),
        }))
    }
}

/// Picks the decoder by looking at the body's shape. The two formats are kept
/// apart; a body neither understands is a parse error.
pub fn decode_message(message: &ReceivedMessage) -> Result<InboundMessage, ListenerError> {
    let decoders: [&dyn MessageDecoder; 2] = [&StructuredDecoder, &LegacyDecoder];
    for decoder in decoders.iter() {
        if decoder.accepts(message) {
            debug!("--Listener--: Decoding message {} as {}", message.message_id, decoder.name());
            return decoder.decode(message);
        }
    }
    Err(ListenerError::Parse {
        reason: format!("message {} has an unrecognized body shape", message.message_id),
    })
}
