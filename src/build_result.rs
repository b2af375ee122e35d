use chrono::{SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Success,
    /// Test build: the engine was skipped on purpose.
    Nobuild,
    GitFailed,
    UnityBuildFailed,
    UploadFailed,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Success => "success",
            BuildStatus::Nobuild => "nobuild",
            BuildStatus::GitFailed => "git_failed",
            BuildStatus::UnityBuildFailed => "unity_build_failed",
            BuildStatus::UploadFailed => "upload_failed",
            BuildStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What gets published to the completion topic, once per request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BuildResult {
    pub build_id: String,
    pub status: BuildStatus,
    pub gcs_path: String,
    pub commit: String,
    pub branch: String,
    pub timestamp: String,
    pub session_id: String,
}

impl BuildResult {
    pub fn new(build_id: &str, commit: &str, branch: &str, session_id: &str) -> BuildResult {
        BuildResult {
            build_id: build_id.to_string(),
            status: BuildStatus::Failed,
            gcs_path: String::new(),
            commit: commit.to_string(),
            branch: branch.to_string(),
            timestamp: String::new(),
            session_id: session_id.to_string(),
        }
    }

    pub fn finish(mut self, status: BuildStatus) -> BuildResult {
        self.status = status;
        self.timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self
    }

    /// The small, indexable subset sent as message attributes.
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("build_id".to_string(), self.build_id.clone());
        attributes.insert("status".to_string(), self.status.to_string());
        if !self.session_id.is_empty() {
            attributes.insert("session_id".to_string(), self.session_id.clone());
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_as_snake_case() {
        for status in &[
            BuildStatus::Success,
            BuildStatus::Nobuild,
            BuildStatus::GitFailed,
            BuildStatus::UnityBuildFailed,
            BuildStatus::UploadFailed,
            BuildStatus::Failed,
        ] {
            let json = serde_json::to_string(status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn published_payload_reads_back() {
        let mut result = BuildResult::new("42", "abc123", "main", "42").finish(BuildStatus::Success);
        result.gcs_path = "gs://bucket/builds/main/abc123/42.zip".to_string();

        let json = serde_json::to_string(&result).unwrap();
        let back: BuildResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.build_id, "42");
        assert_eq!(back.status, BuildStatus::Success);
        assert_eq!(back.gcs_path, "gs://bucket/builds/main/abc123/42.zip");
        assert!(back.timestamp.ends_with('Z'));
    }

    #[test]
    fn attributes_mirror_id_status_and_session() {
        let result = BuildResult::new("42", "", "", "").finish(BuildStatus::GitFailed);
        let attributes = result.attributes();
        assert_eq!(attributes["status"], "git_failed");
        assert_eq!(attributes["build_id"], "42");
        assert!(!attributes.contains_key("session_id"));
    }
}
