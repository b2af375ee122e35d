use crate::build_request::{BuildCommand, InboundMessage};
use crate::build_result::{BuildResult, BuildStatus};
use crate::config_file::Config;
use crate::errors::ListenerError;
use crate::folders::reset_folder;
use crate::integrations::command_runner::CommandRunner;
use crate::integrations::git_integration::{check_ref_name, GitIntegration};
use crate::integrations::pubsub_integration::PubSubIntegration;
use crate::integrations::storage_integration::{normalize_prefix, StorageIntegration};
use crate::integrations::unity_integration::{BuildTarget, UnityIntegration};
use std::fs;
use std::path::{Path, PathBuf};

const PLACEHOLDER_FILE: &str = "NOBUILD.txt";

#[derive(Clone, Debug, PartialEq)]
pub enum GitTarget {
    /// Structured requests: a branch plus the exact commit to build.
    Commit { branch: String, commit: String },
    /// Legacy requests: whatever ref came after the colon.
    Ref(String),
    /// Legacy requests without a ref build what's already checked out.
    Current,
}

/// A request that has been decoded, dispatched and validated.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildJob {
    pub command: BuildCommand,
    pub build_id: String,
    pub git: GitTarget,
    pub skip_build: bool,
    pub session_id: String,
}

impl BuildJob {
    pub fn from_message(message: &InboundMessage) -> Result<BuildJob, ListenerError> {
        let command = BuildCommand::parse(message.command())?;
        match message {
            InboundMessage::Structured(request) => {
                let commit = checked_name(&request.build_id, "commit_hash", &request.commit_hash)?;
                let branch = checked_name(&request.build_id, "branch_name", &request.branch_name)?;
                Ok(BuildJob {
                    command,
                    build_id: request.build_id.clone(),
                    git: GitTarget::Commit { branch, commit },
                    skip_build: request.is_test_build,
                    session_id: message.session_id().to_string(),
                })
            }
            InboundMessage::Legacy(request) => Ok(BuildJob {
                command,
                build_id: request.build_id.clone(),
                git: match &request.git_ref {
                    Some(git_ref) => GitTarget::Ref(checked_name(&request.build_id, "git ref", git_ref)?),
                    None => GitTarget::Current,
                },
                skip_build: request.nobuild,
                session_id: message.session_id().to_string(),
            }),
        }
    }

    fn branch(&self) -> &str {
        match &self.git {
            GitTarget::Commit { branch, .. } => branch,
            GitTarget::Ref(git_ref) => git_ref,
            GitTarget::Current => "",
        }
    }

    fn commit(&self) -> &str {
        match &self.git {
            GitTarget::Commit { commit, .. } => commit,
            _ => "",
        }
    }
}

/// Queue-supplied names go straight onto git's command line.
fn checked_name(build_id: &str, field: &str, value: &str) -> Result<String, ListenerError> {
    match check_ref_name(field, value) {
        Ok(()) => Ok(value.trim().to_string()),
        Err(ListenerError::Validation { reason }) => Err(ListenerError::Validation {
            reason: format!("build {}: {}", build_id, reason),
        }),
        Err(other) => Err(other),
    }
}

pub struct BuildPipeline<'a, R: CommandRunner> {
    config: &'a Config,
    runner: &'a R,
}

impl<'a, R: CommandRunner> BuildPipeline<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R) -> BuildPipeline<'a, R> {
        BuildPipeline { config, runner }
    }

    /// Runs every phase for the job and publishes the outcome.
    pub fn run(&self, job: &BuildJob) -> BuildResult {
        let result = self.execute(job);
        info!(
            "--Pipeline--: Build {} finished with status '{}' {}",
            result.build_id, result.status, result.gcs_path
        );
        self.publish(&result);
        result
    }

    /// Publishes a result. A lost notification is logged, never fatal.
    pub fn publish(&self, result: &BuildResult) -> bool {
        let pubsub = PubSubIntegration::new(self.runner, &self.config.tools.gcloud, self.config.timeouts.pubsub());
        pubsub.publish(
            &self.config.listener.completion_topic,
            &result.attributes(),
            result,
            self.config.listener.encode_completion_base64,
        )
    }

    fn execute(&self, job: &BuildJob) -> BuildResult {
        let mut result = BuildResult::new(&job.build_id, job.commit(), job.branch(), &job.session_id);
        info!("--Pipeline--: Build {}: {} ({:?})", job.build_id, job.command, job.git);

        // git
        let git = GitIntegration::new(
            self.runner,
            &self.config.tools.git,
            &self.config.paths.repo,
            self.config.timeouts.git(),
        );
        let git_result = match &job.git {
            GitTarget::Commit { branch, commit } => git.reconcile(branch, commit).map(|_| ()),
            GitTarget::Ref(git_ref) => git.checkout_ref(git_ref),
            GitTarget::Current => Ok(()),
        };
        if let Err(e) = git_result {
            error!("--Pipeline--: Git phase failed for build {}: {}", job.build_id, e);
            return result.finish(BuildStatus::GitFailed);
        }
        if result.commit.is_empty() {
            if let Ok(head) = git.head_commit() {
                result.commit = head;
            }
        }

        // build
        let output_folder = self.output_folder(job);
        if let Err(e) = reset_folder(&output_folder) {
            error!("--Pipeline--: Unable to prepare {}: {}", output_folder.display(), e);
            return result.finish(BuildStatus::Failed);
        }
        if job.skip_build {
            info!("--Pipeline--: Test build {}, skipping Unity.", job.build_id);
            if let Err(e) = write_placeholder(&output_folder, job) {
                error!("--Pipeline--: Unable to write placeholder artifact: {}", e);
                return result.finish(BuildStatus::Failed);
            }
        } else {
            let unity = UnityIntegration::new(
                self.runner,
                &self.config.tools.unity,
                &self.config.paths.project,
                &self.config.paths.unity_log_file,
                &self.config.build.game_method,
                &self.config.build.asset_bundle_method,
                self.config.timeouts.unity(),
            );
            if !unity.build(&self.build_target(job), &output_folder) {
                return result.finish(BuildStatus::UnityBuildFailed);
            }
        }

        // upload
        let storage = StorageIntegration::new(
            self.runner,
            &self.config.tools.gsutil,
            &self.config.upload.bucket,
            self.config.upload.mode,
            self.config.timeouts.upload(),
        );
        match storage.upload_folder(&output_folder, &self.upload_prefix(job, &result.commit)) {
            Some(destination) => result.gcs_path = destination,
            None => return result.finish(BuildStatus::UploadFailed),
        }

        if job.skip_build {
            result.finish(BuildStatus::Nobuild)
        } else {
            result.finish(BuildStatus::Success)
        }
    }

    fn build_target(&self, job: &BuildJob) -> BuildTarget {
        match job.command {
            BuildCommand::StartBuild => BuildTarget::Game {
                executable_name: self.config.build.executable_name.clone(),
            },
            BuildCommand::BuildAssetBundles => BuildTarget::AssetBundles {
                session_id: job.session_id.clone(),
            },
        }
    }

    fn output_folder(&self, job: &BuildJob) -> PathBuf {
        self.config.paths.build_output.join(path_safe(&job.build_id))
    }

    fn upload_prefix(&self, job: &BuildJob, commit: &str) -> String {
        let root = &self.config.upload.prefix;
        let prefix = match job.command {
            BuildCommand::StartBuild => format!(
                "{}/{}/{}",
                root,
                job.branch(),
                if commit.is_empty() { "unknown" } else { commit }
            ),
            BuildCommand::BuildAssetBundles => format!("{}/bundles/{}", root, job.session_id),
        };
        normalize_prefix(&prefix)
    }
}

fn path_safe(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

fn write_placeholder(folder: &Path, job: &BuildJob) -> std::io::Result<()> {
    fs::write(
        folder.join(PLACEHOLDER_FILE),
        format!("Test build {} ({}). Unity was not run.\n", job.build_id, job.command),
    )
}
