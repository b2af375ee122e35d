use crate::integrations::command_runner::{CommandRunner, Invocation};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which editor entry point to run.
#[derive(Clone, Debug, PartialEq)]
pub enum BuildTarget {
    /// Full player build, written to `<output>/<executable_name>`.
    Game { executable_name: String },
    /// Asset bundles only, keyed by the requesting session.
    AssetBundles { session_id: String },
}

pub struct UnityIntegration<'a, R: CommandRunner> {
    runner: &'a R,
    unity: &'a Path,
    project: &'a Path,
    log_file: &'a Path,
    game_method: &'a str,
    asset_bundle_method: &'a str,
    timeout: Duration,
}

impl<'a, R: CommandRunner> UnityIntegration<'a, R> {
    pub fn new(
        runner: &'a R,
        unity: &'a Path,
        project: &'a Path,
        log_file: &'a Path,
        game_method: &'a str,
        asset_bundle_method: &'a str,
        timeout: Duration,
    ) -> UnityIntegration<'a, R> {
        UnityIntegration {
            runner,
            unity,
            project,
            log_file,
            game_method,
            asset_bundle_method,
            timeout,
        }
    }

    pub fn invocation(&self, target: &BuildTarget, output_folder: &Path) -> Invocation {
        let method = match target {
            BuildTarget::Game { .. } => self.game_method,
            BuildTarget::AssetBundles { .. } => self.asset_bundle_method,
        };
        let invocation = Invocation::new(&self.unity.to_string_lossy(), self.timeout)
            .args(vec!["-batchmode", "-nographics", "-quit"])
            .arg("-projectPath")
            .arg(path_arg(self.project))
            .arg("-logFile")
            .arg(path_arg(self.log_file))
            .arg("-executeMethod")
            .arg(method);

        match target {
            BuildTarget::Game { executable_name } => {
                let exe_path: PathBuf = output_folder.join(executable_name);
                invocation.arg("-buildPath").arg(path_arg(&exe_path))
            }
            BuildTarget::AssetBundles { session_id } => invocation
                .arg("-sessionId")
                .arg(session_id.as_str())
                .arg("-outputPath")
                .arg(path_arg(output_folder)),
        }
    }

    /// Blocks until the editor exits. True only for exit code 0; the editor
    /// log at `log_file` is the place to look when this returns false.
    pub fn build(&self, target: &BuildTarget, output_folder: &Path) -> bool {
        let invocation = self.invocation(target, output_folder);
        info!("--Unity--: Starting build: {}", invocation);

        match self.runner.run(&invocation) {
            Ok(output) if output.success() => {
                info!("--Unity--: Build finished successfully.");
                true
            }
            Ok(output) => {
                warn!(
                    "--Unity--: Build exited with {:?}. See {} for details.",
                    output.exit_code,
                    self.log_file.display()
                );
                false
            }
            Err(e) => {
                warn!("--Unity--: Build did not complete: {}", e);
                false
            }
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
