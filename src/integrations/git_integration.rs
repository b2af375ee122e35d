use crate::errors::ListenerError;
use crate::integrations::command_runner::{CommandRunner, Invocation, ToolOutput};
use failure::Error;
use std::path::Path;
use std::time::Duration;

const MIN_ABBREVIATED_HASH: usize = 7;

/// Where the reconciler got to. Logged at every transition.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconcileState {
    Unknown,
    Fetched,
    VerifiedLocal,
    NeedsPull,
    VerifiedAfterPull,
    CheckedOut,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// HEAD already pointed at the commit; nothing was touched.
    AlreadyAtCommit,
    /// The commit was checked out. `pulled` is true if the branch had to be fast-forwarded first.
    CheckedOut { pulled: bool },
}

pub struct GitIntegration<'a, R: CommandRunner> {
    runner: &'a R,
    git: &'a str,
    repo: &'a Path,
    timeout: Duration,
}

impl<'a, R: CommandRunner> GitIntegration<'a, R> {
    pub fn new(runner: &'a R, git: &'a str, repo: &'a Path, timeout: Duration) -> GitIntegration<'a, R> {
        GitIntegration {
            runner,
            git,
            repo,
            timeout,
        }
    }

    fn git<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(self.git, self.timeout)
            .arg("-C")
            .arg(self.repo.to_string_lossy().into_owned())
            .args(args)
    }

    fn run_git(&self, args: &[&str]) -> Result<ToolOutput, Error> {
        let invocation = self.git(args.iter().cloned());
        let result = self.runner.run_checked(&invocation);
        if let Err(ref e) = result {
            warn!("--Git--: '{}' failed: {}", invocation, e);
        }
        result
    }

    pub fn head_commit(&self) -> Result<String, Error> {
        let output = self.run_git(&["rev-parse", "HEAD"])?;
        Ok(output.stdout.trim().to_string())
    }

    /// Asks the object store what `object` is. `Ok(None)` means git didn't
    /// know it (non-zero exit); the raw output comes back either way.
    fn object_type(&self, object: &str) -> Result<(Option<String>, String), Error> {
        let invocation = self.git(vec!["cat-file", "-t", object]);
        let output = self.runner.run(&invocation)?;
        let raw = format!("{}{}", output.stdout.trim(), output.stderr.trim());
        if output.success() {
            Ok((Some(output.stdout.trim().to_string()), raw))
        } else {
            Ok((None, raw))
        }
    }

    fn is_local_commit(&self, commit: &str) -> Result<(bool, String), Error> {
        let (kind, raw) = self.object_type(commit)?;
        Ok((kind.as_ref().map(String::as_str) == Some("commit"), raw))
    }

    /// Leaves the working tree detached at `commit`, fetching and
    /// fast-forwarding `branch` only when the commit isn't already known locally.
    pub fn reconcile(&self, branch: &str, commit: &str) -> Result<ReconcileOutcome, Error> {
        let commit = commit.trim();
        check_ref_name("commit hash", commit)?;
        check_ref_name("branch", branch)?;

        let mut state = ReconcileState::Unknown;
        match self.head_commit() {
            Ok(head) => {
                if head_matches(&head, commit) {
                    info!("--Git--: HEAD is already at {}, skipping git operations.", commit);
                    return Ok(ReconcileOutcome::AlreadyAtCommit);
                }
                info!("--Git--: HEAD is at {}, want {} on '{}'.", head, commit, branch);
            }
            // An unborn or broken HEAD just means we have work to do.
            Err(e) => info!("--Git--: Couldn't read HEAD ({}), reconciling anyway.", e),
        }

        self.run_git(&["fetch", "--all"])?;
        state = self.advance(state, ReconcileState::Fetched);

        let (present, _) = self.is_local_commit(commit)?;
        let pulled = if present {
            state = self.advance(state, ReconcileState::VerifiedLocal);
            false
        } else {
            state = self.advance(state, ReconcileState::NeedsPull);
            self.run_git(&["checkout", branch])?;
            self.run_git(&["pull", "--ff-only", "origin", branch])?;

            let (present, raw) = self.is_local_commit(commit)?;
            if !present {
                warn!("--Git--: {} still isn't a commit after pulling '{}': {}", commit, branch, raw);
                return Err(ListenerError::CommitUnreachable {
                    commit: commit.to_string(),
                    branch: branch.to_string(),
                    output: raw,
                }
                .into());
            }
            state = self.advance(state, ReconcileState::VerifiedAfterPull);
            true
        };

        self.run_git(&["checkout", "--detach", commit])?;
        self.advance(state, ReconcileState::CheckedOut);
        Ok(ReconcileOutcome::CheckedOut { pulled })
    }

    /// Legacy requests name a ref rather than a (branch, commit) pair. Branch
    /// refs are fast-forwarded after checkout; tags and hashes are taken as-is.
    pub fn checkout_ref(&self, git_ref: &str) -> Result<(), Error> {
        let git_ref = git_ref.trim();
        check_ref_name("git ref", git_ref)?;

        self.run_git(&["fetch", "--all"])?;
        self.run_git(&["checkout", git_ref])?;

        let branch_ref = format!("refs/heads/{}", git_ref);
        let is_branch = self
            .runner
            .run(&self.git(vec!["show-ref", "--verify", "--quiet", branch_ref.as_str()]))?
            .success();
        if is_branch {
            self.run_git(&["pull", "--ff-only", "origin", git_ref])?;
        }
        info!("--Git--: Checked out '{}'.", git_ref);
        Ok(())
    }

    /// Connectivity check: can we read HEAD, and can we reach the remote?
    pub fn check_connectivity(&self) -> Result<String, Error> {
        self.run_git(&["--version"])?;
        let head = self.head_commit()?;
        let remotes = self.run_git(&["ls-remote", "--heads", "origin"])?;
        let heads = remotes.stdout.lines().filter(|l| !l.trim().is_empty()).count();
        Ok(format!("HEAD {}, origin advertises {} branch(es)", head, heads))
    }

    fn advance(&self, from: ReconcileState, to: ReconcileState) -> ReconcileState {
        debug!("--Git--: {:?} -> {:?}", from, to);
        to
    }
}

/// Names that come off the queue end up as git arguments, so one that
/// starts with `-` would be read as an option.
pub fn check_ref_name(what: &str, value: &str) -> Result<(), ListenerError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ListenerError::Validation {
            reason: format!("{} is empty", what),
        });
    }
    if value.starts_with('-') {
        return Err(ListenerError::Validation {
            reason: format!("{} '{}' starts with '-'", what, value),
        });
    }
    Ok(())
}

pub fn head_matches(head: &str, wanted: &str) -> bool {
    let head = head.trim();
    let wanted = wanted.trim();
    if head.is_empty() || wanted.is_empty() {
        return false;
    }
    if head.eq_ignore_ascii_case(wanted) {
        return true;
    }
    wanted.len() >= MIN_ABBREVIATED_HASH
        && wanted.len() < head.len()
        && wanted.chars().all(|c| c.is_ascii_hexdigit())
        && head.to_ascii_lowercase().starts_with(&wanted.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::command_runner::testing::*;
    use std::path::PathBuf;

    fn repo() -> PathBuf {
        PathBuf::from("/work/repo")
    }

    #[test]
    fn head_match_rules() {
        assert!(head_matches("abc123", "abc123"));
        assert!(head_matches("ABC123\n", "abc123"));
        assert!(head_matches("0123456789abcdef0123456789abcdef01234567", "0123456"));
        assert!(!head_matches("0123456789abcdef0123456789abcdef01234567", "012345"));
        assert!(!head_matches("abc123", ""));
        assert!(!head_matches("abc123", "abc124"));
    }

    #[test]
    fn fast_path_touches_nothing_else() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["rev-parse", "HEAD"] => ok("abc123\n"),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        let outcome = git.reconcile("main", "abc123").unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyAtCommit);
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn known_commit_skips_branch_checkout_and_pull() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["rev-parse", "HEAD"] => ok("fff000\n"),
            ["fetch", "--all"] => ok(""),
            ["cat-file", "-t", "abc123"] => ok("commit\n"),
            ["checkout", "--detach", "abc123"] => ok(""),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        let outcome = git.reconcile("main", "abc123").unwrap();
        assert_eq!(outcome, ReconcileOutcome::CheckedOut { pulled: false });
        assert_eq!(runner.count("git", &["-C", "/work/repo", "pull"]), 0);
        assert_eq!(runner.count("git", &["-C", "/work/repo", "checkout", "main"]), 0);
    }

    #[test]
    fn missing_commit_is_pulled_then_checked_out() {
        let runner = ScriptedRunner::new(|call| {
            let args = git_args(call);
            match args.as_slice() {
                ["rev-parse", "HEAD"] => ok("fff000\n"),
                ["fetch", "--all"] => ok(""),
                ["checkout", "main"] => ok(""),
                ["pull", "--ff-only", "origin", "main"] => ok("Fast-forward\n"),
                ["checkout", "--detach", "abc123"] => ok(""),
                ["cat-file", "-t", "abc123"] => exit(128, "fatal: Not a valid object name abc123"),
                other => panic!("unexpected git call {:?}", other),
            }
        });
        let repo = repo();
        // The first cat-file fails, the second succeeds: swap behaviour on the pull.
        let pulled = std::cell::Cell::new(false);
        let stateful = ScriptedRunner::new(|call| {
            let args = git_args(call);
            if args.as_slice() == ["pull", "--ff-only", "origin", "main"] {
                pulled.set(true);
            }
            if args.as_slice() == ["cat-file", "-t", "abc123"] && pulled.get() {
                return ok("commit\n");
            }
            runner.run(call)
        });
        let git = GitIntegration::new(&stateful, "git", &repo, Duration::from_secs(5));

        let outcome = git.reconcile("main", "abc123").unwrap();
        assert_eq!(outcome, ReconcileOutcome::CheckedOut { pulled: true });
        assert_eq!(stateful.count("git", &["-C", "/work/repo", "checkout", "--detach"]), 1);
    }

    #[test]
    fn unreachable_commit_fails_without_final_checkout() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["rev-parse", "HEAD"] => ok("fff000\n"),
            ["fetch", "--all"] => ok(""),
            ["checkout", "main"] => ok(""),
            ["pull", "--ff-only", "origin", "main"] => ok("Already up to date.\n"),
            ["cat-file", "-t", "abc123"] => ok("tree\n"),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        let err = git.reconcile("main", "abc123").unwrap_err();
        match err.downcast::<ListenerError>() {
            Ok(ListenerError::CommitUnreachable { output, .. }) => assert_eq!(output, "tree"),
            other => panic!("expected CommitUnreachable, got {:?}", other),
        }
        assert_eq!(runner.count("git", &["-C", "/work/repo", "checkout", "--detach"]), 0);
        assert_eq!(runner.count("git", &["-C", "/work/repo", "cat-file"]), 2);
    }

    #[test]
    fn fetch_failure_is_fatal_and_not_retried() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["rev-parse", "HEAD"] => ok("fff000\n"),
            ["fetch", "--all"] => exit(1, "fatal: unable to access remote"),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        assert!(git.reconcile("main", "abc123").is_err());
        assert_eq!(runner.count("git", &["-C", "/work/repo", "fetch"]), 1);
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn diverged_branch_fails_on_pull() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["rev-parse", "HEAD"] => ok("fff000\n"),
            ["fetch", "--all"] => ok(""),
            ["cat-file", "-t", "abc123"] => exit(128, "fatal: Not a valid object name"),
            ["checkout", "main"] => ok(""),
            ["pull", "--ff-only", "origin", "main"] => exit(128, "fatal: Not possible to fast-forward, aborting."),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        let err = git.reconcile("main", "abc123").unwrap_err();
        match err.downcast::<ListenerError>() {
            Ok(ListenerError::ToolFailed { stderr, .. }) => assert!(stderr.contains("fast-forward")),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[test]
    fn option_like_names_are_rejected_before_any_git_call() {
        let runner = ScriptedRunner::new(|call| panic!("unexpected call {}", call));
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        for result in vec![
            git.reconcile("--upload-pack=touch /tmp/x", "abc123").map(|_| ()),
            git.reconcile("main", "-p").map(|_| ()),
            git.checkout_ref(" --orphan=evil"),
        ] {
            match result.unwrap_err().downcast::<ListenerError>() {
                Ok(ListenerError::Validation { .. }) => {}
                other => panic!("expected Validation, got {:?}", other),
            }
        }
        assert!(runner.calls().is_empty());
        assert!(check_ref_name("branch", "feature/-dash-inside").is_ok());
    }

    #[test]
    fn empty_commit_is_rejected_before_any_git_call() {
        let runner = ScriptedRunner::new(|call| panic!("unexpected call {}", call));
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));

        let err = git.reconcile("main", "  ").unwrap_err();
        match err.downcast::<ListenerError>() {
            Ok(ListenerError::Validation { .. }) => {}
            other => panic!("expected Validation, got {:?}", other),
        }
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn checkout_ref_pulls_only_branches() {
        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["fetch", "--all"] => ok(""),
            ["checkout", "v1.2.0"] => ok(""),
            ["show-ref", "--verify", "--quiet", "refs/heads/v1.2.0"] => exit(1, ""),
            other => panic!("unexpected git call {:?}", other),
        });
        let repo = repo();
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));
        git.checkout_ref("v1.2.0").unwrap();
        assert_eq!(runner.count("git", &["-C", "/work/repo", "pull"]), 0);

        let runner = ScriptedRunner::new(|call| match git_args(call).as_slice() {
            ["fetch", "--all"] | ["checkout", "develop"] => ok(""),
            ["show-ref", "--verify", "--quiet", "refs/heads/develop"] => ok(""),
            ["pull", "--ff-only", "origin", "develop"] => ok(""),
            other => panic!("unexpected git call {:?}", other),
        });
        let git = GitIntegration::new(&runner, "git", &repo, Duration::from_secs(5));
        git.checkout_ref("develop").unwrap();
        assert_eq!(runner.count("git", &["-C", "/work/repo", "pull"]), 1);
    }
}
