use crate::config_file::Config;
use crate::integrations::command_runner::{CommandRunner, Invocation, ToolOutput};
use crate::integrations::git_integration::GitIntegration;
use crate::listener::Listener;
use crate::stop_signal::StopSignal;
use failure::Error;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const PULL_ARGS: [&str; 3] = ["pubsub", "subscriptions", "pull"];

/// Checks git is on the path, the repo has a HEAD, and origin answers.
pub fn check_git<R: CommandRunner>(config: &Config, runner: &R) -> Result<String, Error> {
    let git = GitIntegration::new(runner, &config.tools.git, &config.paths.repo, config.timeouts.git());
    let summary = git.check_connectivity()?;
    info!("--Diagnostics--: git OK for {}: {}", config.paths.repo.display(), summary);
    Ok(summary)
}

/// Stands in for the subscription during the smoke test. Every pull comes
/// back empty, so no real request is acked or built; anything other than a
/// pull is refused.
#[derive(Default)]
pub struct IdleSubscription {
    pulls: AtomicUsize,
}

impl IdleSubscription {
    pub fn new() -> IdleSubscription {
        IdleSubscription {
            pulls: AtomicUsize::new(0),
        }
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

impl CommandRunner for IdleSubscription {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, Error> {
        let is_pull = invocation.args.iter().take(3).map(String::as_str).eq(PULL_ARGS.iter().cloned());
        if !is_pull {
            bail!("smoke test does not run '{}'", invocation);
        }
        self.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput {
            exit_code: Some(0),
            ..ToolOutput::default()
        })
    }
}

/// Starts the listener twice: once with the sentinel already present (it must
/// exit without polling), and once with the sentinel created while it runs
/// (it must exit within `grace`). Leaves no sentinel behind. Returns how many
/// polls the second run made.
pub fn smoke_test(config: &Config, settle: Duration, grace: Duration) -> Result<usize, Error> {
    let sentinel = config.listener.stop_file.clone();
    if sentinel.exists() {
        bail!(
            "{} already exists; clear it before running the smoke test",
            sentinel.display()
        );
    }
    if let Some(parent) = sentinel.parent() {
        crate::folders::ensure_folder(parent)?;
    }
    let stop = StopSignal::new(&sentinel);
    let subscription = IdleSubscription::new();

    fs::write(&sentinel, b"smoke test")?;
    let handled = Listener::new(config, &subscription, &stop).run();
    let still_there = sentinel.exists();
    fs::remove_file(&sentinel)?;
    if handled != 0 || subscription.pulls() != 0 || !still_there {
        bail!("listener didn't honour a pre-existing stop file");
    }
    info!("--Diagnostics--: Stop file present at start: listener exited immediately.");

    let outcome = thread::scope(|scope| -> Result<(usize, Duration), Error> {
        let listener = scope.spawn(|| Listener::new(config, &subscription, &stop).run());
        thread::sleep(settle);
        let written = fs::write(&sentinel, b"smoke test");
        if written.is_err() {
            // Still have to get the listener out of its loop before bailing.
            stop.interrupt();
        }
        let signalled = Instant::now();
        let joined = listener.join();
        written?;
        let handled = joined.map_err(|_| format_err!("listener thread panicked"))?;
        Ok((handled, signalled.elapsed()))
    });
    let removed = fs::remove_file(&sentinel);
    let (handled, elapsed) = outcome?;
    removed?;

    if handled != 0 {
        bail!("listener handled {} request(s) during the smoke test", handled);
    }
    if elapsed > grace {
        bail!("listener took {:?} to stop, more than the allowed {:?}", elapsed, grace);
    }
    info!(
        "--Diagnostics--: Listener stopped {:?} after the stop file appeared ({} poll(s)).",
        elapsed,
        subscription.pulls()
    );
    Ok(subscription.pulls())
}
