use crate::build_request::decode_message;
use crate::build_result::{BuildResult, BuildStatus};
use crate::config_file::Config;
use crate::errors::ListenerError;
use crate::integrations::command_runner::CommandRunner;
use crate::integrations::pubsub_integration::PubSubIntegration;
use crate::pipeline::{BuildJob, BuildPipeline};
use crate::stop_signal::StopSignal;
use std::thread;
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

/// What one pass through the loop ended up doing.
#[derive(Debug, PartialEq)]
pub enum Iteration {
    StopRequested,
    Idle,
    PollFailed,
    ParseFailed,
    Dropped,
    Completed(BuildStatus),
}

pub struct Listener<'a, R: CommandRunner> {
    config: &'a Config,
    runner: &'a R,
    stop: &'a StopSignal,
}

impl<'a, R: CommandRunner> Listener<'a, R> {
    pub fn new(config: &'a Config, runner: &'a R, stop: &'a StopSignal) -> Listener<'a, R> {
        Listener { config, runner, stop }
    }

    /// Loops until a stop is requested. Returns how many requests were handled.
    pub fn run(&self) -> usize {
        info!(
            "--Listener--: Listening on {}. Create {} to stop.",
            self.config.listener.subscription,
            self.stop.sentinel().display()
        );
        let mut handled = 0;
        loop {
            match self.run_once() {
                Iteration::StopRequested => break,
                Iteration::Completed(_) => handled += 1,
                Iteration::Idle | Iteration::PollFailed | Iteration::ParseFailed | Iteration::Dropped => {}
            }
            self.sleep();
        }
        info!("--Listener--: Stop requested, exiting after {} request(s).", handled);
        handled
    }

    pub fn run_once(&self) -> Iteration {
        if self.stop.is_stop_requested() {
            return Iteration::StopRequested;
        }

        let pubsub = PubSubIntegration::new(self.runner, &self.config.tools.gcloud, self.config.timeouts.pubsub());
        let message = match pubsub.pull_one(&self.config.listener.subscription) {
            Ok(Some(message)) => message,
            Ok(None) => return Iteration::Idle,
            Err(e) => {
                warn!("--Listener--: Polling {} failed: {}", self.config.listener.subscription, e);
                return Iteration::PollFailed;
            }
        };
        info!("--Listener--: Received message {}", message.message_id);

        let inbound = match decode_message(&message) {
            Ok(inbound) => inbound,
            Err(e) => {
                error!("--Listener--: {}", e);
                return Iteration::ParseFailed;
            }
        };

        let pipeline = BuildPipeline::new(self.config, self.runner);
        match BuildJob::from_message(&inbound) {
            Ok(job) => Iteration::Completed(pipeline.run(&job).status),
            Err(e @ ListenerError::UnrecognizedCommand { .. }) => {
                warn!("--Listener--: Dropping message {}: {}", message.message_id, e);
                Iteration::Dropped
            }
            Err(e) => {
                error!("--Listener--: Rejecting build {}: {}", inbound.build_id(), e);
                let result = BuildResult::new(
                    inbound.build_id(),
                    inbound.commit_hash(),
                    inbound.branch_name(),
                    inbound.session_id(),
                )
                .finish(BuildStatus::Failed);
                pipeline.publish(&result);
                Iteration::Completed(BuildStatus::Failed)
            }
        }
    }

    fn sleep(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.listener.poll_interval_secs);
        while Instant::now() < deadline {
            if self.stop.is_stop_requested() {
                return;
            }
            thread::sleep(SLEEP_SLICE);
        }
    }
}
