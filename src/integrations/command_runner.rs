use crate::errors::ListenerError;
use crate::stop_signal::StopSignal;
use failure::Error;
use std::fmt;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

const WAIT_SLICE: Duration = Duration::from_millis(500);
/// Minimum time given to the pipes after the process itself has exited.
const PIPE_GRACE: Duration = Duration::from_millis(500);
const PIPE_CHUNK: usize = 8 * 1024;
/// Per stream. Anything past this is still drained but not kept.
pub const MAX_CAPTURED_BYTES: usize = 4 * 1024 * 1024;

/// One call to an external tool.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Whether a stop request kills the process before it finishes.
    pub cancellable: bool,
}

impl Invocation {
    pub fn new(program: &str, timeout: Duration) -> Invocation {
        Invocation {
            program: program.to_string(),
            args: Vec::new(),
            timeout,
            cancellable: true,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Invocation {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn not_cancellable(mut self) -> Invocation {
        self.cancellable = false;
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    /// None when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn into_result(self, invocation: &Invocation) -> Result<ToolOutput, ListenerError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ListenerError::ToolFailed {
                command: invocation.to_string(),
                exit_code: self.exit_code,
                stdout: self.stdout.trim().to_string(),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Everything that shells out goes through this, so tests can stand in for
/// git, gcloud, gsutil and Unity.
pub trait CommandRunner {
    /// Runs the invocation to completion. A non-zero exit is NOT an error here;
    /// errors are spawn failures, timeouts and cancellation.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, Error>;

    /// Like `run`, but a non-zero exit becomes `ListenerError::ToolFailed`.
    fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput, Error> {
        let output = self.run(invocation)?;
        Ok(output.into_result(invocation)?)
    }
}

pub struct SystemRunner {
    stop: StopSignal,
}

impl SystemRunner {
    pub fn new(stop: StopSignal) -> SystemRunner {
        SystemRunner { stop }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput, Error> {
        debug!("--Runner--: {}", invocation);

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| format_err!("Unable to start {}: {}", invocation.program, e))?;

        // Drain both pipes on their own threads so a chatty tool can't fill a
        // pipe buffer and block forever while we wait on it.
        let (chunks_tx, chunks_rx) = mpsc::channel();
        if let Some(pipe) = child.stdout.take() {
            spawn_pipe_reader(pipe, Stream::Stdout, chunks_tx.clone());
        }
        if let Some(pipe) = child.stderr.take() {
            spawn_pipe_reader(pipe, Stream::Stderr, chunks_tx.clone());
        }
        drop(chunks_tx);

        let started = Instant::now();
        let status = loop {
            let waited = match child.wait_timeout(WAIT_SLICE) {
                Ok(waited) => waited,
                Err(e) => {
                    kill_and_reap(&mut child);
                    return Err(format_err!("Lost track of '{}': {}", invocation, e));
                }
            };
            if let Some(status) = waited {
                break status;
            }
            if started.elapsed() >= invocation.timeout {
                kill_and_reap(&mut child);
                warn!("--Runner--: Killed '{}' after {:?}", invocation, invocation.timeout);
                return Err(ListenerError::ToolTimeout {
                    command: invocation.to_string(),
                    timeout_secs: invocation.timeout.as_secs(),
                }
                .into());
            }
            if invocation.cancellable && self.stop.is_stop_requested() {
                kill_and_reap(&mut child);
                warn!("--Runner--: Killed '{}' because a stop was requested", invocation);
                return Err(ListenerError::Cancelled {
                    command: invocation.to_string(),
                }
                .into());
            }
        };

        // Anything the tool left running in the background still holds the
        // pipes open, so reading is bounded by the same deadline.
        let cutoff = (started + invocation.timeout).max(Instant::now() + PIPE_GRACE);
        let (stdout, stderr, complete) = collect_output(&chunks_rx, cutoff);
        if !complete {
            warn!(
                "--Runner--: '{}' exited but something still holds its output open; keeping what was read so far",
                invocation
            );
        }

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Stream {
    Stdout,
    Stderr,
}

fn spawn_pipe_reader<P>(mut pipe: P, stream: Stream, chunks: Sender<(Stream, Vec<u8>)>)
where
    P: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; PIPE_CHUNK];
        let mut kept = 0;
        loop {
            let read = match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => read,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let keep = read.min(MAX_CAPTURED_BYTES - kept);
            if keep == 0 {
                continue;
            }
            kept += keep;
            // The receiver is gone once the runner gave up waiting on us.
            if chunks.send((stream, buf[..keep].to_vec())).is_err() {
                break;
            }
        }
    });
}

/// Gathers chunks until both readers hang up or `cutoff` passes. The flag is
/// false when the readers were left behind.
fn collect_output(chunks: &Receiver<(Stream, Vec<u8>)>, cutoff: Instant) -> (Vec<u8>, Vec<u8>, bool) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let now = Instant::now();
        if now >= cutoff {
            return (stdout, stderr, false);
        }
        match chunks.recv_timeout(cutoff - now) {
            Ok((Stream::Stdout, chunk)) => stdout.extend_from_slice(&chunk),
            Ok((Stream::Stderr, chunk)) => stderr.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => return (stdout, stderr, true),
            Err(RecvTimeoutError::Timeout) => return (stdout, stderr, false),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    /// Answers every invocation with the closure and remembers what it was asked.
    pub struct ScriptedRunner<F>
    where
        F: Fn(&Invocation) -> Result<ToolOutput, Error>,
    {
        respond: F,
        calls: RefCell<Vec<Invocation>>,
    }

    impl<F> ScriptedRunner<F>
    where
        F: Fn(&Invocation) -> Result<ToolOutput, Error>,
    {
        pub fn new(respond: F) -> ScriptedRunner<F> {
            ScriptedRunner {
                respond,
                calls: RefCell::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.borrow().clone()
        }

        /// How many calls started with the given program and leading args.
        pub fn count(&self, program: &str, leading_args: &[&str]) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|call| matches(call, program, leading_args))
                .count()
        }
    }

    impl<F> CommandRunner for ScriptedRunner<F>
    where
        F: Fn(&Invocation) -> Result<ToolOutput, Error>,
    {
        fn run(&self, invocation: &Invocation) -> Result<ToolOutput, Error> {
            self.calls.borrow_mut().push(invocation.clone());
            (self.respond)(invocation)
        }
    }

    pub fn matches(call: &Invocation, program: &str, leading_args: &[&str]) -> bool {
        call.program == program
            && call.args.len() >= leading_args.len()
            && call.args.iter().zip(leading_args).all(|(a, b)| a == b)
    }

    /// Git calls carry `-C <repo>` up front; this skips past it.
    pub fn git_args(call: &Invocation) -> Vec<&str> {
        let args: Vec<&str> = call.args.iter().map(String::as_str).collect();
        if args.first() == Some(&"-C") {
            args[2..].to_vec()
        } else {
            args
        }
    }

    pub fn ok(stdout: &str) -> Result<ToolOutput, Error> {
        Ok(ToolOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn exit(code: i32, stderr: &str) -> Result<ToolOutput, Error> {
        Ok(ToolOutput {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}
