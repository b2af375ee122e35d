use failure::Fail;

#[derive(Debug, Fail)]
pub enum ListenerError {
    #[fail(display = "Configuration error: {}", reason)]
    Configuration { reason: String },

    #[fail(
        display = "{} exited with {:?}. stdout: '{}' stderr: '{}'",
        command, exit_code, stdout, stderr
    )]
    ToolFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[fail(display = "{} did not finish within {} seconds and was killed.", command, timeout_secs)]
    ToolTimeout { command: String, timeout_secs: u64 },

    #[fail(display = "{} was cancelled because a stop was requested.", command)]
    Cancelled { command: String },

    #[fail(display = "Unable to parse the queue message: {}", reason)]
    Parse { reason: String },

    #[fail(display = "Unrecognized command '{}'.", command)]
    UnrecognizedCommand { command: String },

    #[fail(display = "Invalid build request: {}", reason)]
    Validation { reason: String },

    #[fail(
        display = "Commit {} is not reachable after fetching and fast-forwarding '{}'. git cat-file said: '{}'",
        commit, branch, output
    )]
    CommitUnreachable {
        commit: String,
        branch: String,
        output: String,
    },
}
