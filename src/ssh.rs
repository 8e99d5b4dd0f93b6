//! Remote execution inside the guest VM.
//!
//! A [`Runner`] executes shell commands in the guest through an abstract
//! [`Driver`], which supplies a remote-shell client for the configured
//! private key. The concrete [`OpenSshDriver`] shells out to the system
//! `ssh` binary against the host-forwarded guest port.
//!
//! Visibility contract: [`Runner::run`] logs the full command text and its
//! output at debug level; [`Runner::run_private`] logs only that a command
//! ran and whether it succeeded, because it carries secrets (credential
//! material embedded in the command line). Execution semantics are otherwise
//! identical.
//!
//! All calls are synchronous and blocking; a single `Runner` issues one
//! remote command at a time. Callers needing parallel remote operations use
//! separate runners.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

// ---------------------------------------------------------------------------
// Driver abstraction
// ---------------------------------------------------------------------------

/// A live remote-shell channel into the guest.
pub trait SshClient: Send {
    /// Run `command` in the guest, returning its combined stdout/stderr.
    /// A non-zero exit status is an error carrying the captured output.
    fn output(&mut self, command: &str) -> Result<String>;
}

/// Abstraction over a hypervisor backend's remote-shell access.
///
/// One implementation exists per backend; this module depends only on the
/// capability of producing an [`SshClient`] for a given private key.
pub trait Driver: Send + Sync {
    fn ssh_client(&self, private_key: &Path) -> Result<Box<dyn SshClient>>;
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes commands and installs files inside the guest VM.
///
/// Stateless across calls except for the private-key path, which may be
/// swapped after key rotation during provisioning.
pub struct Runner {
    driver: Arc<dyn Driver>,
    private_key: RwLock<PathBuf>,
}

impl Runner {
    pub fn new(driver: Arc<dyn Driver>, private_key: impl Into<PathBuf>) -> Self {
        Self { driver, private_key: RwLock::new(private_key.into()) }
    }

    /// Run a command in the guest, logging command and output at debug level.
    pub fn run(&self, command: &str) -> Result<String> {
        self.run_from_driver(command, false)
    }

    /// Run a command in the guest without logging the command text or its
    /// output. For operations carrying secrets.
    pub fn run_private(&self, command: &str) -> Result<String> {
        self.run_from_driver(command, true)
    }

    /// Swap the private key used for subsequent commands.
    pub fn set_private_key_path(&self, path: impl Into<PathBuf>) {
        *self.private_key.write().expect("private key lock poisoned") = path.into();
    }

    /// Install a file in the guest with exact content and permission bits.
    ///
    /// Two elevated primitives run in a single remote invocation: `install`
    /// creates the empty destination with the requested mode, then the
    /// base64 payload is streamed through a heredoc into `tee`. The file
    /// therefore never exists with default permissions, even momentarily.
    pub fn copy_data(&self, data: &[u8], dest_filename: &str, mode: u32) -> Result<()> {
        debug!(
            dest = %dest_filename,
            mode = %format!("0{mode:o}"),
            "installing file in the guest"
        );
        let encoded = BASE64.encode(data);
        let command = format!(
            "sudo install -m 0{mode:o} /dev/null {dest} && \
             cat <<EOF | base64 --decode | sudo tee {dest}\n{encoded}\nEOF",
            dest = dest_filename,
        );
        self.run_private(&command).map(drop)
    }

    /// [`Runner::copy_data`] sourced from a local file's bytes. Fails before
    /// any remote interaction if the local file cannot be read.
    pub fn copy_file(&self, src_filename: &Path, dest_filename: &str, mode: u32) -> Result<()> {
        let data = std::fs::read(src_filename)
            .with_context(|| format!("read local file {}", src_filename.display()))?;
        self.copy_data(&data, dest_filename, mode)
    }

    fn run_from_driver(&self, command: &str, private: bool) -> Result<String> {
        let key = self
            .private_key
            .read()
            .expect("private key lock poisoned")
            .clone();

        let mut client = self
            .driver
            .ssh_client(&key)
            .context("obtain ssh client from driver")?;

        if private {
            debug!("running remote command with hidden output");
        } else {
            debug!(command = %command, "running remote command");
        }

        match client.output(command) {
            Ok(output) => {
                if private {
                    debug!("remote command succeeded");
                } else {
                    debug!(output = %output, "remote command succeeded");
                }
                Ok(output)
            }
            Err(e) => {
                if private {
                    debug!("remote command failed");
                } else {
                    debug!(error = %e, "remote command failed");
                }
                Err(anyhow!(
                    "remote command error:\ncommand : {command}\nerr     : {e}"
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Privileged execution wrapper
// ---------------------------------------------------------------------------

/// Command execution surface handed to provisioning logic.
///
/// All three operations flatten the command name and argument list into a
/// single shell command line joined by spaces; callers own any quoting or
/// escaping their arguments need.
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<String>;
    fn run_private(&self, cmd: &str, args: &[&str]) -> Result<String>;
    /// Run with elevation (`sudo` prefix). `reason` is logged, not executed.
    fn run_privileged(&self, reason: &str, cmd_and_args: &[&str]) -> Result<String>;
}

/// [`CommandRunner`] executing over a shared [`Runner`].
pub struct RemoteCommandRunner {
    runner: Arc<Runner>,
}

impl RemoteCommandRunner {
    pub fn new(runner: Arc<Runner>) -> Self {
        Self { runner }
    }
}

impl CommandRunner for RemoteCommandRunner {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.runner.run(&flatten(cmd, args))
    }

    fn run_private(&self, cmd: &str, args: &[&str]) -> Result<String> {
        self.runner.run_private(&flatten(cmd, args))
    }

    fn run_privileged(&self, reason: &str, cmd_and_args: &[&str]) -> Result<String> {
        debug!(reason = %reason, "running privileged remote command");
        let commandline = format!("sudo {}", cmd_and_args.join(" "));
        self.runner.run(&commandline)
    }
}

fn flatten(cmd: &str, args: &[&str]) -> String {
    std::iter::once(cmd)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

// ---------------------------------------------------------------------------
// OpenSSH-based driver
// ---------------------------------------------------------------------------

/// SSH options shared by every invocation.
///
/// * `StrictHostKeyChecking=no` — guest images are ephemeral; host keys
///   change on every fresh image boot.
/// * `UserKnownHostsFile=/dev/null` — don't pollute the host's known_hosts.
/// * `LogLevel=ERROR` — suppress banner noise from the guest sshd.
/// * `BatchMode=yes` — fail immediately if a password prompt would appear.
const SSH_OPTS: &[&str] = &[
    "-o", "StrictHostKeyChecking=no",
    "-o", "UserKnownHostsFile=/dev/null",
    "-o", "LogLevel=ERROR",
    "-o", "BatchMode=yes",
    "-o", "ConnectTimeout=5",
];

/// Driver backed by the system `ssh` binary against a host-forwarded port.
pub struct OpenSshDriver {
    host: String,
    port: u16,
    user: String,
}

impl OpenSshDriver {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self { host: host.into(), port, user: user.into() }
    }
}

impl Driver for OpenSshDriver {
    fn ssh_client(&self, private_key: &Path) -> Result<Box<dyn SshClient>> {
        Ok(Box::new(OpenSshClient {
            target: format!("{}@{}", self.user, self.host),
            port: self.port,
            private_key: private_key.to_path_buf(),
        }))
    }
}

struct OpenSshClient {
    target: String,
    port: u16,
    private_key: PathBuf,
}

impl SshClient for OpenSshClient {
    fn output(&mut self, command: &str) -> Result<String> {
        let output = std::process::Command::new("ssh")
            .args(SSH_OPTS)
            .args(["-i", &self.private_key.to_string_lossy()])
            .args(["-p", &self.port.to_string()])
            .arg(&self.target)
            .arg(command)
            .output()
            .context("spawn ssh")?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            bail!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                combined.trim_end()
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Driver test double: every client it hands out records the commands it
    /// receives into a shared log and replies with a canned response.
    struct MockDriver {
        commands: Arc<Mutex<Vec<String>>>,
        response: std::result::Result<String, String>,
    }

    impl MockDriver {
        fn replying(output: &str) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let commands = Arc::new(Mutex::new(Vec::new()));
            let driver = Arc::new(Self {
                commands: commands.clone(),
                response: Ok(output.to_owned()),
            });
            (driver, commands)
        }

        fn failing(message: &str) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
            let commands = Arc::new(Mutex::new(Vec::new()));
            let driver = Arc::new(Self {
                commands: commands.clone(),
                response: Err(message.to_owned()),
            });
            (driver, commands)
        }
    }

    impl Driver for MockDriver {
        fn ssh_client(&self, _private_key: &Path) -> Result<Box<dyn SshClient>> {
            Ok(Box::new(MockClient {
                commands: self.commands.clone(),
                response: self.response.clone(),
            }))
        }
    }

    struct MockClient {
        commands: Arc<Mutex<Vec<String>>>,
        response: std::result::Result<String, String>,
    }

    impl SshClient for MockClient {
        fn output(&mut self, command: &str) -> Result<String> {
            self.commands.lock().unwrap().push(command.to_owned());
            match &self.response {
                Ok(output) => Ok(output.clone()),
                Err(message) => Err(anyhow!("{message}")),
            }
        }
    }

    /// Driver that cannot produce a client at all.
    struct BrokenDriver;

    impl Driver for BrokenDriver {
        fn ssh_client(&self, _private_key: &Path) -> Result<Box<dyn SshClient>> {
            bail!("no such machine")
        }
    }

    fn runner_with(driver: Arc<dyn Driver>) -> Runner {
        Runner::new(driver, "/tmp/id_ecdsa")
    }

    #[test]
    fn run_returns_remote_output() {
        let (driver, commands) = MockDriver::replying("linux\n");
        let runner = runner_with(driver);

        let output = runner.run("uname").expect("run succeeds");

        assert_eq!(output, "linux\n");
        assert_eq!(commands.lock().unwrap().as_slice(), ["uname"]);
    }

    #[test]
    fn run_error_embeds_command_and_output() {
        let (driver, _) = MockDriver::failing("exit 1: not found");
        let runner = runner_with(driver);

        let err = runner.run("which oc").unwrap_err().to_string();

        assert!(err.contains("which oc"), "error must embed the command: {err}");
        assert!(err.contains("not found"), "error must embed the output: {err}");
    }

    #[test]
    fn driver_failure_is_fatal_to_the_call() {
        let runner = runner_with(Arc::new(BrokenDriver));
        let err = runner.run("true").unwrap_err().to_string();
        assert!(err.contains("obtain ssh client"), "got: {err}");
    }

    #[test]
    fn copy_data_issues_single_install_then_tee_invocation() {
        let (driver, commands) = MockDriver::replying("");
        let runner = runner_with(driver);

        runner
            .copy_data(b"hello world", "/etc/motd", 0o644)
            .expect("copy_data succeeds");

        let sent = commands.lock().unwrap();
        assert_eq!(sent.len(), 1, "exactly one remote invocation");

        let expected = format!(
            "sudo install -m 0644 /dev/null /etc/motd && \
             cat <<EOF | base64 --decode | sudo tee /etc/motd\n{}\nEOF",
            BASE64.encode(b"hello world"),
        );
        assert_eq!(sent[0], expected);
    }

    #[test]
    fn copy_file_fails_before_remote_interaction_when_source_missing() {
        let (driver, commands) = MockDriver::replying("");
        let runner = runner_with(driver);

        let missing = Path::new("/nonexistent/source-file");
        assert!(runner.copy_file(missing, "/etc/dest", 0o600).is_err());
        assert!(commands.lock().unwrap().is_empty(), "no remote call may happen");
    }

    #[test]
    fn set_private_key_path_swaps_key_for_later_calls() {
        struct KeyCheckingDriver {
            seen: Arc<Mutex<Vec<PathBuf>>>,
        }
        impl Driver for KeyCheckingDriver {
            fn ssh_client(&self, private_key: &Path) -> Result<Box<dyn SshClient>> {
                self.seen.lock().unwrap().push(private_key.to_path_buf());
                Ok(Box::new(MockClient {
                    commands: Arc::new(Mutex::new(Vec::new())),
                    response: Ok(String::new()),
                }))
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = Runner::new(
            Arc::new(KeyCheckingDriver { seen: seen.clone() }),
            "/tmp/key-a",
        );

        runner.run("true").unwrap();
        runner.set_private_key_path("/tmp/key-b");
        runner.run("true").unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [PathBuf::from("/tmp/key-a"), PathBuf::from("/tmp/key-b")]
        );
    }

    #[test]
    fn command_runner_flattens_name_and_args() {
        let (driver, commands) = MockDriver::replying("");
        let remote = RemoteCommandRunner::new(Arc::new(runner_with(driver)));

        remote.run("systemctl", &["status", "kubelet"]).unwrap();

        assert_eq!(
            commands.lock().unwrap().as_slice(),
            ["systemctl status kubelet"]
        );
    }

    #[test]
    fn run_privileged_prefixes_sudo() {
        let (driver, commands) = MockDriver::replying("");
        let remote = RemoteCommandRunner::new(Arc::new(runner_with(driver)));

        remote
            .run_privileged("restart the kubelet", &["systemctl", "restart", "kubelet"])
            .unwrap();

        assert_eq!(
            commands.lock().unwrap().as_slice(),
            ["sudo systemctl restart kubelet"]
        );
    }

    // -----------------------------------------------------------------------
    // Logging-visibility contract
    // -----------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct LogSink(Arc<Mutex<Vec<u8>>>);

    impl LogSink {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSink {
        type Writer = LogSink;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture_logs(f: impl FnOnce()) -> String {
        let sink = LogSink::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(sink.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        sink.contents()
    }

    const SECRET_COMMAND: &str = "echo hunter2-pull-secret | login";

    #[test]
    fn run_private_never_logs_command_or_output() {
        let (driver, _) = MockDriver::replying("secret-output-token");
        let runner = runner_with(driver);

        let logs = capture_logs(|| {
            runner.run_private(SECRET_COMMAND).unwrap();
        });

        assert!(!logs.contains("hunter2"), "command text leaked: {logs}");
        assert!(!logs.contains("secret-output-token"), "output leaked: {logs}");
        assert!(logs.contains("remote command succeeded"));
    }

    #[test]
    fn run_private_on_failure_logs_only_the_failure() {
        let (driver, _) = MockDriver::failing("exit 1: denied");
        let runner = runner_with(driver);

        let logs = capture_logs(|| {
            let _ = runner.run_private(SECRET_COMMAND);
        });

        assert!(!logs.contains("hunter2"), "command text leaked: {logs}");
        assert!(logs.contains("remote command failed"));
    }

    #[test]
    fn run_logs_command_and_output() {
        let (driver, _) = MockDriver::replying("Filesystem 1B-blocks");
        let runner = runner_with(driver);

        let logs = capture_logs(|| {
            runner.run("df -B1 /sysroot").unwrap();
        });

        assert!(logs.contains("df -B1 /sysroot"));
        assert!(logs.contains("Filesystem 1B-blocks"));
    }
}
