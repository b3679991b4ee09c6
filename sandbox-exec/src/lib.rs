//! Resource-capped execution of untrusted commands.
//!
//! Submitted programs are native code and cannot be trusted to respect any
//! limit on their own, so every compile and every match run goes through a
//! transient `systemd-run` service unit carrying hard caps on memory, CPU
//! time, task count and network access, plus a wall-clock deadline enforced
//! from this side of the fence.
//!
//! The [`Sandbox`] trait is the seam the rest of the system programs
//! against: the server's match pipeline takes any implementation, which is
//! what makes the pipeline testable without `systemd` or a compiler on the
//! host.
//!
//! # Linux-Only
//!
//! [`SystemdSandbox`] requires a Linux host with systemd. On anything else
//! (or for local development) [`UncontainedExec`] runs the command with only
//! the wall-clock deadline applied.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing::{debug, instrument, warn};

/// How a sandboxed command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Exited with status zero within the deadline.
    Success,
    /// Exited on its own with a non-zero status.
    NonZero(i32),
    /// Still running at the deadline and was killed.
    Timeout,
    /// The command could not be started at all.
    LaunchFailure,
}

impl Outcome {
    /// True only for [`Outcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Combined output and final state of one sandboxed run.
#[derive(Debug, Clone)]
pub struct Execution {
    /// Interleaved stdout + stderr of the child, lossily decoded.
    pub output: String,
    /// How the run ended.
    pub outcome: Outcome,
}

impl Execution {
    fn launch_failure(err: &anyhow::Error) -> Execution {
        Execution {
            output: format!("{err:#}"),
            outcome: Outcome::LaunchFailure,
        }
    }
}

/// Executes commands under isolation with a wall-clock deadline.
///
/// `unit` is a human-readable name for the run (it becomes the transient
/// unit name under systemd); `argv` is the full command line including the
/// program itself.
pub trait Sandbox: Send + Sync {
    /// Run `argv` to completion or until `timeout` elapses.
    fn run(&self, unit: &str, argv: &[String], timeout: Duration) -> Execution;
}

/// Resource limits applied to each sandboxed command.
///
/// Obtained through [`SandboxPolicy::builder`]. Defaults match what a single
/// untrusted submission is allowed to consume: 512 MB of RAM, two cores'
/// worth of CPU, 50 tasks, no network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub(crate) memory_max_mb: usize,
    pub(crate) cpu_quota_percent: usize,
    pub(crate) tasks_max: usize,
    pub(crate) private_network: bool,
}

impl SandboxPolicy {
    /// Create a [`SandboxPolicyBuilder`] with the default caps.
    pub fn builder() -> SandboxPolicyBuilder {
        SandboxPolicyBuilder::new()
    }
}

/// Builder for [`SandboxPolicy`].
///
/// ```
/// use sandbox_exec::SandboxPolicy;
///
/// let policy = SandboxPolicy::builder()
///     .with_memory_max_mb(256)
///     .with_cpu_quota_percent(100)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Default)]
pub struct SandboxPolicyBuilder {
    memory_max_mb: Option<usize>,
    cpu_quota_percent: Option<usize>,
    tasks_max: Option<usize>,
    allow_network: bool,
}

impl SandboxPolicyBuilder {
    /// Builder with no overrides; `build` fills in the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hard memory cap in megabytes.
    #[must_use]
    pub fn with_memory_max_mb(mut self, mb: usize) -> Self {
        self.memory_max_mb = Some(mb);
        self
    }

    /// CPU quota in percent, where 100 is one full core.
    #[must_use]
    pub fn with_cpu_quota_percent(mut self, percent: usize) -> Self {
        self.cpu_quota_percent = Some(percent);
        self
    }

    /// Maximum number of threads/processes inside the unit.
    #[must_use]
    pub fn with_tasks_max(mut self, tasks: usize) -> Self {
        self.tasks_max = Some(tasks);
        self
    }

    /// Allow the sandboxed command network access (denied by default).
    #[must_use]
    pub fn with_network_allowed(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    /// Consume the builder and validate the policy.
    ///
    /// The memory cap is checked against the memory actually available on
    /// the host and the CPU quota against the physical core count, so a
    /// misconfigured policy fails at startup rather than at the first match.
    pub fn build(self) -> anyhow::Result<SandboxPolicy> {
        let memory_max_mb = self.memory_max_mb.unwrap_or(512);
        let cpu_quota_percent = self
            .cpu_quota_percent
            .unwrap_or_else(|| 200.min(num_cpus::get_physical() * 100));
        let tasks_max = self.tasks_max.unwrap_or(50);

        if memory_max_mb == 0 {
            bail!("memory cap must be non-zero");
        }
        if cpu_quota_percent == 0 {
            bail!("CPU quota must be non-zero");
        }
        if tasks_max == 0 {
            bail!("task cap must be non-zero");
        }

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let available_mb = (sys.available_memory() / 1_000_000) as usize;
        if available_mb > 0 && memory_max_mb > available_mb {
            warn!("memory cap ({memory_max_mb} MB) exceeds available memory ({available_mb} MB)");
        }

        Ok(SandboxPolicy {
            memory_max_mb,
            cpu_quota_percent,
            tasks_max,
            private_network: !self.allow_network,
        })
    }
}

/// Counter suffix so concurrent or back-to-back runs never reuse a unit name.
static UNIT_COUNTER: AtomicU32 = AtomicU32::new(1);

/// The production sandbox: a transient `systemd-run` service unit.
#[derive(Debug, Clone)]
pub struct SystemdSandbox {
    policy: SandboxPolicy,
}

impl SystemdSandbox {
    /// Sandbox enforcing `policy` on every run.
    pub fn new(policy: SandboxPolicy) -> Self {
        SystemdSandbox { policy }
    }

    fn systemd_argv(&self, unit: &str, argv: &[String]) -> Vec<String> {
        let serial = UNIT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut cmd = vec![
            format!("--unit={unit}-{serial}"),
            "--quiet".to_string(),
            "--collect".to_string(),
            "--pipe".to_string(),
            "--service-type=exec".to_string(),
            format!("--property=MemoryMax={}M", self.policy.memory_max_mb),
            format!("--property=CPUQuota={}%", self.policy.cpu_quota_percent),
            format!("--property=TasksMax={}", self.policy.tasks_max),
            "--property=PrivateTmp=true".to_string(),
            "--property=NoNewPrivileges=true".to_string(),
        ];
        if self.policy.private_network {
            cmd.push("--property=PrivateNetwork=true".to_string());
        }
        cmd.push("--".to_string());
        cmd.extend(argv.iter().cloned());
        cmd
    }
}

impl Sandbox for SystemdSandbox {
    #[instrument(skip_all, fields(unit = unit))]
    fn run(&self, unit: &str, argv: &[String], timeout: Duration) -> Execution {
        let systemd_argv = self.systemd_argv(unit, argv);
        match spawn("systemd-run", &systemd_argv) {
            Ok(child) => supervise(child, timeout),
            Err(e) => {
                warn!("could not launch systemd-run: {e:#}");
                Execution::launch_failure(&e)
            }
        }
    }
}

/// Fallback executor applying only the wall-clock deadline.
///
/// Resource caps are NOT enforced; intended for development hosts without
/// systemd, never for real submissions.
#[derive(Debug, Clone, Default)]
pub struct UncontainedExec;

impl Sandbox for UncontainedExec {
    #[instrument(skip_all, fields(unit = unit))]
    fn run(&self, unit: &str, argv: &[String], timeout: Duration) -> Execution {
        let Some((program, args)) = argv.split_first() else {
            return Execution {
                output: "empty command line".to_string(),
                outcome: Outcome::LaunchFailure,
            };
        };
        match spawn(program, args) {
            Ok(child) => supervise(child, timeout),
            Err(e) => {
                warn!("could not launch {program}: {e:#}");
                Execution::launch_failure(&e)
            }
        }
    }
}

fn spawn(program: &str, args: &[String]) -> anyhow::Result<Child> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("command '{program}' not found"))
}

/// Wait for the child, killing it when the deadline passes.
///
/// Output is drained on separate threads so a chatty child never blocks on a
/// full pipe while we poll its exit status.
fn supervise(mut child: Child, timeout: Duration) -> Execution {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_reader = std::thread::spawn(move || read_all(stdout));
    let stderr_reader = std::thread::spawn(move || read_all(stderr));

    let deadline = Instant::now() + timeout;
    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    break Outcome::Success;
                }
                break Outcome::NonZero(status.code().unwrap_or(-1));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    if let Err(e) = child.kill() {
                        warn!("failed to kill timed-out child: {e}");
                    }
                    let _ = child.wait();
                    break Outcome::Timeout;
                }
                std::thread::sleep(Duration::from_millis(50).min(timeout / 10));
            }
            Err(e) => {
                warn!("error waiting for child: {e}");
                let _ = child.kill();
                break Outcome::LaunchFailure;
            }
        }
    };

    let mut output = stdout_reader.join().unwrap_or_default();
    let err_output = stderr_reader.join().unwrap_or_default();
    if !err_output.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&err_output);
    }

    debug!(?outcome, bytes = output.len(), "child finished");
    Execution { output, outcome }
}

fn read_all(pipe: Option<impl Read>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = SandboxPolicy::builder().build().unwrap();
        assert_eq!(policy.memory_max_mb, 512);
        assert!(policy.cpu_quota_percent >= 100);
        assert!(policy.cpu_quota_percent <= 200);
        assert_eq!(policy.tasks_max, 50);
        assert!(policy.private_network);
    }

    #[test]
    fn zero_caps_rejected() {
        assert!(SandboxPolicy::builder().with_memory_max_mb(0).build().is_err());
        assert!(SandboxPolicy::builder()
            .with_cpu_quota_percent(0)
            .build()
            .is_err());
        assert!(SandboxPolicy::builder().with_tasks_max(0).build().is_err());
    }

    #[test]
    fn systemd_argv_carries_all_caps() {
        let policy = SandboxPolicy {
            memory_max_mb: 512,
            cpu_quota_percent: 200,
            tasks_max: 50,
            private_network: true,
        };
        let sandbox = SystemdSandbox::new(policy);
        let argv = sandbox.systemd_argv(
            "compile-alice",
            &["g++".to_string(), "-c".to_string(), "x.cpp".to_string()],
        );

        assert!(argv[0].starts_with("--unit=compile-alice-"));
        assert!(argv.contains(&"--property=MemoryMax=512M".to_string()));
        assert!(argv.contains(&"--property=CPUQuota=200%".to_string()));
        assert!(argv.contains(&"--property=TasksMax=50".to_string()));
        assert!(argv.contains(&"--property=PrivateNetwork=true".to_string()));
        assert!(argv.contains(&"--property=PrivateTmp=true".to_string()));
        assert!(argv.contains(&"--property=NoNewPrivileges=true".to_string()));

        let sep = argv.iter().position(|a| a == "--").unwrap();
        assert_eq!(&argv[sep + 1..], &["g++", "-c", "x.cpp"]);
    }

    #[test]
    fn network_can_be_allowed() {
        let policy = SandboxPolicy::builder()
            .with_network_allowed(true)
            .build()
            .unwrap();
        let sandbox = SystemdSandbox::new(policy);
        let argv = sandbox.systemd_argv("unit", &["true".to_string()]);
        assert!(!argv.contains(&"--property=PrivateNetwork=true".to_string()));
    }

    #[test]
    fn unit_names_are_unique() {
        let sandbox = SystemdSandbox::new(SandboxPolicy::builder().build().unwrap());
        let a = sandbox.systemd_argv("m", &["true".to_string()]);
        let b = sandbox.systemd_argv("m", &["true".to_string()]);
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn uncontained_captures_output_and_status() {
        let exec = UncontainedExec;
        let run = exec.run(
            "echo",
            &["echo".to_string(), "hello".to_string()],
            Duration::from_secs(5),
        );
        assert_eq!(run.outcome, Outcome::Success);
        assert_eq!(run.output.trim(), "hello");
    }

    #[test]
    fn uncontained_reports_nonzero_exit() {
        let exec = UncontainedExec;
        let run = exec.run(
            "false",
            &["false".to_string()],
            Duration::from_secs(5),
        );
        assert_eq!(run.outcome, Outcome::NonZero(1));
    }

    #[test]
    fn uncontained_times_out() {
        let exec = UncontainedExec;
        let start = Instant::now();
        let run = exec.run(
            "sleep",
            &["sleep".to_string(), "10".to_string()],
            Duration::from_millis(200),
        );
        assert_eq!(run.outcome, Outcome::Timeout);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn uncontained_launch_failure() {
        let exec = UncontainedExec;
        let run = exec.run(
            "missing",
            &["definitely-not-a-real-binary-9f2a".to_string()],
            Duration::from_secs(1),
        );
        assert_eq!(run.outcome, Outcome::LaunchFailure);
    }

}
