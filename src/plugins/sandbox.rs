//! Isolated execution contexts
//!
//! An [`IsolationBackend`] turns plugin source into a running execution
//! context that speaks the JSON message protocol. [`ProcessSandbox`] runs
//! each plugin as its own OS process with a cleared environment, a private
//! scratch directory and resource limits, exchanging newline-delimited JSON
//! over stdin/stdout.

use super::protocol::{MessageType, Permission, PluginMessage, PluginMetadata};
use crate::config::SandboxConfig;
use crate::error::LoadError;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Events flowing from an execution context to the host
#[derive(Debug, Clone, PartialEq)]
pub enum ContextEvent {
    Message(PluginMessage),
    /// The isolation boundary itself failed; the context is gone
    Crashed(String),
}

/// Destroys an execution context. Dropping the handle must do the same.
pub trait ContextHandle: Send {
    fn terminate(&mut self);
}

/// A freshly spawned context. Both channels exist before any plugin code runs.
pub struct ExecutionContext {
    pub sender: mpsc::UnboundedSender<PluginMessage>,
    pub events: mpsc::UnboundedReceiver<ContextEvent>,
    pub handle: Box<dyn ContextHandle>,
}

/// Creates isolated execution contexts for plugin source
pub trait IsolationBackend: Send + Sync {
    fn spawn(&self, source: &str, metadata: &PluginMetadata) -> Result<ExecutionContext, LoadError>;
}

/// OS resource limits applied to a sandboxed process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space_bytes: Option<u64>,
    pub cpu_seconds: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub open_files: Option<u64>,
}

impl ResourceLimits {
    #[cfg(unix)]
    fn apply(&self) -> nix::Result<()> {
        use nix::sys::resource::Resource;

        if let Some(bytes) = self.address_space_bytes {
            lower_limit(Resource::RLIMIT_AS, bytes)?;
        }
        if let Some(secs) = self.cpu_seconds {
            lower_limit(Resource::RLIMIT_CPU, secs)?;
        }
        if let Some(bytes) = self.file_size_bytes {
            lower_limit(Resource::RLIMIT_FSIZE, bytes)?;
        }
        if let Some(files) = self.open_files {
            lower_limit(Resource::RLIMIT_NOFILE, files)?;
        }
        Ok(())
    }
}

/// Set both soft and hard limits, never above the inherited hard limit
#[cfg(unix)]
fn lower_limit(resource: nix::sys::resource::Resource, value: u64) -> nix::Result<()> {
    use nix::libc::rlim_t;
    use nix::sys::resource::{getrlimit, setrlimit};

    let (_, hard) = getrlimit(resource)?;
    let value = (value as rlim_t).min(hard);
    setrlimit(resource, value, value)
}

/// Everything needed to launch one plugin inside the sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxProfile {
    /// Program to execute; `None` runs the source file itself
    pub program: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    /// File name the source is written to inside the scratch directory
    pub file_name: String,
}

impl SandboxProfile {
    /// Build the launch profile for a validated manifest
    pub fn build(config: &SandboxConfig, metadata: &PluginMetadata) -> Self {
        let granted = metadata.granted();
        let file_name = Path::new(&metadata.entry)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "plugin".to_string());

        let extension = Path::new(&file_name)
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase());

        let (program, args) = match extension
            .as_deref()
            .and_then(|ext| config.interpreters.get(ext))
            .and_then(|i| i.command.split_first().map(|(p, rest)| (i, p, rest)))
        {
            Some((interpreter, program, rest)) => {
                let mut args = rest.to_vec();
                for permission in &granted {
                    if let Some(extra) = interpreter.permission_args.get(permission.as_str()) {
                        args.extend(extra.iter().cloned());
                    }
                }
                args.push(file_name.clone());
                (Some(program.clone()), args)
            }
            None => (None, vec![]),
        };

        let mut env = vec![
            ("PATH".to_string(), config.path.clone()),
            ("PLUGIN_NAME".to_string(), metadata.name.clone()),
            ("PLUGIN_VERSION".to_string(), metadata.version.clone()),
            ("PLUGIN_CAPABILITIES".to_string(), config.capabilities.join(",")),
            (
                "PLUGIN_PERMISSIONS".to_string(),
                granted.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(","),
            ),
        ];
        if granted.contains(&Permission::Env) {
            for key in &config.env_passthrough {
                if let Ok(value) = std::env::var(key) {
                    env.push((key.clone(), value));
                }
            }
        }

        let mb = |n: u64| (n > 0).then(|| n.saturating_mul(1024 * 1024));
        let limits = ResourceLimits {
            address_space_bytes: mb(config.max_memory_mb),
            cpu_seconds: (config.max_cpu_seconds > 0).then_some(config.max_cpu_seconds),
            file_size_bytes: if granted.contains(&Permission::Write) {
                mb(config.max_file_size_mb)
            } else {
                Some(0)
            },
            open_files: (config.max_open_files > 0).then_some(config.max_open_files),
        };

        Self {
            program,
            args,
            env,
            limits,
            file_name,
        }
    }

    fn command(&self, workdir: &Path) -> Command {
        let script = workdir.join(&self.file_name);
        let mut command = match &self.program {
            Some(program) => Command::new(program),
            None => Command::new(&script),
        };
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("HOME", workdir)
            .env("TMPDIR", workdir)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            // Own process group, so termination reaches everything the plugin started
            command.process_group(0);

            let limits = self.limits;
            // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
            unsafe {
                command.pre_exec(move || limits.apply().map_err(std::io::Error::from));
            }
        }

        command
    }
}

/// Runs each plugin in a separate, resource-limited OS process
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn prepare_workdir(
        &self,
        source: &str,
        metadata: &PluginMetadata,
        profile: &SandboxProfile,
    ) -> std::io::Result<(TempDir, PathBuf)> {
        let prefix = format!("plugin-{}-", sanitize(&metadata.name));
        let workdir = tempfile::Builder::new().prefix(&prefix).tempdir()?;
        let script = workdir.path().join(&profile.file_name);
        std::fs::write(&script, source)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok((workdir, script))
    }
}

impl IsolationBackend for ProcessSandbox {
    fn spawn(
        &self,
        source: &str,
        metadata: &PluginMetadata,
    ) -> Result<ExecutionContext, LoadError> {
        let spawn_error = |reason: String| LoadError::Spawn {
            plugin: metadata.name.clone(),
            reason,
        };

        let profile = SandboxProfile::build(&self.config, metadata);
        let (workdir, script) = self
            .prepare_workdir(source, metadata, &profile)
            .map_err(|e| spawn_error(format!("failed to prepare sandbox directory: {}", e)))?;

        debug!(
            plugin = %metadata.name,
            program = ?profile.program,
            script = ?script,
            "Spawning sandboxed process"
        );

        let mut child = profile
            .command(workdir.path())
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child.stdin.take().ok_or_else(|| spawn_error("no stdin pipe".to_string()))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error("no stdout pipe".to_string()))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_error("no stderr pipe".to_string()))?;
        let pid = child.id();

        let (sender, outbound) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let name = metadata.name.clone();

        tokio::spawn(write_messages(stdin, outbound));
        tokio::spawn(read_stderr(stderr, name.clone(), event_tx.clone()));
        let reader = tokio::spawn(read_messages(
            stdout,
            name,
            self.config.max_message_bytes,
            event_tx.clone(),
        ));
        tokio::spawn(supervise(child, pid, reader, kill_rx, event_tx));

        Ok(ExecutionContext {
            sender,
            events,
            handle: Box::new(ProcessHandle {
                kill: Some(kill_tx),
                pid,
                _workdir: workdir,
            }),
        })
    }
}

struct ProcessHandle {
    kill: Option<oneshot::Sender<()>>,
    pid: Option<u32>,
    _workdir: TempDir,
}

impl ContextHandle for ProcessHandle {
    fn terminate(&mut self) {
        if let Some(kill) = self.kill.take() {
            debug!(pid = ?self.pid, "Killing sandboxed process");
            let _ = kill.send(());
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

async fn write_messages(
    mut stdin: tokio::process::ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<PluginMessage>,
) {
    while let Some(message) = outbound.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                continue;
            }
        };
        line.push('\n');
        if stdin.write_all(line.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

async fn read_messages(
    stdout: tokio::process::ChildStdout,
    plugin: String,
    max_message_bytes: usize,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        // Read at most one byte past the limit so oversized lines are never buffered whole
        let limit = max_message_bytes as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.len() > max_message_bytes {
            let _ = events.send(ContextEvent::Crashed(format!(
                "message exceeds the {} byte limit",
                max_message_bytes
            )));
            return;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        // Stray stdout text is console output, not protocol
        let message = serde_json::from_str::<PluginMessage>(line)
            .unwrap_or_else(|_| PluginMessage::console(MessageType::Info, &plugin, line));
        if events.send(ContextEvent::Message(message)).is_err() {
            return;
        }
    }
}

async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    plugin: String,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let message = PluginMessage::console(MessageType::Debug, &plugin, &line);
        if events.send(ContextEvent::Message(message)).is_err() {
            return;
        }
    }
}

/// Owns the child: kills it on request, or reports its exit once stdout is drained
async fn supervise(
    mut child: tokio::process::Child,
    pid: Option<u32>,
    reader: tokio::task::JoinHandle<()>,
    kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ContextEvent>,
) {
    tokio::select! {
        status = child.wait() => {
            let _ = tokio::time::timeout(Duration::from_secs(1), reader).await;
            let reason = match status {
                Ok(status) => format!("sandbox process exited ({})", status),
                Err(e) => format!("failed to wait for sandbox process: {}", e),
            };
            kill_group(pid);
            let _ = events.send(ContextEvent::Crashed(reason));
        }
        _ = kill => {
            kill_group(pid);
            let _ = child.start_kill();
            let _ = child.wait().await;
            reader.abort();
        }
    }
}

/// SIGKILL the process group led by the sandboxed child
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, "Failed to kill sandbox process group: {}", e),
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// In-process backend driven by a closure, for exercising the executor
#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub(crate) type Behavior = Arc<dyn Fn(&PluginMessage) -> Vec<PluginMessage> + Send + Sync>;

    #[derive(Clone)]
    pub(crate) struct ScriptedBackend {
        behavior: Behavior,
        latency: Duration,
        pub(crate) received: Arc<Mutex<Vec<PluginMessage>>>,
    }

    impl ScriptedBackend {
        pub(crate) fn new<F>(behavior: F) -> Self
        where
            F: Fn(&PluginMessage) -> Vec<PluginMessage> + Send + Sync + 'static,
        {
            Self {
                behavior: Arc::new(behavior),
                latency: Duration::ZERO,
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = latency;
            self
        }

        pub(crate) fn received_of(&self, kind: MessageType) -> usize {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.kind == kind)
                .count()
        }
    }

    struct ScriptedHandle {
        kill: Option<oneshot::Sender<()>>,
    }

    impl ContextHandle for ScriptedHandle {
        fn terminate(&mut self) {
            if let Some(kill) = self.kill.take() {
                let _ = kill.send(());
            }
        }
    }

    impl Drop for ScriptedHandle {
        fn drop(&mut self) {
            self.terminate();
        }
    }

    impl IsolationBackend for ScriptedBackend {
        fn spawn(
            &self,
            _source: &str,
            _metadata: &PluginMetadata,
        ) -> Result<ExecutionContext, LoadError> {
            let (sender, mut inbound) = mpsc::unbounded_channel::<PluginMessage>();
            let (event_tx, events) = mpsc::unbounded_channel();
            let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
            let behavior = self.behavior.clone();
            let received = self.received.clone();
            let latency = self.latency;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = inbound.recv() => {
                            let Some(message) = message else { break };
                            received.lock().unwrap().push(message.clone());
                            let replies = behavior(&message);
                            if !latency.is_zero() {
                                tokio::time::sleep(latency).await;
                            }
                            for reply in replies {
                                let _ = event_tx.send(ContextEvent::Message(reply));
                            }
                        }
                        _ = &mut kill_rx => break,
                    }
                }
            });

            Ok(ExecutionContext {
                sender,
                events,
                handle: Box::new(ScriptedHandle { kill: Some(kill_tx) }),
            })
        }
    }

    /// Reply helper: a message answering `request`
    pub(crate) fn reply(request: &PluginMessage, kind: MessageType) -> PluginMessage {
        PluginMessage::request(kind, &request.id, &request.plugin_name, None)
    }

    /// Accepts `init` and answers every other message through `on_execute`
    pub(crate) fn initialized<F>(on_execute: F) -> ScriptedBackend
    where
        F: Fn(&PluginMessage) -> Vec<PluginMessage> + Send + Sync + 'static,
    {
        ScriptedBackend::new(move |message| match message.kind {
            MessageType::Init => {
                let mut ok = reply(message, MessageType::InitResult);
                ok.success = Some(true);
                vec![ok]
            }
            _ => on_execute(message),
        })
    }
}
