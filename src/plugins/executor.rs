//! Plugin executor
//!
//! Owns every loaded plugin and its execution context. All book-keeping
//! (plugin registry, busy flags, pending requests) lives behind a single
//! mutex that is never held across an await point; plugins run fully in
//! parallel with each other.
//!
//! Per plugin: `Loading -> Ready -> (Busy <-> Ready)* -> Terminated`. A
//! plugin accepts one request at a time. A request that times out takes the
//! whole plugin down with it.

use super::protocol::{generate_request_id, MessageType, PluginMessage, PluginMetadata};
use super::sandbox::{ContextEvent, ContextHandle, ExecutionContext, IsolationBackend};
use crate::config::SandboxConfig;
use crate::error::{ExecError, LoadError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Timeouts applied by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    pub execution_timeout: Duration,
    pub init_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(10),
            init_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SandboxConfig> for ExecutorOptions {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            execution_timeout: config.execution_timeout(),
            init_timeout: config.init_timeout(),
        }
    }
}

/// Observable lifecycle state of a plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Loading,
    Ready,
    Busy,
}

struct LoadedPlugin {
    metadata: PluginMetadata,
    /// Distinguishes successive loads under the same name
    instance: u64,
    sender: mpsc::UnboundedSender<PluginMessage>,
    handle: Box<dyn ContextHandle>,
    router: Option<JoinHandle<()>>,
    busy: bool,
}

struct PendingRequest {
    plugin: String,
    instance: u64,
    responder: oneshot::Sender<Result<Value, ExecError>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    plugins: HashMap<String, LoadedPlugin>,
    loading: HashSet<String>,
    pending: HashMap<String, PendingRequest>,
}

/// A name held in `Registry::loading`. Dropping it, for instance with an
/// abandoned `load` future, frees the name again.
struct Reservation<'a> {
    inner: &'a Inner,
    name: Option<String>,
}

impl Reservation<'_> {
    /// Free the name under a lock the caller already holds
    fn release(mut self, registry: &mut Registry) {
        if let Some(name) = self.name.take() {
            registry.loading.remove(&name);
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(name) = self.name.take() {
            self.inner.registry().loading.remove(&name);
        }
    }
}

struct Inner {
    backend: Arc<dyn IsolationBackend>,
    options: ExecutorOptions,
    registry: Mutex<Registry>,
    next_instance: AtomicU64,
}

/// Loads plugins into isolated contexts and correlates their responses
pub struct SandboxExecutor {
    inner: Arc<Inner>,
}

impl SandboxExecutor {
    /// Create an executor on top of an isolation backend
    pub fn new(backend: Arc<dyn IsolationBackend>, options: ExecutorOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                options,
                registry: Mutex::new(Registry::default()),
                next_instance: AtomicU64::new(1),
            }),
        }
    }

    pub fn options(&self) -> ExecutorOptions {
        self.inner.options
    }

    /// Load plugin source and complete the initialization handshake.
    ///
    /// On any failure the context is destroyed and nothing stays registered.
    pub async fn load(&self, source: &str, metadata: PluginMetadata) -> Result<(), LoadError> {
        let name = metadata.name.clone();
        let reservation = {
            let mut registry = self.inner.registry();
            if registry.plugins.contains_key(&name) || !registry.loading.insert(name.clone()) {
                return Err(LoadError::Duplicate(name));
            }
            Reservation {
                inner: &self.inner,
                name: Some(name.clone()),
            }
        };

        let result = self.start(source, &metadata).await;

        let mut registry = self.inner.registry();
        reservation.release(&mut registry);
        let context = result?;

        let instance = self.inner.next_instance.fetch_add(1, Ordering::Relaxed);
        let ExecutionContext {
            sender,
            events,
            handle,
        } = context;

        // Routing starts while the registry is locked, so it can never
        // observe the plugin as missing
        let router = tokio::spawn(route_events(
            Arc::downgrade(&self.inner),
            name.clone(),
            instance,
            events,
        ));
        registry.plugins.insert(
            name.clone(),
            LoadedPlugin {
                metadata,
                instance,
                sender,
                handle,
                router: Some(router),
                busy: false,
            },
        );

        info!(plugin = %name, "Plugin ready");
        Ok(())
    }

    async fn start(
        &self,
        source: &str,
        metadata: &PluginMetadata,
    ) -> Result<ExecutionContext, LoadError> {
        let mut context = self.inner.backend.spawn(source, metadata)?;

        match self.handshake(&mut context, &metadata.name).await {
            Ok(()) => Ok(context),
            Err(e) => {
                context.handle.terminate();
                Err(e)
            }
        }
    }

    async fn handshake(&self, context: &mut ExecutionContext, name: &str) -> Result<(), LoadError> {
        let crashed = |reason: String| LoadError::Crashed {
            plugin: name.to_string(),
            reason,
        };

        let init = PluginMessage::request(MessageType::Init, &generate_request_id(), name, None);
        context
            .sender
            .send(init)
            .map_err(|_| crashed("execution context closed before init".to_string()))?;

        let events = &mut context.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Some(ContextEvent::Message(message)) => match message.kind {
                        MessageType::InitResult if message.success == Some(true) => return Ok(()),
                        MessageType::InitResult | MessageType::Panic => {
                            return Err(LoadError::InitFailed {
                                plugin: name.to_string(),
                                reason: message
                                    .error
                                    .unwrap_or_else(|| "plugin reported failure".to_string()),
                            })
                        }
                        _ => log_unsolicited(name, &message),
                    },
                    Some(ContextEvent::Crashed(reason)) => return Err(crashed(reason)),
                    None => return Err(crashed("execution context closed".to_string())),
                }
            }
        };

        let timeout = self.inner.options.init_timeout;
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| LoadError::InitTimeout {
                plugin: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Send a payload to a plugin and wait for its result.
    ///
    /// Fails immediately, without sending anything, when the plugin is not
    /// loaded or already has a request in flight.
    pub async fn execute(&self, name: &str, payload: Value) -> Result<Value, ExecError> {
        let (responder, response) = oneshot::channel();
        {
            let mut registry = self.inner.registry();
            let registry = &mut *registry;
            let plugin = registry
                .plugins
                .get_mut(name)
                .ok_or_else(|| ExecError::NotFound(name.to_string()))?;
            if plugin.busy {
                return Err(ExecError::Busy(name.to_string()));
            }

            plugin.busy = true;
            let request_id = generate_request_id();
            let timer = spawn_timer(&self.inner, request_id.clone());
            registry.pending.insert(
                request_id.clone(),
                PendingRequest {
                    plugin: name.to_string(),
                    instance: plugin.instance,
                    responder,
                    timer,
                },
            );

            let message =
                PluginMessage::request(MessageType::Execute, &request_id, name, Some(payload));
            if plugin.sender.send(message).is_err() {
                plugin.busy = false;
                if let Some(pending) = registry.pending.remove(&request_id) {
                    pending.timer.abort();
                }
                return Err(ExecError::Disconnected(name.to_string()));
            }
            debug!(plugin = %name, request = %request_id, "Dispatched execute");
        }

        response
            .await
            .unwrap_or_else(|_| Err(ExecError::Terminated(name.to_string())))
    }

    /// Destroy a plugin and reject its outstanding requests. No-op when absent.
    pub fn terminate(&self, name: &str) -> bool {
        self.inner.terminate(name, None, "terminated on request")
    }

    /// Terminate every plugin and clear the pending-request table
    pub fn cleanup_all(&self) {
        let names: Vec<String> = self.inner.registry().plugins.keys().cloned().collect();
        for name in names {
            self.inner.terminate(&name, None, "cleanup");
        }

        let leftovers: Vec<PendingRequest> = self
            .inner
            .registry()
            .pending
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for pending in leftovers {
            pending.timer.abort();
            let _ = pending
                .responder
                .send(Err(ExecError::Terminated(pending.plugin)));
        }
    }

    /// Metadata of every loaded plugin
    pub fn loaded_plugins(&self) -> Vec<PluginMetadata> {
        let mut plugins: Vec<PluginMetadata> = self
            .inner
            .registry()
            .plugins
            .values()
            .map(|p| p.metadata.clone())
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.inner.registry().plugins.contains_key(name)
    }

    pub fn plugin_state(&self, name: &str) -> Option<PluginState> {
        let registry = self.inner.registry();
        match registry.plugins.get(name) {
            Some(plugin) if plugin.busy => Some(PluginState::Busy),
            Some(_) => Some(PluginState::Ready),
            None if registry.loading.contains(name) => Some(PluginState::Loading),
            None => None,
        }
    }

    /// Outstanding requests issued to a plugin
    pub fn pending_count(&self, name: &str) -> usize {
        self.inner
            .registry()
            .pending
            .values()
            .filter(|p| p.plugin == name)
            .count()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route one inbound message from a plugin
    fn dispatch(&self, name: &str, instance: u64, message: PluginMessage) {
        match message.kind {
            MessageType::ExecutionResult | MessageType::Panic => {
                if !self.resolve(name, instance, &message) {
                    if message.kind == MessageType::Panic {
                        error!(
                            plugin = %name,
                            request = %message.id,
                            "Uncorrelated panic: {}",
                            message.error.as_deref().unwrap_or("unknown error")
                        );
                    } else {
                        debug!(
                            plugin = %name,
                            request = %message.id,
                            "Dropping uncorrelated result"
                        );
                    }
                }
            }
            _ => log_unsolicited(name, &message),
        }
    }

    /// Complete a pending request. Returns false when the id is not pending
    /// for this plugin instance.
    fn resolve(&self, name: &str, instance: u64, message: &PluginMessage) -> bool {
        let pending = {
            let mut registry = self.registry();
            let owned = registry
                .pending
                .get(&message.id)
                .is_some_and(|p| p.plugin == name && p.instance == instance);
            if !owned {
                return false;
            }
            let pending = registry.pending.remove(&message.id);
            if let Some(plugin) = registry.plugins.get_mut(name) {
                if plugin.instance == instance {
                    plugin.busy = false;
                }
            }
            pending
        };

        let Some(pending) = pending else {
            return false;
        };
        pending.timer.abort();

        let result = if message.kind == MessageType::Panic {
            Err(ExecError::Panic {
                plugin: name.to_string(),
                message: message
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
                stack: message.stack.clone(),
            })
        } else {
            Ok(message.data.clone().unwrap_or(Value::Null))
        };
        let _ = pending.responder.send(result);
        true
    }

    /// Timer fired: reject the request and take the plugin down
    fn expire(&self, request_id: &str) {
        let Some(pending) = self.registry().pending.remove(request_id) else {
            return;
        };

        let timeout_ms = self.options.execution_timeout.as_millis() as u64;
        warn!(
            plugin = %pending.plugin,
            request = %request_id,
            "Execution timed out after {}ms, terminating plugin",
            timeout_ms
        );
        let _ = pending.responder.send(Err(ExecError::Timeout {
            plugin: pending.plugin.clone(),
            timeout_ms,
        }));
        self.terminate(&pending.plugin, Some(pending.instance), "execution timeout");
    }

    /// Remove a plugin and reject everything pending for it. With `instance`
    /// set, only that incarnation of the plugin is affected.
    fn terminate(&self, name: &str, instance: Option<u64>, reason: &str) -> bool {
        let (mut plugin, rejected) = {
            let mut registry = self.registry();
            let matches = registry
                .plugins
                .get(name)
                .is_some_and(|p| instance.map_or(true, |i| i == p.instance));
            if !matches {
                return false;
            }
            let Some(plugin) = registry.plugins.remove(name) else {
                return false;
            };

            let ids: Vec<String> = registry
                .pending
                .iter()
                .filter(|(_, p)| p.plugin == name && p.instance == plugin.instance)
                .map(|(id, _)| id.clone())
                .collect();
            let rejected: Vec<PendingRequest> = ids
                .iter()
                .filter_map(|id| registry.pending.remove(id))
                .collect();
            (plugin, rejected)
        };

        for pending in rejected {
            pending.timer.abort();
            let _ = pending
                .responder
                .send(Err(ExecError::Terminated(name.to_string())));
        }

        plugin.handle.terminate();
        if let Some(router) = plugin.router.take() {
            router.abort();
        }

        info!(plugin = %name, reason = %reason, "Plugin terminated");
        true
    }
}

fn spawn_timer(inner: &Arc<Inner>, request_id: String) -> JoinHandle<()> {
    let timeout = inner.options.execution_timeout;
    let inner = Arc::downgrade(inner);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(inner) = inner.upgrade() {
            inner.expire(&request_id);
        }
    })
}

async fn route_events(
    inner: Weak<Inner>,
    name: String,
    instance: u64,
    mut events: mpsc::UnboundedReceiver<ContextEvent>,
) {
    let mut reason = "execution context closed".to_string();
    while let Some(event) = events.recv().await {
        let Some(executor) = inner.upgrade() else {
            return;
        };
        match event {
            ContextEvent::Message(message) => executor.dispatch(&name, instance, message),
            ContextEvent::Crashed(crash) => {
                reason = crash;
                break;
            }
        }
    }

    if let Some(executor) = inner.upgrade() {
        if executor.registry().plugins.get(&name).is_some_and(|p| p.instance == instance) {
            warn!(plugin = %name, "Execution context failed: {}", reason);
        }
        executor.terminate(&name, Some(instance), &reason);
    }
}

fn log_unsolicited(name: &str, message: &PluginMessage) {
    match message.kind {
        MessageType::Info => info!(plugin = %name, "{}", message.data_text()),
        MessageType::Error => error!(plugin = %name, "{}", message.data_text()),
        MessageType::Debug => debug!(plugin = %name, "{}", message.data_text()),
        MessageType::Progress => {
            debug!(plugin = %name, progress = %message.data_text(), "Progress")
        }
        MessageType::Ready => debug!(plugin = %name, "Execution context ready"),
        MessageType::InitResult => debug!(plugin = %name, "Ignoring late init_result"),
        other => warn!(plugin = %name, "Ignoring unexpected {:?} message", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::protocol::PluginKind;
    use crate::plugins::sandbox::scripted::{initialized, reply, ScriptedBackend};
    use serde_json::json;

    fn executor(backend: ScriptedBackend, timeout_ms: u64) -> SandboxExecutor {
        SandboxExecutor::new(
            Arc::new(backend),
            ExecutorOptions {
                execution_timeout: Duration::from_millis(timeout_ms),
                init_timeout: Duration::from_millis(200),
            },
        )
    }

    fn metadata(name: &str) -> PluginMetadata {
        PluginMetadata::new(name, "1.0.0", "main.ts", PluginKind::Tool)
    }

    /// Adds `a` and `b` from the payload
    fn adder() -> ScriptedBackend {
        initialized(|message| {
            let data = message.data.clone().unwrap_or_default();
            let sum = data["a"].as_i64().unwrap_or(0) + data["b"].as_i64().unwrap_or(0);
            let mut result = reply(message, MessageType::ExecutionResult);
            result.data = Some(json!(sum));
            vec![result]
        })
    }

    /// Accepts init, never answers anything else
    fn silent() -> ScriptedBackend {
        initialized(|_| vec![])
    }

    #[tokio::test]
    async fn test_load_and_execute() {
        let executor = executor(adder(), 1000);
        executor.load("source", metadata("add")).await.unwrap();

        assert_eq!(executor.plugin_state("add"), Some(PluginState::Ready));
        let result = executor.execute("add", json!({"a": 5, "b": 3})).await;
        assert_eq!(result, Ok(json!(8)));
        assert_eq!(executor.plugin_state("add"), Some(PluginState::Ready));
        assert_eq!(executor.pending_count("add"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_load_rejected() {
        let executor = executor(adder(), 1000);
        executor.load("source", metadata("add")).await.unwrap();

        let second = executor.load("source", metadata("add")).await;
        assert_eq!(second, Err(LoadError::Duplicate("add".to_string())));

        // The first instance is untouched
        let result = executor.execute("add", json!({"a": 1, "b": 1})).await;
        assert_eq!(result, Ok(json!(2)));
    }

    #[tokio::test]
    async fn test_failed_init_result() {
        let backend = ScriptedBackend::new(|message| {
            let mut failed = reply(message, MessageType::InitResult);
            failed.success = Some(false);
            failed.error = Some("Plugin must export a plugin object with execute function".into());
            vec![failed]
        });
        let executor = executor(backend, 1000);

        let result = executor.load("source", metadata("broken")).await;
        assert!(matches!(
            result,
            Err(LoadError::InitFailed { ref reason, .. }) if reason.contains("execute function")
        ));
        assert!(!executor.is_loaded("broken"));
        assert_eq!(executor.plugin_state("broken"), None);
    }

    #[tokio::test]
    async fn test_panic_during_init() {
        let backend = ScriptedBackend::new(|message| {
            let mut panic = reply(message, MessageType::Panic);
            panic.error = Some("SyntaxError".into());
            vec![panic]
        });
        let executor = executor(backend, 1000);

        let result = executor.load("source", metadata("bad")).await;
        assert!(matches!(result, Err(LoadError::InitFailed { .. })));
        assert!(executor.loaded_plugins().is_empty());
    }

    #[tokio::test]
    async fn test_init_timeout() {
        let backend = ScriptedBackend::new(|_| vec![]);
        let executor = executor(backend, 1000);

        let result = executor.load("source", metadata("mute")).await;
        assert_eq!(
            result,
            Err(LoadError::InitTimeout {
                plugin: "mute".to_string(),
                timeout_ms: 200
            })
        );
        assert!(!executor.is_loaded("mute"));

        // The name is free again: a retry runs the handshake instead of
        // failing as a duplicate
        let retry = executor.load("source", metadata("mute")).await;
        assert!(matches!(retry, Err(LoadError::InitTimeout { .. })));
        assert_eq!(executor.plugin_state("mute"), None);
    }

    #[tokio::test]
    async fn test_abandoned_load_frees_the_name() {
        let inits = Arc::new(AtomicU64::new(0));
        let seen = inits.clone();
        let backend = ScriptedBackend::new(move |message| {
            // The first handshake never completes
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return vec![];
            }
            let mut ok = reply(message, MessageType::InitResult);
            ok.success = Some(true);
            vec![ok]
        });
        let executor = executor(backend, 1000);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            executor.load("source", metadata("late")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(executor.plugin_state("late"), None);

        executor.load("source", metadata("late")).await.unwrap();
        assert_eq!(executor.plugin_state("late"), Some(PluginState::Ready));
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_init_ignores_log_messages() {
        let backend = ScriptedBackend::new(|message| {
            let mut ok = reply(message, MessageType::InitResult);
            ok.success = Some(true);
            vec![
                PluginMessage::console(MessageType::Ready, "chatty", ""),
                PluginMessage::console(MessageType::Info, "chatty", "init is received"),
                ok,
            ]
        });
        let executor = executor(backend, 1000);

        assert!(executor.load("source", metadata("chatty")).await.is_ok());
    }

    #[tokio::test]
    async fn test_execute_unknown_plugin() {
        let executor = executor(adder(), 1000);
        let result = executor.execute("missing", json!({})).await;
        assert_eq!(result, Err(ExecError::NotFound("missing".to_string())));
    }

    #[tokio::test]
    async fn test_busy_plugin_rejects_second_call() {
        let backend = silent();
        let executor = executor(backend.clone(), 300);
        executor.load("source", metadata("slow")).await.unwrap();

        let (first, second) = tokio::join!(
            executor.execute("slow", json!({"n": 1})),
            executor.execute("slow", json!({"n": 2})),
        );

        assert_eq!(second, Err(ExecError::Busy("slow".to_string())));
        assert!(matches!(first, Err(ExecError::Timeout { .. })));
        // Only the first call reached the plugin
        assert_eq!(backend.received_of(MessageType::Execute), 1);
    }

    #[tokio::test]
    async fn test_timeout_terminates_plugin() {
        let executor = executor(silent(), 100);
        executor.load("source", metadata("hang")).await.unwrap();

        let result = executor.execute("hang", json!({})).await;
        assert_eq!(
            result,
            Err(ExecError::Timeout {
                plugin: "hang".to_string(),
                timeout_ms: 100
            })
        );

        let again = executor.execute("hang", json!({})).await;
        assert_eq!(again, Err(ExecError::NotFound("hang".to_string())));
        assert_eq!(executor.pending_count("hang"), 0);
    }

    #[tokio::test]
    async fn test_panic_rejects_with_stack() {
        let backend = initialized(|message| {
            let mut panic = reply(message, MessageType::Panic);
            panic.error = Some("Unknown operation: divide".into());
            panic.stack = Some("at execute (plugin.ts:12)".into());
            vec![panic]
        });
        let executor = executor(backend, 1000);
        executor.load("source", metadata("math")).await.unwrap();

        let result = executor.execute("math", json!({"operation": "divide"})).await;
        assert_eq!(
            result,
            Err(ExecError::Panic {
                plugin: "math".to_string(),
                message: "Unknown operation: divide".to_string(),
                stack: Some("at execute (plugin.ts:12)".to_string()),
            })
        );

        // A reported fault leaves the plugin usable
        assert_eq!(executor.plugin_state("math"), Some(PluginState::Ready));
    }

    #[tokio::test]
    async fn test_unsolicited_messages_do_not_resolve() {
        let backend = initialized(|message| {
            let mut progress = PluginMessage::console(MessageType::Progress, "p", "");
            progress.data = Some(json!(0.5));
            let mut stray =
                PluginMessage::request(MessageType::ExecutionResult, "someone-else", "p", None);
            stray.data = Some(json!("wrong"));
            let mut result = reply(message, MessageType::ExecutionResult);
            result.data = Some(json!("right"));
            vec![
                PluginMessage::console(MessageType::Info, "p", "working"),
                progress,
                stray,
                result,
            ]
        });
        let executor = executor(backend, 1000);
        executor.load("source", metadata("p")).await.unwrap();

        assert_eq!(executor.execute("p", json!({})).await, Ok(json!("right")));
    }

    #[tokio::test]
    async fn test_duplicate_response_is_ignored() {
        let backend = initialized(|message| {
            let mut first = reply(message, MessageType::ExecutionResult);
            first.data = Some(json!(1));
            let mut second = reply(message, MessageType::ExecutionResult);
            second.data = Some(json!(2));
            vec![first, second]
        });
        let executor = executor(backend, 1000);
        executor.load("source", metadata("twice")).await.unwrap();

        assert_eq!(executor.execute("twice", json!({})).await, Ok(json!(1)));
        assert_eq!(executor.execute("twice", json!({})).await, Ok(json!(1)));
    }

    #[tokio::test]
    async fn test_terminate_rejects_pending() {
        let executor = Arc::new(executor(silent(), 5000));
        executor.load("source", metadata("a")).await.unwrap();
        executor.load("source", metadata("b")).await.unwrap();

        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("a", json!({})).await }
        });
        let second = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("b", json!({})).await }
        });

        while executor.pending_count("a") + executor.pending_count("b") < 2 {
            tokio::task::yield_now().await;
        }

        assert!(executor.terminate("a"));
        assert!(executor.terminate("b"));

        assert_eq!(first.await.unwrap(), Err(ExecError::Terminated("a".to_string())));
        assert_eq!(second.await.unwrap(), Err(ExecError::Terminated("b".to_string())));
        assert_eq!(executor.pending_count("a"), 0);
        assert_eq!(executor.pending_count("b"), 0);
    }

    #[tokio::test]
    async fn test_terminate_rejects_every_request_of_the_plugin() {
        let executor = Arc::new(executor(silent(), 5000));
        executor.load("source", metadata("stuck")).await.unwrap();

        let first = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute("stuck", json!({})).await }
        });
        while executor.pending_count("stuck") < 1 {
            tokio::task::yield_now().await;
        }

        // Busy state never allows a second dispatch, so plant one directly
        let (responder, second) = oneshot::channel();
        {
            let mut registry = executor.inner.registry();
            let instance = registry.plugins["stuck"].instance;
            registry.pending.insert(
                "planted".to_string(),
                PendingRequest {
                    plugin: "stuck".to_string(),
                    instance,
                    responder,
                    timer: tokio::spawn(async {}),
                },
            );
        }
        assert_eq!(executor.pending_count("stuck"), 2);

        assert!(executor.terminate("stuck"));

        assert_eq!(first.await.unwrap(), Err(ExecError::Terminated("stuck".to_string())));
        assert_eq!(second.await.unwrap(), Err(ExecError::Terminated("stuck".to_string())));
        assert_eq!(executor.pending_count("stuck"), 0);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let executor = executor(adder(), 1000);
        executor.load("source", metadata("add")).await.unwrap();

        assert!(executor.terminate("add"));
        assert!(!executor.terminate("add"));
        assert!(!executor.terminate("never-loaded"));
    }

    #[tokio::test]
    async fn test_reload_after_terminate() {
        let executor = executor(adder(), 1000);
        executor.load("source", metadata("add")).await.unwrap();
        executor.terminate("add");

        executor.load("source", metadata("add")).await.unwrap();
        assert_eq!(executor.execute("add", json!({"a": 2, "b": 2})).await, Ok(json!(4)));
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let executor = executor(adder(), 1000);
        executor.load("source", metadata("one")).await.unwrap();
        executor.load("source", metadata("two")).await.unwrap();
        assert_eq!(executor.loaded_plugins().len(), 2);

        executor.cleanup_all();

        assert!(executor.loaded_plugins().is_empty());
        assert_eq!(
            executor.execute("one", json!({})).await,
            Err(ExecError::NotFound("one".to_string()))
        );
    }

    #[tokio::test]
    async fn test_plugins_run_in_parallel() {
        let backend = adder().with_latency(Duration::from_millis(50));
        let executor = executor(backend, 1000);
        executor.load("source", metadata("x")).await.unwrap();
        executor.load("source", metadata("y")).await.unwrap();

        let (x, y) = tokio::join!(
            executor.execute("x", json!({"a": 1, "b": 2})),
            executor.execute("y", json!({"a": 3, "b": 4})),
        );
        assert_eq!(x, Ok(json!(3)));
        assert_eq!(y, Ok(json!(7)));
    }

    #[tokio::test]
    async fn test_busy_cleared_after_result() {
        let backend = adder().with_latency(Duration::from_millis(20));
        let executor = executor(backend, 1000);
        executor.load("source", metadata("add")).await.unwrap();

        for i in 0..3 {
            assert_eq!(executor.execute("add", json!({"a": i, "b": 1})).await, Ok(json!(i + 1)));
        }
    }
}
