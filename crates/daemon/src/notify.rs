//! Notification hook dispatch
//!
//! Runs user-supplied programs on named events. Launches are detached from
//! the emitting task: a bounded per-kind concurrency cap with a drop-oldest
//! backlog keeps a wedged hook from stalling the event pipeline, and a
//! background harvester reaps every child so none linger as zombies.

use crate::config::HookSpec;
use crate::events::Event;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hooks of one kind running at the same time.
pub const MAX_CONCURRENT_PER_KIND: usize = 4;
/// Invocations of one kind waiting for a slot; beyond this the oldest drops.
pub const BACKLOG_CAP: usize = 32;

/// A fully prepared hook invocation: command plus substituted arguments.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub id: Uuid,
    pub kind: &'static str,
    pub command: String,
    pub args: Vec<String>,
}

/// Substitute `{placeholder}` tokens in one argument template.
pub fn substitute(template: &str, placeholders: &[(&'static str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in placeholders {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Prepare an invocation for `event` against its configured hook.
pub fn prepare(spec: &HookSpec, event: &Event) -> Invocation {
    let placeholders = event.placeholders();
    Invocation {
        id: Uuid::new_v4(),
        kind: event.hook_kind(),
        command: spec.command.clone(),
        args: spec
            .args
            .iter()
            .map(|template| substitute(template, &placeholders))
            .collect(),
    }
}

/// Run one hook to completion, capturing and logging its output. Failures
/// are logged and swallowed; a hook can never take the daemon down.
pub async fn run_hook(invocation: &Invocation, timeout: Duration) {
    debug!(
        "[{}] {} hook: {} {:?}",
        invocation.id, invocation.kind, invocation.command, invocation.args
    );

    let mut cmd = Command::new(&invocation.command);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(
                "[{}] {} hook failed to start ({}): {}",
                invocation.id, invocation.kind, invocation.command, e
            );
            return;
        }
    };

    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                debug!("[{}] stdout: {}", invocation.id, line);
            }
            for line in String::from_utf8_lossy(&output.stderr).lines() {
                debug!("[{}] stderr: {}", invocation.id, line);
            }
            if output.status.success() {
                debug!("[{}] {} hook completed", invocation.id, invocation.kind);
            } else {
                warn!(
                    "[{}] {} hook exited with {}",
                    invocation.id, invocation.kind, output.status
                );
            }
        }
        Ok(Err(e)) => warn!("[{}] {} hook failed: {}", invocation.id, invocation.kind, e),
        // Dropping the child on timeout kills it.
        Err(_) => warn!(
            "[{}] {} hook killed after {:?}",
            invocation.id, invocation.kind, timeout
        ),
    }
}

/// Run the configured hook for `event` and wait for it, used on the
/// shutdown path where the process is about to exit.
pub async fn dispatch_direct(
    registry: &HashMap<String, HookSpec>,
    event: &Event,
    timeout: Duration,
) {
    if let Some(spec) = registry.get(event.hook_kind()) {
        let invocation = prepare(spec, event);
        run_hook(&invocation, timeout).await;
    }
}

/// What to do with a new invocation given the kind's current load.
#[derive(Debug, PartialEq, Eq)]
enum Plan {
    Launch,
    Queue,
    DropOldestThenQueue,
}

fn plan(running: usize, queued: usize) -> Plan {
    if running < MAX_CONCURRENT_PER_KIND {
        Plan::Launch
    } else if queued < BACKLOG_CAP {
        Plan::Queue
    } else {
        Plan::DropOldestThenQueue
    }
}

pub struct NotificationDispatcher {
    registry: Arc<HashMap<String, HookSpec>>,
    /// Receiver parked behind a mutex so a restarted dispatcher task can
    /// pick the stream back up.
    event_rx: Arc<Mutex<mpsc::Receiver<Event>>>,
    subprocess_timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(
        registry: Arc<HashMap<String, HookSpec>>,
        event_rx: Arc<Mutex<mpsc::Receiver<Event>>>,
        subprocess_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            event_rx,
            subprocess_timeout,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut event_rx = self.event_rx.lock().await;
        let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(64);
        let mut running: HashMap<&'static str, usize> = HashMap::new();
        let mut queued: HashMap<&'static str, VecDeque<Invocation>> = HashMap::new();

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => {
                        let kind = event.hook_kind();
                        let Some(spec) = self.registry.get(kind) else {
                            debug!("no hook registered for {}", kind);
                            continue;
                        };
                        let invocation = prepare(spec, &event);
                        let slot_running = running.entry(kind).or_default();
                        let queue = queued.entry(kind).or_default();
                        match plan(*slot_running, queue.len()) {
                            Plan::Launch => {
                                *slot_running += 1;
                                self.launch(invocation, done_tx.clone());
                            }
                            Plan::Queue => queue.push_back(invocation),
                            Plan::DropOldestThenQueue => {
                                if let Some(dropped) = queue.pop_front() {
                                    warn!(
                                        "[{}] {} hook backlog full, dropping oldest",
                                        dropped.id, kind
                                    );
                                }
                                queue.push_back(invocation);
                            }
                        }
                    }
                    // Every event producer is gone; nothing left to do.
                    None => {
                        info!("event stream ended, notification dispatcher stopping");
                        return Ok(());
                    }
                },
                Some(kind) = done_rx.recv() => {
                    if let Some(count) = running.get_mut(kind) {
                        *count = count.saturating_sub(1);
                    }
                    if let Some(next) = queued.get_mut(kind).and_then(|q| q.pop_front()) {
                        *running.entry(kind).or_default() += 1;
                        self.launch(next, done_tx.clone());
                    }
                }
            }
        }
    }

    /// Detach one invocation onto its own harvester task.
    fn launch(&self, invocation: Invocation, done_tx: mpsc::Sender<&'static str>) {
        let timeout = self.subprocess_timeout;
        tokio::spawn(async move {
            run_hook(&invocation, timeout).await;
            let _ = done_tx.send(invocation.kind).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substitute_replaces_all_tokens() {
        let placeholders = vec![
            ("drive_bay", "2".to_string()),
            ("state", "absent".to_string()),
        ];
        assert_eq!(
            substitute("bay-{drive_bay}-is-{state}", &placeholders),
            "bay-2-is-absent"
        );
    }

    #[test]
    fn test_substitute_leaves_unknown_tokens() {
        assert_eq!(substitute("{mystery}", &[]), "{mystery}");
    }

    #[test]
    fn test_prepare_builds_substituted_args() {
        let spec = HookSpec {
            command: "/usr/local/bin/on-drive".to_string(),
            args: vec!["{drive_bay}".to_string(), "{state}".to_string()],
        };
        let invocation = prepare(
            &spec,
            &Event::DrivePresenceChanged {
                bay: 1,
                present: true,
            },
        );
        assert_eq!(invocation.kind, "drive_presence_changed");
        assert_eq!(invocation.args, vec!["1", "present"]);
    }

    #[test]
    fn test_plan_caps_and_backlog() {
        assert_eq!(plan(0, 0), Plan::Launch);
        assert_eq!(plan(MAX_CONCURRENT_PER_KIND - 1, 0), Plan::Launch);
        assert_eq!(plan(MAX_CONCURRENT_PER_KIND, 0), Plan::Queue);
        assert_eq!(plan(MAX_CONCURRENT_PER_KIND, BACKLOG_CAP - 1), Plan::Queue);
        assert_eq!(
            plan(MAX_CONCURRENT_PER_KIND, BACKLOG_CAP),
            Plan::DropOldestThenQueue
        );
    }

    #[tokio::test]
    async fn test_missing_hook_binary_is_not_fatal() {
        let invocation = Invocation {
            id: Uuid::new_v4(),
            kind: "system_up",
            command: "/nonexistent/hook".to_string(),
            args: vec![],
        };
        // Logs and returns.
        run_hook(&invocation, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_dispatcher_runs_configured_hook() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("fired");

        let mut registry = HashMap::new();
        registry.insert(
            "system_up".to_string(),
            HookSpec {
                command: "touch".to_string(),
                args: vec![marker.to_string_lossy().into_owned()],
            },
        );

        let (event_tx, event_rx) = mpsc::channel(8);
        let dispatcher = NotificationDispatcher::new(
            Arc::new(registry),
            Arc::new(Mutex::new(event_rx)),
            Duration::from_secs(5),
        );
        tokio::spawn(dispatcher.run());

        event_tx.send(Event::SystemUp).await.unwrap();

        for _ in 0..200 {
            if marker.exists() {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("hook never ran");
    }

    #[tokio::test]
    async fn test_unregistered_event_is_ignored() {
        let (event_tx, event_rx) = mpsc::channel(8);
        let dispatcher = NotificationDispatcher::new(
            Arc::new(HashMap::new()),
            Arc::new(Mutex::new(event_rx)),
            Duration::from_secs(1),
        );
        let handle = tokio::spawn(dispatcher.run());

        event_tx.send(Event::SystemDown).await.unwrap();
        drop(event_tx);

        // Dispatcher drains the event and exits cleanly on channel close.
        assert!(handle.await.unwrap().is_ok());
    }
}
