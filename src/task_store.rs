use nanoid::nanoid;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const DEFAULT_TASK_TTL_SECS: u64 = 600; // 10 minutes

pub(crate) const STAGE_STARTING: &str = "Starting";
pub(crate) const STAGE_UPDATE: &str = "Update";
pub(crate) const STAGE_PRUNE: &str = "Prune";
pub(crate) const STAGE_FINISHED: &str = "Finished";

/// Service part of a task key. `Any` marks a whole-stack operation and is the
/// fallback target when no exact `(stack, service)` entry exists.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ServiceSelector {
    Named(String),
    Any,
}

impl ServiceSelector {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            ServiceSelector::Named(name) => name,
            ServiceSelector::Any => "*",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TaskKey {
    pub stack: String,
    pub service: ServiceSelector,
}

impl TaskKey {
    pub(crate) fn named(stack: &str, service: &str) -> Self {
        Self {
            stack: stack.to_string(),
            service: ServiceSelector::Named(service.to_string()),
        }
    }

    pub(crate) fn whole_stack(stack: &str) -> Self {
        Self {
            stack: stack.to_string(),
            service: ServiceSelector::Any,
        }
    }

    fn wildcard(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            service: ServiceSelector::Any,
        }
    }

    pub(crate) fn describe(&self) -> String {
        format!("{}/{}", self.stack, self.service.as_str())
    }
}

/// One progress message. Append-only and FIFO within a task.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Message {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Message {
    pub(crate) fn stage(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            message: None,
        }
    }

    pub(crate) fn line(stage: &str, line: String) -> Self {
        Self {
            stage: stage.to_string(),
            message: Some(line),
        }
    }
}

/// The external update procedure. Implementations stream progress through
/// `emit` and return Err when the underlying command fails. Runs on a worker
/// thread; once started it is never cancelled mid-flight.
pub(crate) trait UpdateRunner: Send {
    fn run(self: Box<Self>, emit: &mut dyn FnMut(Message)) -> Result<(), String>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum TaskOutcome {
    Succeeded,
    Failed(String),
}

#[derive(Debug, PartialEq, Eq)]
enum WorkerState {
    Running,
    Finished,
}

struct TaskEntry {
    task_id: String,
    messages: Vec<Message>,
    last_activity: Instant,
    state: WorkerState,
    outcome: Option<TaskOutcome>,
    failure_delivered: bool,
}

impl TaskEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.state == WorkerState::Finished && self.last_activity.elapsed() > ttl
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CreateOutcome {
    pub task_id: String,
    pub created: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    /// No live or residually completed task resolves to the key. A normal
    /// outcome after eviction or before creation, not an error.
    NotFound,
    Messages {
        task_id: String,
        messages: Vec<Message>,
        finished: bool,
    },
    /// First inspection after a worker failure; later polls report plain
    /// `Messages` so the error is surfaced once, without a re-raise storm.
    Failed {
        task_id: String,
        messages: Vec<Message>,
        error: String,
    },
}

/// Registry of in-flight and recently completed update tasks. Explicitly
/// constructed and injected; a coarse mutex guards the whole map, which is
/// fine at the task volumes a compose host sees. Eviction is lazy: expired
/// entries are removed by whichever lookup touches them next, and both
/// completion and eviction fire `on_invalidate`.
pub(crate) struct TaskStore {
    ttl: Duration,
    inner: Arc<Mutex<HashMap<TaskKey, TaskEntry>>>,
    on_invalidate: Arc<dyn Fn() + Send + Sync>,
}

impl TaskStore {
    pub(crate) fn new(ttl: Duration, on_invalidate: Arc<dyn Fn() + Send + Sync>) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(HashMap::new())),
            on_invalidate,
        }
    }

    /// Create a task for `key`, or join the live one that already resolves to
    /// it (exact match first, then the stack's wildcard entry). Joining never
    /// starts a second worker.
    pub(crate) fn create<R: UpdateRunner + 'static>(&self, key: TaskKey, runner: R) -> CreateOutcome {
        let mut evicted = false;
        let outcome = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(resolved) = Self::resolve_live(&mut map, &key, self.ttl, &mut evicted) {
                let task_id = map
                    .get(&resolved)
                    .map(|entry| entry.task_id.clone())
                    .unwrap_or_default();
                CreateOutcome {
                    task_id,
                    created: false,
                }
            } else {
                let task_id = format!("tsk_{}", nanoid!(12));
                let (tx, rx) = mpsc::channel::<Message>();

                let boxed: Box<dyn UpdateRunner> = Box::new(runner);
                let worker = thread::spawn(move || -> Result<(), String> {
                    let _ = tx.send(Message::stage(STAGE_STARTING));
                    let result = boxed.run(&mut |msg| {
                        let _ = tx.send(msg);
                    });
                    if result.is_ok() {
                        let _ = tx.send(Message::stage(STAGE_FINISHED));
                    }
                    result
                    // tx drops here; the accumulator drains what is buffered
                    // and then joins this thread for the outcome.
                });

                map.insert(
                    key.clone(),
                    TaskEntry {
                        task_id: task_id.clone(),
                        messages: Vec::new(),
                        last_activity: Instant::now(),
                        state: WorkerState::Running,
                        outcome: None,
                        failure_delivered: false,
                    },
                );

                self.spawn_accumulator(key.clone(), task_id.clone(), rx, worker);

                CreateOutcome {
                    task_id,
                    created: true,
                }
            }
        };

        if evicted {
            (self.on_invalidate)();
        }
        outcome
    }

    /// Messages with index >= offset, or `NotFound`. Does not refresh the
    /// activity timestamp; only the accumulator does that.
    pub(crate) fn poll(&self, key: &TaskKey, offset: usize) -> PollOutcome {
        let mut evicted = false;
        let outcome = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            match Self::resolve_live(&mut map, key, self.ttl, &mut evicted) {
                None => PollOutcome::NotFound,
                Some(resolved) => match map.get_mut(&resolved) {
                    None => PollOutcome::NotFound,
                    Some(entry) => {
                        let start = offset.min(entry.messages.len());
                        let messages = entry.messages[start..].to_vec();
                        let finished = entry.state == WorkerState::Finished;

                        let undelivered_failure = finished
                            && !entry.failure_delivered
                            && matches!(entry.outcome, Some(TaskOutcome::Failed(_)));
                        if undelivered_failure {
                            entry.failure_delivered = true;
                            let error = match &entry.outcome {
                                Some(TaskOutcome::Failed(err)) => err.clone(),
                                _ => String::new(),
                            };
                            PollOutcome::Failed {
                                task_id: entry.task_id.clone(),
                                messages,
                                error,
                            }
                        } else {
                            PollOutcome::Messages {
                                task_id: entry.task_id.clone(),
                                messages,
                                finished,
                            }
                        }
                    }
                },
            }
        };

        if evicted {
            (self.on_invalidate)();
        }
        outcome
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Single owner of the eviction invariant: every resolve path funnels
    /// through here. Returns the key of the live entry (exact, else the
    /// stack wildcard), removing any expired entry it touches.
    fn resolve_live(
        map: &mut HashMap<TaskKey, TaskEntry>,
        key: &TaskKey,
        ttl: Duration,
        evicted: &mut bool,
    ) -> Option<TaskKey> {
        let mut candidates = vec![key.clone()];
        if key.service != ServiceSelector::Any {
            candidates.push(key.wildcard());
        }

        for candidate in candidates {
            let expired = match map.get(&candidate) {
                None => continue,
                Some(entry) => entry.is_expired(ttl),
            };
            if expired {
                map.remove(&candidate);
                *evicted = true;
                continue;
            }
            return Some(candidate);
        }
        None
    }

    /// Drain-until-closed consumer: copies worker messages into the entry so
    /// production rate is decoupled from poll rate and nothing is lost when
    /// no one polls. After the channel closes it joins the worker, records
    /// the terminal outcome, and fires cache invalidation.
    fn spawn_accumulator(
        &self,
        key: TaskKey,
        task_id: String,
        rx: mpsc::Receiver<Message>,
        worker: thread::JoinHandle<Result<(), String>>,
    ) {
        let inner = Arc::clone(&self.inner);
        let on_invalidate = Arc::clone(&self.on_invalidate);

        thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                let mut map = inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = map.get_mut(&key) {
                    entry.messages.push(msg);
                    entry.last_activity = Instant::now();
                }
            }

            let outcome = match worker.join() {
                Ok(Ok(())) => TaskOutcome::Succeeded,
                Ok(Err(err)) => TaskOutcome::Failed(err),
                Err(_) => TaskOutcome::Failed("update worker panicked".to_string()),
            };

            if let TaskOutcome::Failed(err) = &outcome {
                crate::log_message(&format!(
                    "warn update-task-failed task_id={task_id} key={} err={err}",
                    key.describe()
                ));
            }

            {
                let mut map = inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = map.get_mut(&key) {
                    entry.state = WorkerState::Finished;
                    entry.outcome = Some(outcome);
                    entry.last_activity = Instant::now();
                }
            }

            on_invalidate();
        });
    }

    #[cfg(test)]
    fn is_finished(&self, key: &TaskKey) -> bool {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key)
            .map(|entry| entry.state == WorkerState::Finished)
            .unwrap_or(false)
    }

    #[cfg(test)]
    fn backdate(&self, key: &TaskKey, by: Duration) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(key) {
            if let Some(past) = Instant::now().checked_sub(by) {
                entry.last_activity = past;
            }
        }
    }
}
