use std::cell::Cell;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use csbus_message::{Address, Message};
use tracing::{debug, warn};

use crate::lock;
use crate::router::ComponentHandle;
use crate::waiter::promise;

/// A deferred unit of work posted into a component's mailbox.
pub type Execution = Box<dyn FnOnce() + Send + 'static>;

type MessageHandler = dyn Fn(Message) + Send + Sync + 'static;

enum Job {
    Message(Message),
    Execute(Execution),
}

thread_local! {
    static CURRENT: Cell<Option<ComponentHandle>> = const { Cell::new(None) };
}

/// An actor: an address plus a private, serialized mailbox drained by one
/// dedicated thread.
///
/// No two pieces of a component's own logic run concurrently with each other.
/// Cloning is cheap and shares the mailbox.
#[derive(Clone)]
pub struct Component {
    shared: Arc<Shared>,
}

struct Shared {
    address: Address,
    handle: Mutex<Option<ComponentHandle>>,
    handler: Mutex<Option<Arc<MessageHandler>>>,
    mailbox: Mutex<Mailbox>,
}

struct Mailbox {
    tx: Option<Sender<Job>>,
    rx: Option<Receiver<Job>>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl Component {
    /// Create a stopped component. Posts are accepted immediately and queue
    /// until [`Component::start`] spawns the mailbox thread.
    pub fn new(address: Address) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            shared: Arc::new(Shared {
                address,
                handle: Mutex::new(None),
                handler: Mutex::new(None),
                mailbox: Mutex::new(Mailbox {
                    tx: Some(tx),
                    rx: Some(rx),
                    thread: None,
                    thread_id: None,
                }),
            }),
        }
    }

    /// The address this component is reachable under.
    pub fn address(&self) -> &Address {
        &self.shared.address
    }

    /// The router handle assigned at registration, if any.
    pub fn handle(&self) -> Option<ComponentHandle> {
        *lock(&self.shared.handle)
    }

    /// The handle of the component whose mailbox thread is running the
    /// current code, if any. Used to capture callback ownership.
    pub fn current() -> Option<ComponentHandle> {
        CURRENT.get()
    }

    /// Install the function invoked for every posted [`Message`]. May be
    /// replaced at any time; messages arriving with no handler are dropped.
    pub fn set_message_handler(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        *lock(&self.shared.handler) = Some(Arc::new(handler));
    }

    /// Spawn the mailbox thread. Returns `false` if already started or
    /// stopped.
    pub fn start(&self) -> bool {
        let mut mailbox = lock(&self.shared.mailbox);
        let Some(rx) = mailbox.rx.take() else {
            return false;
        };
        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("csbus-{}", self.shared.address.name()))
            .spawn(move || run_mailbox(shared, rx));
        match spawned {
            Ok(joiner) => {
                mailbox.thread_id = Some(joiner.thread().id());
                mailbox.thread = Some(joiner);
                true
            }
            Err(err) => {
                warn!(address = %self.shared.address, error = %err, "failed to spawn mailbox thread");
                false
            }
        }
    }

    /// Post a message into the mailbox. Returns `false` if the component is
    /// stopped.
    pub fn post_message(&self, msg: Message) -> bool {
        self.push(Job::Message(msg))
    }

    /// Post a message and block until the handler has run it, or `timeout`
    /// elapses. Runs inline when called from the component's own thread so
    /// the mailbox never waits on itself.
    pub fn post_and_wait(&self, msg: Message, timeout: Duration) -> bool {
        let shared = self.shared.clone();
        self.run_and_wait(move || dispatch_message(&shared, msg), timeout)
    }

    /// Post a deferred execution. Returns `false` if the component is
    /// stopped.
    pub fn execute(&self, exec: impl FnOnce() + Send + 'static) -> bool {
        self.push(Job::Execute(Box::new(exec)))
    }

    /// Post an execution and block until it has run, or `timeout` elapses.
    /// Runs inline when called from the component's own thread.
    pub fn execute_and_wait(&self, exec: impl FnOnce() + Send + 'static, timeout: Duration) -> bool {
        self.run_and_wait(exec, timeout)
    }

    /// Close the mailbox and join the thread. Queued jobs are drained first.
    /// Idempotent; joining is skipped when called from the mailbox thread
    /// itself.
    pub fn stop(&self) {
        let (tx, joiner, own_thread) = {
            let mut mailbox = lock(&self.shared.mailbox);
            let own = mailbox.thread_id == Some(thread::current().id());
            (mailbox.tx.take(), mailbox.thread.take(), own)
        };
        drop(tx);
        if let Some(joiner) = joiner {
            if own_thread {
                debug!(address = %self.shared.address, "stop from own mailbox thread; skipping join");
            } else if joiner.join().is_err() {
                warn!(address = %self.shared.address, "mailbox thread panicked");
            }
        }
    }

    pub(crate) fn set_handle(&self, handle: Option<ComponentHandle>) {
        *lock(&self.shared.handle) = handle;
    }

    fn push(&self, job: Job) -> bool {
        let tx = lock(&self.shared.mailbox).tx.clone();
        match tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    fn run_and_wait(&self, exec: impl FnOnce() + Send + 'static, timeout: Duration) -> bool {
        let on_own_thread = {
            let mailbox = lock(&self.shared.mailbox);
            mailbox.thread_id == Some(thread::current().id())
        };
        if on_own_thread {
            exec();
            return true;
        }
        let (resolver, waiter) = promise();
        let posted = self.push(Job::Execute(Box::new(move || {
            exec();
            resolver.resolve(());
        })));
        if !posted {
            return false;
        }
        waiter.wait(timeout).is_some()
    }
}

impl std::fmt::Debug for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Component")
            .field("address", &self.shared.address)
            .field("handle", &self.handle())
            .finish()
    }
}

fn run_mailbox(shared: Arc<Shared>, rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        CURRENT.set(*lock(&shared.handle));
        match job {
            Job::Message(msg) => dispatch_message(&shared, msg),
            Job::Execute(exec) => exec(),
        }
    }
    CURRENT.set(None);
}

fn dispatch_message(shared: &Shared, msg: Message) {
    let handler = lock(&shared.handler).clone();
    match handler {
        Some(handler) => handler(msg),
        None => {
            debug!(address = %shared.address, op_id = %msg.op_id, "message dropped: no handler installed")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    use csbus_message::{OpCode, OpID, ServiceID};

    use super::*;

    fn test_message(tag: &str) -> Message {
        Message::new(
            ServiceID::from("svc"),
            OpID::from(tag),
            OpCode::SignalBroadcast,
        )
    }

    #[test]
    fn queued_messages_run_in_post_order() {
        let component = Component::new(Address::new("orderly", 0));
        let (tx, rx) = mpsc::channel();
        component.set_message_handler(move |msg| {
            tx.send(msg.op_id.as_str().to_string()).unwrap();
        });
        component.post_message(test_message("one"));
        component.post_message(test_message("two"));
        assert!(component.start());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "one");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "two");
        component.stop();
    }

    #[test]
    fn execute_and_wait_blocks_until_done() {
        let component = Component::new(Address::new("worker", 0));
        assert!(component.start());
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let done = component.execute_and_wait(
            move || {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            Duration::from_secs(2),
        );
        assert!(done);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        component.stop();
    }

    #[test]
    fn wait_from_own_thread_runs_inline() {
        let component = Component::new(Address::new("reentrant", 0));
        assert!(component.start());
        let inner = component.clone();
        let done = component.execute_and_wait(
            move || {
                // Blocking on our own mailbox must not deadlock.
                assert!(inner.execute_and_wait(|| {}, Duration::from_millis(100)));
            },
            Duration::from_secs(2),
        );
        assert!(done);
        component.stop();
    }

    #[test]
    fn stopped_component_rejects_posts() {
        let component = Component::new(Address::new("gone", 0));
        assert!(component.start());
        component.stop();
        assert!(!component.post_message(test_message("late")));
        assert!(!component.execute(|| {}));
    }

    #[test]
    fn post_and_wait_observes_handler_completion() {
        let component = Component::new(Address::new("sync", 0));
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        component.set_message_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        assert!(component.start());
        assert!(component.post_and_wait(test_message("ping"), Duration::from_secs(2)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        component.stop();
    }
}
