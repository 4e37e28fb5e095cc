//! Client-side service engine.
//!
//! One [`ServiceRequester`] per (client, service) pair. It allocates the
//! correlation ids for outgoing requests, pairs responses back to their
//! callbacks or blocked waiters, keeps the local subscription table, and
//! tracks the availability of its service. Callbacks registered from a
//! component thread are re-posted to that component's mailbox; callbacks
//! registered elsewhere run inline on the delivery thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use csbus_message::{
    decode, encode, Address, Availability, Message, OpCode, OpID, Payload, RegID, ServiceID,
    StatusChange,
};
use csbus_routing::{promise, Component, ComponentHandle, Resolver, Router};
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::lock;

/// Delivery hook the owning client implements for its requesters.
pub(crate) trait ClientOutbound: Send + Sync {
    fn deliver(&self, msg: Message) -> bool;
    fn local_address(&self) -> &Address;
    fn server_address(&self) -> &Address;
}

type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

enum PendingAction {
    Callback {
        reg_id: RegID,
        owner: Option<ComponentHandle>,
        callback: MessageCallback,
    },
    Waiter {
        reg_id: RegID,
        resolver: Resolver<Option<Message>>,
    },
}

impl PendingAction {
    fn reg_id(&self) -> &RegID {
        match self {
            PendingAction::Callback { reg_id, .. } => reg_id,
            PendingAction::Waiter { reg_id, .. } => reg_id,
        }
    }
}

struct Subscription {
    reg_id: RegID,
    owner: Option<ComponentHandle>,
    callback: MessageCallback,
}

struct RequesterInner {
    service_id: ServiceID,
    router: Router,
    outbound: Weak<dyn ClientOutbound>,
    sequence: AtomicU64,
    pendings: Mutex<HashMap<u64, PendingAction>>,
    subscriptions: Mutex<HashMap<OpID, Vec<Subscription>>>,
    service_status: Mutex<Availability>,
    interested: Mutex<Vec<ComponentHandle>>,
}

/// Client-side proxy for one remote service.
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct ServiceRequester {
    inner: Arc<RequesterInner>,
}

impl ServiceRequester {
    pub(crate) fn new(
        service_id: ServiceID,
        router: Router,
        outbound: Weak<dyn ClientOutbound>,
    ) -> Self {
        ServiceRequester {
            inner: Arc::new(RequesterInner {
                service_id,
                router,
                outbound,
                sequence: AtomicU64::new(1),
                pendings: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                service_status: Mutex::new(Availability::Unavailable),
                interested: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn service_id(&self) -> &ServiceID {
        &self.inner.service_id
    }

    /// Last known availability of the service.
    pub fn service_status(&self) -> Availability {
        *lock(&self.inner.service_status)
    }

    /// Send a typed request; `callback` runs once with the decoded
    /// response.
    pub fn call<In, Out, F>(&self, input: &In, callback: F) -> Result<RegID>
    where
        In: Payload,
        Out: Payload,
        F: Fn(Out) + Send + Sync + 'static,
    {
        debug_assert_eq!(In::operation_id(), Out::operation_id());
        self.send_request_raw(In::operation_id(), Some(encode(input)?), guarded(callback))
    }

    /// Send a typed request and block for the decoded response.
    pub fn call_sync<In, Out>(&self, input: &In, timeout: Duration) -> Result<Out>
    where
        In: Payload,
        Out: Payload,
    {
        debug_assert_eq!(In::operation_id(), Out::operation_id());
        let response =
            self.send_request_sync_raw(In::operation_id(), Some(encode(input)?), timeout)?;
        decode(&response.op_id, response.content.as_ref()).map_err(Into::into)
    }

    /// Send a request with pre-encoded content; `callback` sees the raw
    /// response message.
    pub fn send_request_raw(
        &self,
        op_id: OpID,
        content: Option<Bytes>,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<RegID> {
        let reg_id = self.inner.next_reg_id(op_id.clone(), OpCode::Request);
        lock(&self.inner.pendings).insert(
            reg_id.sequence,
            PendingAction::Callback {
                reg_id: reg_id.clone(),
                owner: Component::current(),
                callback: Arc::new(callback),
            },
        );
        let msg = self
            .inner
            .envelope(op_id, OpCode::Request, reg_id.sequence, content)?;
        if !self.inner.send(msg) {
            lock(&self.inner.pendings).remove(&reg_id.sequence);
            return Err(ServiceError::ServerUnavailable);
        }
        Ok(reg_id)
    }

    /// Send a request with pre-encoded content and block for the
    /// response. The returned message always carries content; a
    /// content-less response maps to [`ServiceError::RequestFailed`].
    pub fn send_request_sync_raw(
        &self,
        op_id: OpID,
        content: Option<Bytes>,
        timeout: Duration,
    ) -> Result<Message> {
        let reg_id = self.inner.next_reg_id(op_id.clone(), OpCode::Request);
        let (resolver, waiter) = promise();
        lock(&self.inner.pendings).insert(
            reg_id.sequence,
            PendingAction::Waiter {
                reg_id: reg_id.clone(),
                resolver,
            },
        );
        let msg = self
            .inner
            .envelope(op_id.clone(), OpCode::Request, reg_id.sequence, content)?;
        if !self.inner.send(msg) {
            lock(&self.inner.pendings).remove(&reg_id.sequence);
            return Err(ServiceError::ServerUnavailable);
        }
        match waiter.wait(timeout) {
            None => {
                lock(&self.inner.pendings).remove(&reg_id.sequence);
                Err(ServiceError::Timeout(timeout))
            }
            Some(None) => Err(ServiceError::ServiceUnavailable(
                self.inner.service_id.clone(),
            )),
            Some(Some(response)) => {
                if response.content.is_none() {
                    return Err(ServiceError::RequestFailed(op_id));
                }
                Ok(response)
            }
        }
    }

    /// Subscribe to a property; `callback` runs on every update,
    /// including the cached value pushed right after registration.
    pub fn subscribe_status<P, F>(&self, callback: F) -> Result<RegID>
    where
        P: Payload,
        F: Fn(P) + Send + Sync + 'static,
    {
        self.register_raw(P::operation_id(), OpCode::RegisterStatus, guarded(callback))
    }

    pub fn register_status_raw(
        &self,
        op_id: OpID,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<RegID> {
        self.register_raw(op_id, OpCode::RegisterStatus, callback)
    }

    /// Subscribe to a signal; `callback` runs on every broadcast.
    pub fn subscribe_signal<P, F>(&self, callback: F) -> Result<RegID>
    where
        P: Payload,
        F: Fn(P) + Send + Sync + 'static,
    {
        self.register_raw(P::operation_id(), OpCode::RegisterSignal, guarded(callback))
    }

    pub fn register_signal_raw(
        &self,
        op_id: OpID,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<RegID> {
        self.register_raw(op_id, OpCode::RegisterSignal, callback)
    }

    fn register_raw(
        &self,
        op_id: OpID,
        op_code: OpCode,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<RegID> {
        let reg_id = self.inner.next_reg_id(op_id.clone(), op_code);
        lock(&self.inner.subscriptions)
            .entry(op_id.clone())
            .or_default()
            .push(Subscription {
                reg_id: reg_id.clone(),
                owner: Component::current(),
                callback: Arc::new(callback),
            });
        // The wire registration goes out every time, even when other
        // local subscribers for the operation already exist: the
        // provider answers each one with the cached property value.
        let msg = self.inner.envelope(op_id, op_code, reg_id.sequence, None)?;
        if !self.inner.send(msg) {
            self.remove_subscription(&reg_id);
            return Err(ServiceError::ServerUnavailable);
        }
        Ok(reg_id)
    }

    /// Drop one subscription. The wire unregistration is only sent once
    /// the last local subscription for the operation is gone.
    pub fn unregister(&self, reg_id: &RegID) -> Result<()> {
        let Some(unreg_code) = reg_id.op_code.unregister_pair() else {
            return Err(ServiceError::UnknownAction);
        };
        if !self.remove_subscription(reg_id) {
            return Err(ServiceError::UnknownAction);
        }
        if !lock(&self.inner.subscriptions).contains_key(&reg_id.op_id) {
            self.inner
                .send_best_effort(reg_id.op_id.clone(), unreg_code, reg_id.sequence);
        }
        Ok(())
    }

    /// Drop every local subscription for an operation and unregister it
    /// on the wire.
    pub fn unregister_all(&self, op_id: &OpID) -> Result<()> {
        let Some(removed) = lock(&self.inner.subscriptions).remove(op_id) else {
            return Ok(());
        };
        let unreg_code = removed
            .first()
            .and_then(|sub| sub.reg_id.op_code.unregister_pair())
            .unwrap_or(OpCode::UnregisterStatus);
        self.inner.send_best_effort(op_id.clone(), unreg_code, 0);
        Ok(())
    }

    /// Abort an in-flight request. Its callback will never run; a
    /// blocked waiter unblocks with
    /// [`ServiceError::ServiceUnavailable`].
    pub fn abort_action(&self, reg_id: &RegID) -> Result<()> {
        let removed = {
            let mut pendings = lock(&self.inner.pendings);
            match pendings.get(&reg_id.sequence) {
                Some(action) if action.reg_id() == reg_id => pendings.remove(&reg_id.sequence),
                _ => None,
            }
        };
        let Some(action) = removed else {
            return Err(ServiceError::UnknownAction);
        };
        if let PendingAction::Waiter { resolver, .. } = action {
            resolver.resolve(None);
        }
        self.inner
            .send_best_effort(reg_id.op_id.clone(), OpCode::AbortRequest, reg_id.sequence);
        Ok(())
    }

    /// Have a component notified of availability changes through its
    /// mailbox. If the service is already available the component gets
    /// an immediate notification.
    pub fn add_interested_component(&self, handle: ComponentHandle) -> Result<()> {
        let component = self
            .inner
            .router
            .resolve(handle)
            .ok_or(ServiceError::ComponentGone)?;
        {
            let mut interested = lock(&self.inner.interested);
            if !interested.contains(&handle) {
                interested.push(handle);
            }
        }
        if self.service_status().is_available() {
            component.post_message(
                self.inner
                    .status_note(Availability::Unavailable, Availability::Available),
            );
        }
        Ok(())
    }

    /// Feed one server-to-client message into the requester. Returns
    /// false when the message could not be interpreted.
    pub(crate) fn on_incoming_message(&self, msg: Message) -> bool {
        match msg.op_code {
            OpCode::Response => {
                self.on_response(msg);
                true
            }
            OpCode::StatusUpdate | OpCode::SignalBroadcast => {
                self.on_update(msg);
                true
            }
            OpCode::ServerStatusChanged => {
                match decode::<StatusChange>(&msg.op_id, msg.content.as_ref()) {
                    Ok(change) => {
                        self.on_service_status_changed(change.current);
                        true
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed availability notification");
                        false
                    }
                }
            }
            _ => {
                warn!(
                    service = %self.inner.service_id,
                    op_code = ?msg.op_code,
                    "requester cannot interpret message"
                );
                false
            }
        }
    }

    fn on_response(&self, msg: Message) {
        let Some(action) = lock(&self.inner.pendings).remove(&msg.seq) else {
            debug!(
                service = %self.inner.service_id,
                op_id = %msg.op_id,
                sequence = msg.seq,
                "late response discarded"
            );
            return;
        };
        match action {
            PendingAction::Callback {
                reg_id,
                owner,
                callback,
            } => {
                if reg_id.op_id != msg.op_id {
                    warn!(
                        expected = %reg_id.op_id,
                        actual = %msg.op_id,
                        "response operation mismatch, callback skipped"
                    );
                    return;
                }
                if msg.content.is_none() {
                    warn!(
                        service = %self.inner.service_id,
                        op_id = %msg.op_id,
                        "request failed on the provider side, callback skipped"
                    );
                    return;
                }
                self.inner.dispatch(owner, callback, msg);
            }
            PendingAction::Waiter { reg_id, resolver } => {
                if reg_id.op_id != msg.op_id {
                    warn!(
                        expected = %reg_id.op_id,
                        actual = %msg.op_id,
                        "response operation mismatch, waiter failed"
                    );
                    resolver.resolve(None);
                    return;
                }
                resolver.resolve(Some(msg));
            }
        }
    }

    fn on_update(&self, msg: Message) {
        let targets: Vec<(Option<ComponentHandle>, MessageCallback)> =
            lock(&self.inner.subscriptions)
                .get(&msg.op_id)
                .map(|subs| {
                    subs.iter()
                        .map(|sub| (sub.owner, Arc::clone(&sub.callback)))
                        .collect()
                })
                .unwrap_or_default();
        if targets.is_empty() {
            debug!(
                service = %self.inner.service_id,
                op_id = %msg.op_id,
                "update without local subscription dropped"
            );
            return;
        }
        for (owner, callback) in targets {
            self.inner.dispatch(owner, callback, msg.clone());
        }
    }

    /// The server endpoint itself changed availability. Losing the
    /// server implies losing the service; gaining it does not, the
    /// service announces itself separately.
    pub(crate) fn on_server_status_changed(&self, server_status: Availability) {
        if !server_status.is_available() {
            self.on_service_status_changed(Availability::Unavailable);
        }
    }

    pub(crate) fn on_service_status_changed(&self, current: Availability) {
        let previous = {
            let mut status = lock(&self.inner.service_status);
            if *status == current {
                return;
            }
            std::mem::replace(&mut *status, current)
        };
        info!(
            service = %self.inner.service_id,
            ?previous,
            ?current,
            "service availability changed"
        );
        if !current.is_available() {
            self.inner.invalidate();
        }
        self.inner.notify_interested(previous, current);
    }

    /// Tear down every action this requester still tracks; used when the
    /// owning client disconnects.
    pub(crate) fn shutdown(&self) {
        let subscriptions: Vec<(OpID, OpCode)> = lock(&self.inner.subscriptions)
            .drain()
            .map(|(op_id, subs)| {
                let code = subs
                    .first()
                    .and_then(|sub| sub.reg_id.op_code.unregister_pair())
                    .unwrap_or(OpCode::UnregisterStatus);
                (op_id, code)
            })
            .collect();
        for (op_id, code) in subscriptions {
            self.inner.send_best_effort(op_id, code, 0);
        }
        let pendings: Vec<PendingAction> = lock(&self.inner.pendings)
            .drain()
            .map(|(_, action)| action)
            .collect();
        for action in pendings {
            let reg_id = action.reg_id().clone();
            if let PendingAction::Waiter { resolver, .. } = action {
                resolver.resolve(None);
            }
            self.inner
                .send_best_effort(reg_id.op_id, OpCode::AbortRequest, reg_id.sequence);
        }
        lock(&self.inner.interested).clear();
    }

    fn remove_subscription(&self, reg_id: &RegID) -> bool {
        let mut subscriptions = lock(&self.inner.subscriptions);
        let Some(subs) = subscriptions.get_mut(&reg_id.op_id) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|sub| sub.reg_id != *reg_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            subscriptions.remove(&reg_id.op_id);
        }
        removed
    }
}

impl RequesterInner {
    fn next_reg_id(&self, op_id: OpID, op_code: OpCode) -> RegID {
        RegID {
            service_id: self.service_id.clone(),
            op_id,
            op_code,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn envelope(
        &self,
        op_id: OpID,
        op_code: OpCode,
        seq: u64,
        content: Option<Bytes>,
    ) -> Result<Message> {
        let outbound = self
            .outbound
            .upgrade()
            .ok_or(ServiceError::ServerUnavailable)?;
        Ok(Message {
            service_id: self.service_id.clone(),
            op_id,
            op_code,
            source: outbound.local_address().clone(),
            dest: outbound.server_address().clone(),
            seq,
            content,
        })
    }

    fn send(&self, msg: Message) -> bool {
        match self.outbound.upgrade() {
            Some(outbound) => outbound.deliver(msg),
            None => false,
        }
    }

    fn send_best_effort(&self, op_id: OpID, op_code: OpCode, seq: u64) {
        let Ok(msg) = self.envelope(op_id.clone(), op_code, seq, None) else {
            return;
        };
        if !self.send(msg) {
            debug!(
                service = %self.service_id,
                op_id = %op_id,
                op_code = ?op_code,
                "best-effort notification undeliverable"
            );
        }
    }

    /// Run a callback on its owning component's mailbox, or inline when
    /// it has no owner.
    fn dispatch(&self, owner: Option<ComponentHandle>, callback: MessageCallback, msg: Message) {
        match owner {
            None => callback(&msg),
            Some(handle) => match self.router.resolve(handle) {
                Some(component) => {
                    let posted = component.execute(move || callback(&msg));
                    if !posted {
                        warn!("owning component stopped, callback dropped");
                    }
                }
                None => warn!("owning component gone, callback dropped"),
            },
        }
    }

    /// Unblock every waiter and forget every callback and subscription.
    /// Runs when the service goes away; retired ids make any late
    /// response harmless.
    fn invalidate(&self) {
        let pendings: Vec<PendingAction> = lock(&self.pendings)
            .drain()
            .map(|(_, action)| action)
            .collect();
        for action in pendings {
            match action {
                PendingAction::Waiter { resolver, .. } => {
                    resolver.resolve(None);
                }
                PendingAction::Callback { reg_id, .. } => {
                    debug!(
                        op_id = %reg_id.op_id,
                        sequence = reg_id.sequence,
                        "pending request invalidated"
                    );
                }
            }
        }
        let dropped = {
            let mut subscriptions = lock(&self.subscriptions);
            let count: usize = subscriptions.values().map(Vec::len).sum();
            subscriptions.clear();
            count
        };
        if dropped > 0 {
            debug!(
                service = %self.service_id,
                dropped,
                "subscriptions invalidated"
            );
        }
    }

    fn notify_interested(&self, previous: Availability, current: Availability) {
        let note = self.status_note(previous, current);
        let mut interested = lock(&self.interested);
        interested.retain(|handle| match self.router.resolve(*handle) {
            Some(component) => component.post_message(note.clone()),
            None => {
                warn!(
                    service = %self.service_id,
                    "interested component gone, pruned"
                );
                false
            }
        });
    }

    fn status_note(&self, previous: Availability, current: Availability) -> Message {
        let content = encode(&StatusChange { previous, current }).ok();
        Message {
            service_id: self.service_id.clone(),
            op_id: StatusChange::operation_id(),
            op_code: OpCode::ServerStatusChanged,
            source: self
                .outbound
                .upgrade()
                .map(|outbound| outbound.server_address().clone())
                .unwrap_or_else(Address::invalid),
            dest: Address::invalid(),
            seq: 0,
            content,
        }
    }
}

/// Wrap a typed callback with decode guarding: payloads that fail to
/// decode are logged and skipped instead of reaching the callback.
fn guarded<P, F>(callback: F) -> impl Fn(&Message) + Send + Sync + 'static
where
    P: Payload,
    F: Fn(P) + Send + Sync + 'static,
{
    move |msg: &Message| match decode::<P>(&msg.op_id, msg.content.as_ref()) {
        Ok(payload) => callback(payload),
        Err(err) => warn!(
            op_id = %msg.op_id,
            error = %err,
            "payload not decodable, callback skipped"
        ),
    }
}
