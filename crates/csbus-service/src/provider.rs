//! Server-side service engine.
//!
//! A [`ServiceProvider`] owns everything one service needs on the server
//! side: the request handlers, the queue of in-flight requests, the
//! property cache, and the per-client subscription registry. It is
//! handed incoming messages by its hosting [`Server`](crate::Server) and
//! sends outbound traffic through a delivery hook the server implements.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use bytes::Bytes;
use csbus_message::{
    decode, encode, Address, Availability, Message, OpCode, OpID, Payload, ServiceID, StatusChange,
};
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::lock;

/// Delivery hook the hosting server implements for its providers.
pub(crate) trait ProviderOutbound: Send + Sync {
    /// Deliver one message to its destination. Returns false when the
    /// destination cannot be reached.
    fn deliver(&self, msg: Message) -> bool;

    /// Announce a message to every reachable endpoint.
    fn announce(&self, msg: Message) -> bool;

    /// The address this service is served from.
    fn local_address(&self) -> &Address;
}

type RequestHandler = Arc<dyn Fn(Request) -> Result<()> + Send + Sync>;

/// One request waiting for its response.
struct PendingSlot {
    op_id: OpID,
    sequence: u64,
    source: Address,
    content: Option<Bytes>,
    received_at: Instant,
}

struct ProviderInner {
    service_id: ServiceID,
    outbound: Weak<dyn ProviderOutbound>,
    availability: Mutex<Availability>,
    handlers: Mutex<HashMap<OpID, RequestHandler>>,
    // FIFO per operation so responses pair with the oldest outstanding request.
    requests: Mutex<HashMap<OpID, VecDeque<Arc<PendingSlot>>>>,
    properties: Mutex<HashMap<OpID, Bytes>>,
    registry: Mutex<HashMap<Address, HashSet<OpID>>>,
}

/// A single service hosted by a [`Server`](crate::Server).
///
/// Cloning is cheap and clones share all state.
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ProviderInner>,
}

/// Handle to one incoming request.
///
/// The handle can outlive the handler invocation: clone it, stash it,
/// and call [`Request::reply`] later to answer asynchronously. A request
/// can be answered at most once; replying after the client aborted it or
/// disconnected yields [`ServiceError::UnknownAction`].
#[derive(Clone)]
pub struct Request {
    service_id: ServiceID,
    slot: Arc<PendingSlot>,
    provider: Weak<ProviderInner>,
}

impl Request {
    pub fn op_id(&self) -> &OpID {
        &self.slot.op_id
    }

    pub fn source(&self) -> &Address {
        &self.slot.source
    }

    /// Decode the request input into a typed payload.
    pub fn input<P: Payload>(&self) -> Result<P> {
        decode(&self.slot.op_id, self.slot.content.as_ref()).map_err(Into::into)
    }

    /// Answer the request with a typed payload.
    pub fn reply<P: Payload>(&self, payload: &P) -> Result<()> {
        self.reply_raw(encode(payload)?)
    }

    /// Answer the request with pre-encoded content.
    pub fn reply_raw(&self, content: Bytes) -> Result<()> {
        let provider = self
            .provider
            .upgrade()
            .ok_or_else(|| ServiceError::ServiceUnavailable(self.service_id.clone()))?;
        provider.respond(&self.slot, Some(content))
    }

    /// Answer the request with a failure outcome.
    pub fn fail(&self) -> Result<()> {
        let provider = self
            .provider
            .upgrade()
            .ok_or_else(|| ServiceError::ServiceUnavailable(self.service_id.clone()))?;
        provider.respond(&self.slot, None)
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("service_id", &self.service_id)
            .field("op_id", &self.slot.op_id)
            .field("sequence", &self.slot.sequence)
            .field("source", &self.slot.source)
            .finish()
    }
}

impl ServiceProvider {
    pub(crate) fn new(service_id: ServiceID, outbound: Weak<dyn ProviderOutbound>) -> Self {
        ServiceProvider {
            inner: Arc::new(ProviderInner {
                service_id,
                outbound,
                availability: Mutex::new(Availability::Unavailable),
                handlers: Mutex::new(HashMap::new()),
                requests: Mutex::new(HashMap::new()),
                properties: Mutex::new(HashMap::new()),
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn service_id(&self) -> &ServiceID {
        &self.inner.service_id
    }

    pub fn availability(&self) -> Availability {
        *lock(&self.inner.availability)
    }

    /// Install the handler for one request operation.
    pub fn register_request_handler<F>(&self, op_id: OpID, handler: F) -> Result<()>
    where
        F: Fn(Request) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = lock(&self.inner.handlers);
        if handlers.contains_key(&op_id) {
            return Err(ServiceError::DuplicateRegistration(format!(
                "request handler for operation `{op_id}`"
            )));
        }
        handlers.insert(op_id, Arc::new(handler));
        Ok(())
    }

    /// Remove the handler for one request operation. Returns whether a
    /// handler was installed.
    pub fn unregister_request_handler(&self, op_id: &OpID) -> bool {
        lock(&self.inner.handlers).remove(op_id).is_some()
    }

    /// Mark the service available and announce the change.
    pub fn start_serving(&self) {
        {
            let mut availability = lock(&self.inner.availability);
            if availability.is_available() {
                return;
            }
            *availability = Availability::Available;
        }
        info!(service = %self.inner.service_id, "service started");
        self.inner.announce_availability(Availability::Unavailable, Availability::Available);
    }

    /// Mark the service unavailable, fail every in-flight request, and
    /// drop all subscriptions. The property cache survives so a restarted
    /// service resumes from its last known state.
    pub fn stop_serving(&self) {
        {
            let mut availability = lock(&self.inner.availability);
            if !availability.is_available() {
                return;
            }
            *availability = Availability::Unavailable;
        }
        info!(service = %self.inner.service_id, "service stopped");
        self.inner.announce_availability(Availability::Available, Availability::Unavailable);
        self.inner.drop_all_requests();
        lock(&self.inner.registry).clear();
    }

    /// Publish a property value: cache it and push it to every
    /// subscriber of the operation.
    pub fn set_status<P: Payload>(&self, payload: &P) -> Result<()> {
        self.set_status_raw(P::operation_id(), encode(payload)?)
    }

    pub fn set_status_raw(&self, op_id: OpID, content: Bytes) -> Result<()> {
        lock(&self.inner.properties).insert(op_id.clone(), content.clone());
        self.inner
            .notify_subscribers(&op_id, OpCode::StatusUpdate, Some(content));
        Ok(())
    }

    /// Last value published for a property, if any.
    pub fn get_status<P: Payload>(&self) -> Result<Option<P>> {
        let op_id = P::operation_id();
        match self.get_status_raw(&op_id) {
            Some(content) => Ok(Some(decode(&op_id, Some(&content))?)),
            None => Ok(None),
        }
    }

    pub fn get_status_raw(&self, op_id: &OpID) -> Option<Bytes> {
        lock(&self.inner.properties).get(op_id).cloned()
    }

    /// Fire a signal at every subscriber of the operation. Signals are
    /// not cached; late subscribers see nothing.
    pub fn broadcast_signal<P: Payload>(&self, payload: &P) -> Result<()> {
        self.broadcast_signal_raw(P::operation_id(), Some(encode(payload)?))
    }

    pub fn broadcast_signal_raw(&self, op_id: OpID, content: Option<Bytes>) -> Result<()> {
        self.inner
            .notify_subscribers(&op_id, OpCode::SignalBroadcast, content);
        Ok(())
    }

    /// Feed one client-to-server message into the provider. Returns
    /// false when the message could not be interpreted or the service is
    /// not serving.
    pub(crate) fn on_incoming_message(&self, msg: Message) -> bool {
        if !self.availability().is_available() {
            warn!(
                service = %self.inner.service_id,
                op_id = %msg.op_id,
                "message dropped, service is not serving"
            );
            return false;
        }
        match msg.op_code {
            OpCode::Request => self.on_action_request(msg),
            OpCode::RegisterStatus => {
                self.inner.save_registration(&msg);
                self.inner.push_cached_status(&msg);
                true
            }
            OpCode::RegisterSignal => {
                self.inner.save_registration(&msg);
                true
            }
            OpCode::UnregisterStatus | OpCode::UnregisterSignal => {
                self.inner.remove_registration(&msg.source, &msg.op_id);
                true
            }
            OpCode::AbortRequest => {
                match self.inner.pick_out(&msg.op_id, msg.seq) {
                    Some(slot) => debug!(
                        op_id = %slot.op_id,
                        sequence = slot.sequence,
                        "request aborted by client"
                    ),
                    None => debug!(
                        op_id = %msg.op_id,
                        sequence = msg.seq,
                        "abort for unknown request ignored"
                    ),
                }
                true
            }
            _ => {
                warn!(
                    service = %self.inner.service_id,
                    op_code = ?msg.op_code,
                    "provider cannot interpret message"
                );
                false
            }
        }
    }

    fn on_action_request(&self, msg: Message) -> bool {
        let handler = lock(&self.inner.handlers).get(&msg.op_id).cloned();
        let Some(handler) = handler else {
            warn!(
                service = %self.inner.service_id,
                op_id = %msg.op_id,
                "no handler for request"
            );
            let _ = self.inner.send_response(&msg.op_id, msg.seq, &msg.source, None);
            return true;
        };
        let slot = self.inner.save_request(&msg);
        let request = Request {
            service_id: self.inner.service_id.clone(),
            slot,
            provider: Arc::downgrade(&self.inner),
        };
        if let Err(err) = handler(request) {
            warn!(
                service = %self.inner.service_id,
                op_id = %msg.op_id,
                error = %err,
                "request handler failed"
            );
            // Fail the request unless the handler already answered it.
            if let Some(slot) = self.inner.pick_out(&msg.op_id, msg.seq) {
                let _ = self
                    .inner
                    .send_response(&slot.op_id, slot.sequence, &slot.source, None);
            }
        }
        true
    }

    /// Forget everything registered by a client that went away.
    pub(crate) fn handle_client_disconnected(&self, addr: &Address) {
        self.inner.remove_registrations_of(addr);
        let dropped = self.inner.drop_requests_from(addr);
        if dropped > 0 {
            warn!(
                service = %self.inner.service_id,
                client = %addr,
                dropped,
                "in-flight requests dropped, client disconnected"
            );
        }
    }
}

impl ProviderInner {
    fn respond(&self, slot: &Arc<PendingSlot>, content: Option<Bytes>) -> Result<()> {
        // Exactly-once: only the party that removes the slot may answer.
        let picked = self
            .pick_out(&slot.op_id, slot.sequence)
            .ok_or(ServiceError::UnknownAction)?;
        self.send_response(&picked.op_id, picked.sequence, &picked.source, content)
    }

    fn send_response(
        &self,
        op_id: &OpID,
        sequence: u64,
        dest: &Address,
        content: Option<Bytes>,
    ) -> Result<()> {
        let Some(outbound) = self.outbound.upgrade() else {
            return Err(ServiceError::ServiceUnavailable(self.service_id.clone()));
        };
        let msg = Message {
            service_id: self.service_id.clone(),
            op_id: op_id.clone(),
            op_code: OpCode::Response,
            source: outbound.local_address().clone(),
            dest: dest.clone(),
            seq: sequence,
            content,
        };
        if !outbound.deliver(msg) {
            warn!(
                service = %self.service_id,
                op_id = %op_id,
                dest = %dest,
                "response undeliverable"
            );
        }
        Ok(())
    }

    fn save_request(&self, msg: &Message) -> Arc<PendingSlot> {
        let slot = Arc::new(PendingSlot {
            op_id: msg.op_id.clone(),
            sequence: msg.seq,
            source: msg.source.clone(),
            content: msg.content.clone(),
            received_at: Instant::now(),
        });
        lock(&self.requests)
            .entry(msg.op_id.clone())
            .or_default()
            .push_back(Arc::clone(&slot));
        slot
    }

    fn pick_out(&self, op_id: &OpID, sequence: u64) -> Option<Arc<PendingSlot>> {
        let mut requests = lock(&self.requests);
        let queue = requests.get_mut(op_id)?;
        let pos = queue.iter().position(|slot| slot.sequence == sequence)?;
        let slot = queue.remove(pos);
        if queue.is_empty() {
            requests.remove(op_id);
        }
        slot
    }

    fn drop_all_requests(&self) {
        let dropped: Vec<Arc<PendingSlot>> = lock(&self.requests)
            .drain()
            .flat_map(|(_, queue)| queue)
            .collect();
        for slot in dropped {
            debug!(
                op_id = %slot.op_id,
                sequence = slot.sequence,
                age = ?slot.received_at.elapsed(),
                "in-flight request invalidated"
            );
        }
    }

    fn drop_requests_from(&self, addr: &Address) -> usize {
        let mut requests = lock(&self.requests);
        let mut dropped = 0;
        requests.retain(|_, queue| {
            queue.retain(|slot| {
                let keep = slot.source != *addr;
                if !keep {
                    dropped += 1;
                }
                keep
            });
            !queue.is_empty()
        });
        dropped
    }

    fn save_registration(&self, msg: &Message) {
        lock(&self.registry)
            .entry(msg.source.clone())
            .or_default()
            .insert(msg.op_id.clone());
    }

    fn remove_registration(&self, addr: &Address, op_id: &OpID) {
        let mut registry = lock(&self.registry);
        if let Some(ops) = registry.get_mut(addr) {
            ops.remove(op_id);
            if ops.is_empty() {
                registry.remove(addr);
            }
        }
    }

    fn remove_registrations_of(&self, addr: &Address) {
        if lock(&self.registry).remove(addr).is_some() {
            debug!(service = %self.service_id, client = %addr, "subscriptions pruned");
        }
    }

    /// Push the cached property value, if any, to a fresh subscriber.
    fn push_cached_status(&self, msg: &Message) {
        let Some(content) = lock(&self.properties).get(&msg.op_id).cloned() else {
            return;
        };
        let Some(outbound) = self.outbound.upgrade() else {
            return;
        };
        let update = Message {
            service_id: self.service_id.clone(),
            op_id: msg.op_id.clone(),
            op_code: OpCode::StatusUpdate,
            source: outbound.local_address().clone(),
            dest: msg.source.clone(),
            seq: 0,
            content: Some(content),
        };
        if !outbound.deliver(update) {
            warn!(
                service = %self.service_id,
                client = %msg.source,
                "cached status undeliverable, pruning subscriber"
            );
            self.remove_registrations_of(&msg.source);
        }
    }

    fn notify_subscribers(&self, op_id: &OpID, op_code: OpCode, content: Option<Bytes>) {
        let Some(outbound) = self.outbound.upgrade() else {
            return;
        };
        // Snapshot the targets so no lock is held across delivery.
        let targets: Vec<Address> = lock(&self.registry)
            .iter()
            .filter(|(_, ops)| ops.contains(op_id))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in targets {
            let msg = Message {
                service_id: self.service_id.clone(),
                op_id: op_id.clone(),
                op_code,
                source: outbound.local_address().clone(),
                dest: addr.clone(),
                seq: 0,
                content: content.clone(),
            };
            if !outbound.deliver(msg) {
                warn!(
                    service = %self.service_id,
                    client = %addr,
                    op_id = %op_id,
                    "subscriber unreachable, pruning"
                );
                self.remove_registrations_of(&addr);
            }
        }
    }

    fn announce_availability(&self, previous: Availability, current: Availability) {
        let Some(outbound) = self.outbound.upgrade() else {
            return;
        };
        let change = StatusChange { previous, current };
        let content = match encode(&change) {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "availability announcement not encodable");
                return;
            }
        };
        let template = Message {
            service_id: self.service_id.clone(),
            op_id: StatusChange::operation_id(),
            op_code: OpCode::ServerStatusChanged,
            source: outbound.local_address().clone(),
            dest: Address::invalid(),
            seq: 0,
            content: Some(content),
        };
        // Subscribers may live outside the local announce scope, so they
        // also get a directed copy.
        let subscribers: Vec<Address> = lock(&self.registry).keys().cloned().collect();
        for addr in subscribers {
            let mut msg = template.clone();
            msg.dest = addr;
            let _ = outbound.deliver(msg);
        }
        outbound.announce(template);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Temperature {
        celsius: i32,
    }

    impl Payload for Temperature {
        fn operation_id() -> OpID {
            OpID::new("temperature")
        }
    }

    struct Recording {
        address: Address,
        delivered: Mutex<Vec<Message>>,
        announced: Mutex<Vec<Message>>,
        unreachable: Mutex<Vec<Address>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Recording {
                address: Address::new("server", 1),
                delivered: Mutex::new(Vec::new()),
                announced: Mutex::new(Vec::new()),
                unreachable: Mutex::new(Vec::new()),
            })
        }

        fn provider(self: &Arc<Self>) -> ServiceProvider {
            let outbound: Arc<dyn ProviderOutbound> = Arc::clone(self) as _;
            ServiceProvider::new(ServiceID::new("weather"), Arc::downgrade(&outbound))
        }

        fn sent(&self) -> Vec<Message> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl ProviderOutbound for Recording {
        fn deliver(&self, msg: Message) -> bool {
            if self.unreachable.lock().unwrap().contains(&msg.dest) {
                return false;
            }
            self.delivered.lock().unwrap().push(msg);
            true
        }

        fn announce(&self, msg: Message) -> bool {
            self.announced.lock().unwrap().push(msg);
            true
        }

        fn local_address(&self) -> &Address {
            &self.address
        }
    }

    fn request_msg(op: &str, seq: u64, content: Option<Bytes>) -> Message {
        Message {
            service_id: ServiceID::new("weather"),
            op_id: OpID::new(op),
            op_code: OpCode::Request,
            source: Address::new("client", 2),
            dest: Address::new("server", 1),
            seq,
            content,
        }
    }

    fn register_msg(op: &str, code: OpCode, client: Address) -> Message {
        Message {
            service_id: ServiceID::new("weather"),
            op_id: OpID::new(op),
            op_code: code,
            source: client,
            dest: Address::new("server", 1),
            seq: 7,
            content: None,
        }
    }

    #[test]
    fn request_without_handler_fails_with_empty_response() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();

        assert!(provider.on_incoming_message(request_msg("nope", 3, None)));

        let responses: Vec<Message> = outbound
            .sent()
            .into_iter()
            .filter(|m| m.op_code == OpCode::Response)
            .collect();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].seq, 3);
        assert!(responses[0].content.is_none());
    }

    #[test]
    fn handler_reply_carries_the_request_sequence() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();
        provider
            .register_request_handler(Temperature::operation_id(), |req: Request| {
                let input: Temperature = req.input()?;
                req.reply(&Temperature {
                    celsius: input.celsius + 1,
                })
            })
            .unwrap();

        let content = encode(&Temperature { celsius: 20 }).unwrap();
        provider.on_incoming_message(request_msg("temperature", 11, Some(content)));

        let sent = outbound.sent();
        let response = sent.iter().find(|m| m.op_code == OpCode::Response).unwrap();
        assert_eq!(response.seq, 11);
        let out: Temperature = decode(&response.op_id, response.content.as_ref()).unwrap();
        assert_eq!(out.celsius, 21);
    }

    #[test]
    fn deferred_reply_after_abort_is_rejected() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();

        let parked: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&parked);
        provider
            .register_request_handler(OpID::new("slow"), move |req| {
                *stash.lock().unwrap() = Some(req);
                Ok(())
            })
            .unwrap();

        provider.on_incoming_message(request_msg("slow", 5, None));
        let mut abort = request_msg("slow", 5, None);
        abort.op_code = OpCode::AbortRequest;
        provider.on_incoming_message(abort);

        let req = parked.lock().unwrap().take().unwrap();
        let err = req.reply_raw(Bytes::from_static(b"late")).unwrap_err();
        assert!(matches!(err, ServiceError::UnknownAction));
        assert!(outbound.sent().iter().all(|m| m.op_code != OpCode::Response));
    }

    #[test]
    fn register_status_pushes_cached_value() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();
        provider.set_status(&Temperature { celsius: 7 }).unwrap();

        let client = Address::new("client", 2);
        provider.on_incoming_message(register_msg(
            "temperature",
            OpCode::RegisterStatus,
            client.clone(),
        ));

        let updates: Vec<Message> = outbound
            .sent()
            .into_iter()
            .filter(|m| m.op_code == OpCode::StatusUpdate && m.dest == client)
            .collect();
        assert_eq!(updates.len(), 1);
        let value: Temperature = decode(&updates[0].op_id, updates[0].content.as_ref()).unwrap();
        assert_eq!(value.celsius, 7);
    }

    #[test]
    fn set_status_prunes_unreachable_subscribers() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();

        let gone = Address::new("gone", 9);
        provider.on_incoming_message(register_msg(
            "temperature",
            OpCode::RegisterStatus,
            gone.clone(),
        ));
        outbound.unreachable.lock().unwrap().push(gone.clone());

        provider.set_status(&Temperature { celsius: 1 }).unwrap();
        let before = outbound.sent().len();
        provider.set_status(&Temperature { celsius: 2 }).unwrap();

        // Pruned after the first failed push, so nothing new goes out.
        assert_eq!(outbound.sent().len(), before);
    }

    #[test]
    fn stop_serving_fails_pendings_and_keeps_properties() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();
        provider.set_status(&Temperature { celsius: 4 }).unwrap();

        let parked: Arc<Mutex<Option<Request>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&parked);
        provider
            .register_request_handler(OpID::new("slow"), move |req| {
                *stash.lock().unwrap() = Some(req);
                Ok(())
            })
            .unwrap();
        provider.on_incoming_message(request_msg("slow", 8, None));

        provider.stop_serving();
        provider.stop_serving(); // idempotent

        let req = parked.lock().unwrap().take().unwrap();
        assert!(matches!(
            req.reply_raw(Bytes::from_static(b"x")).unwrap_err(),
            ServiceError::UnknownAction
        ));
        let cached: Option<Temperature> = provider.get_status().unwrap();
        assert_eq!(cached, Some(Temperature { celsius: 4 }));
        assert!(!provider.on_incoming_message(request_msg("slow", 9, None)));
    }

    #[test]
    fn client_disconnect_drops_only_that_clients_state() {
        let outbound = Recording::new();
        let provider = outbound.provider();
        provider.start_serving();

        let staying = Address::new("staying", 3);
        provider.on_incoming_message(register_msg(
            "temperature",
            OpCode::RegisterStatus,
            staying.clone(),
        ));
        provider.on_incoming_message(register_msg(
            "temperature",
            OpCode::RegisterStatus,
            Address::new("leaving", 4),
        ));

        provider.handle_client_disconnected(&Address::new("leaving", 4));
        let before = outbound.sent().len();
        provider.set_status(&Temperature { celsius: 0 }).unwrap();

        let mut all = outbound.sent();
        let new = all.split_off(before);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].dest, staying);
    }
}
