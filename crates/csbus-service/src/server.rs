//! Server endpoint: one address hosting any number of services.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use csbus_message::{decode, Address, Message, OpCode, ServiceID, StatusChange};
use csbus_routing::{Component, ComponentHandle, Router};
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::lock;
use crate::provider::{ProviderOutbound, ServiceProvider};
use crate::transport::Transport;

/// A server endpoint registered on a [`Router`].
///
/// The server owns a mailbox component under its address; everything
/// routed to that address is dispatched to the hosted providers on the
/// mailbox thread. Messages for destinations outside the local router
/// fall back to an attached [`Transport`].
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    address: Address,
    router: Router,
    component: Component,
    handle: Mutex<Option<ComponentHandle>>,
    providers: Mutex<HashMap<ServiceID, ServiceProvider>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    torn_down: AtomicBool,
}

impl Server {
    /// Register a server endpoint under `address`. Fails when the
    /// address is already taken on the router.
    pub fn new(router: &Router, address: Address) -> Result<Server> {
        let component = Component::new(address.clone());
        let inner = Arc::new(ServerInner {
            address: address.clone(),
            router: router.clone(),
            component: component.clone(),
            handle: Mutex::new(None),
            providers: Mutex::new(HashMap::new()),
            transport: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&inner);
        component.set_message_handler(move |msg| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(msg);
            }
        });
        let handle = router.add_receiver(&component).ok_or_else(|| {
            ServiceError::DuplicateRegistration(format!("address `{address}` already registered"))
        })?;
        *lock(&inner.handle) = Some(handle);
        component.start();
        info!(address = %inner.address, "server endpoint up");
        Ok(Server { inner })
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    /// Host a service under this endpoint. The returned provider starts
    /// out unavailable; call
    /// [`start_serving`](ServiceProvider::start_serving) once its
    /// handlers are in place.
    pub fn serve(&self, service_id: ServiceID) -> Result<ServiceProvider> {
        let mut providers = lock(&self.inner.providers);
        if providers.contains_key(&service_id) {
            return Err(ServiceError::DuplicateRegistration(format!(
                "service `{service_id}` already hosted"
            )));
        }
        let outbound: Arc<dyn ProviderOutbound> = Arc::clone(&self.inner) as _;
        let provider = ServiceProvider::new(service_id.clone(), Arc::downgrade(&outbound));
        providers.insert(service_id, provider.clone());
        Ok(provider)
    }

    pub fn provider(&self, service_id: &ServiceID) -> Option<ServiceProvider> {
        lock(&self.inner.providers).get(service_id).cloned()
    }

    /// Attach the byte transport used for clients outside this process.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *lock(&self.inner.transport) = Some(transport);
    }

    /// Feed one serialized frame received from the transport. Delivery
    /// goes through the mailbox so transport threads never run provider
    /// code directly.
    pub fn handle_inbound_bytes(&self, frame: &[u8]) -> bool {
        match Message::from_bytes(frame) {
            Ok(msg) => self.inner.component.post_message(msg),
            Err(err) => {
                warn!(address = %self.inner.address, error = %err, "inbound frame dropped");
                false
            }
        }
    }

    /// Stop every hosted service and leave the router.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }
}

impl ServerInner {
    fn dispatch(&self, msg: Message) {
        if msg.op_code == OpCode::ServerStatusChanged {
            // Only receiver-status notes from the router are meaningful
            // inbound; a vanished client endpoint takes its
            // registrations with it.
            if !msg.service_id.is_valid() {
                if let Ok(change) = decode::<StatusChange>(&msg.op_id, msg.content.as_ref()) {
                    if !change.current.is_available() {
                        self.on_client_disconnected(&msg.source);
                    }
                }
            }
            return;
        }
        let provider = lock(&self.providers).get(&msg.service_id).cloned();
        match provider {
            Some(provider) => {
                provider.on_incoming_message(msg);
            }
            None => {
                warn!(
                    address = %self.address,
                    service = %msg.service_id,
                    "message for unknown service"
                );
                if msg.op_code == OpCode::Request {
                    let failure = msg.to_response(None);
                    self.deliver(failure);
                }
            }
        }
    }

    fn on_client_disconnected(&self, addr: &Address) {
        debug!(address = %self.address, client = %addr, "client endpoint gone");
        let providers: Vec<ServiceProvider> = lock(&self.providers).values().cloned().collect();
        for provider in providers {
            provider.handle_client_disconnected(addr);
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let providers: Vec<ServiceProvider> = lock(&self.providers).values().cloned().collect();
        for provider in providers {
            provider.stop_serving();
        }
        lock(&self.providers).clear();
        if let Some(handle) = lock(&self.handle).take() {
            self.router.remove_receiver(handle);
        }
        self.component.stop();
        info!(address = %self.address, "server endpoint down");
    }
}

impl ProviderOutbound for ServerInner {
    fn deliver(&self, msg: Message) -> bool {
        if self.router.find_receiver(&msg.dest).is_some() {
            let dest = msg.dest.clone();
            return self.router.route_message(&dest, msg);
        }
        let transport = lock(&self.transport).clone();
        let Some(transport) = transport else {
            return false;
        };
        match msg.to_bytes() {
            Ok(frame) => transport.send(frame, &msg.dest).is_delivered(),
            Err(err) => {
                warn!(address = %self.address, error = %err, "outbound frame not encodable");
                false
            }
        }
    }

    fn announce(&self, msg: Message) -> bool {
        self.router.broadcast(msg)
    }

    fn local_address(&self) -> &Address {
        &self.address
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.teardown();
    }
}
