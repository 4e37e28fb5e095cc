//! Client endpoint: one address talking to one server endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use csbus_message::{decode, Address, Availability, Message, OpCode, ServiceID, StatusChange};
use csbus_routing::{Component, ComponentHandle, Router};
use tracing::{debug, info, warn};

use crate::error::{Result, ServiceError};
use crate::lock;
use crate::requester::{ClientOutbound, ServiceRequester};
use crate::transport::Transport;

/// A client endpoint registered on a [`Router`].
///
/// The client owns a mailbox component under its address and hands out
/// one [`ServiceRequester`] per service. Everything the server sends
/// back lands in the mailbox and is dispatched to the right requester
/// on the mailbox thread.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    address: Address,
    server_address: Address,
    router: Router,
    component: Component,
    handle: Mutex<Option<ComponentHandle>>,
    requesters: Mutex<HashMap<ServiceID, ServiceRequester>>,
    server_status: Mutex<Availability>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    torn_down: AtomicBool,
}

impl Client {
    /// Register a client endpoint under `address`, targeting the server
    /// at `server_address`. Fails when the address is already taken on
    /// the router.
    pub fn new(router: &Router, address: Address, server_address: Address) -> Result<Client> {
        let component = Component::new(address.clone());
        let server_reachable = router.find_receiver(&server_address).is_some();
        let inner = Arc::new(ClientInner {
            address: address.clone(),
            server_address,
            router: router.clone(),
            component: component.clone(),
            handle: Mutex::new(None),
            requesters: Mutex::new(HashMap::new()),
            server_status: Mutex::new(if server_reachable {
                Availability::Available
            } else {
                Availability::Unavailable
            }),
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
        info!(
            address = %inner.address,
            server = %inner.server_address,
            "client endpoint up"
        );
        Ok(Client { inner })
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn server_address(&self) -> &Address {
        &self.inner.server_address
    }

    /// Last known reachability of the server endpoint.
    pub fn server_status(&self) -> Availability {
        *lock(&self.inner.server_status)
    }

    /// The requester for one service, created on first use. When called
    /// from a component thread, that component is registered for
    /// availability notifications.
    pub fn requester(&self, service_id: &ServiceID) -> ServiceRequester {
        let requester = lock(&self.inner.requesters)
            .entry(service_id.clone())
            .or_insert_with(|| {
                let outbound: Arc<dyn ClientOutbound> = Arc::clone(&self.inner) as _;
                ServiceRequester::new(
                    service_id.clone(),
                    self.inner.router.clone(),
                    Arc::downgrade(&outbound),
                )
            })
            .clone();
        if let Some(handle) = Component::current() {
            let _ = requester.add_interested_component(handle);
        }
        requester
    }

    /// Attach the byte transport used when the server lives outside
    /// this process. The server's reachability is probed immediately.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        transport.init_connection(&self.inner.server_address);
        // A locally routable server wins over the transport's opinion.
        let status = if self
            .inner
            .router
            .find_receiver(&self.inner.server_address)
            .is_some()
        {
            Availability::Available
        } else {
            transport.check_status(&self.inner.server_address)
        };
        *lock(&self.inner.transport) = Some(transport);
        self.inner.set_server_status(status);
    }

    /// Feed one serialized frame received from the transport.
    pub fn handle_inbound_bytes(&self, frame: &[u8]) -> bool {
        match Message::from_bytes(frame) {
            Ok(msg) => self.inner.component.post_message(msg),
            Err(err) => {
                warn!(address = %self.inner.address, error = %err, "inbound frame dropped");
                false
            }
        }
    }

    /// Drop every subscription and in-flight request, then leave the
    /// router.
    pub fn disconnect(&self) {
        self.inner.teardown();
    }
}

impl ClientInner {
    fn dispatch(&self, msg: Message) {
        if msg.op_code == OpCode::ServerStatusChanged && !msg.service_id.is_valid() {
            // Receiver-status note from the router.
            if msg.source == self.server_address {
                if let Ok(change) = decode::<StatusChange>(&msg.op_id, msg.content.as_ref()) {
                    self.set_server_status(change.current);
                }
            }
            return;
        }
        let requester = lock(&self.requesters).get(&msg.service_id).cloned();
        match requester {
            Some(requester) => {
                requester.on_incoming_message(msg);
            }
            None => debug!(
                address = %self.address,
                service = %msg.service_id,
                "message for unknown requester dropped"
            ),
        }
    }

    fn set_server_status(&self, current: Availability) {
        {
            let mut status = lock(&self.server_status);
            if *status == current {
                return;
            }
            *status = current;
        }
        info!(
            address = %self.address,
            server = %self.server_address,
            ?current,
            "server reachability changed"
        );
        let requesters: Vec<ServiceRequester> = lock(&self.requesters).values().cloned().collect();
        for requester in requesters {
            requester.on_server_status_changed(current);
        }
    }

    fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let requesters: Vec<ServiceRequester> = lock(&self.requesters).values().cloned().collect();
        for requester in requesters {
            requester.shutdown();
        }
        lock(&self.requesters).clear();
        if let Some(handle) = lock(&self.handle).take() {
            self.router.remove_receiver(handle);
        }
        self.component.stop();
        info!(address = %self.address, "client endpoint down");
    }
}

impl ClientOutbound for ClientInner {
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

    fn local_address(&self) -> &Address {
        &self.address
    }

    fn server_address(&self) -> &Address {
        &self.server_address
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.teardown();
    }
}
