use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use csbus_message::{encode, Address, Availability, Message, OpCode, Payload, ServiceID, StatusChange};
use tracing::{debug, warn};

use crate::component::Component;
use crate::lock;

/// Generation-tagged handle to a registered component.
///
/// Resolving a handle either yields the live component or a definitive
/// "gone": once the slot is reused the generation no longer matches. This is
/// the weak-reference mechanism of the stack; no raw weak pointers are
/// scattered through callback closures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentHandle {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    component: Option<Component>,
}

#[derive(Default)]
struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_address: HashMap<Address, u32>,
}

/// The live set of addressable components in this process.
///
/// An explicit value, injected where needed; cloning shares one registry.
/// Failed routing is not an error — it is the normal signal that a peer has
/// gone away.
#[derive(Clone, Default)]
pub struct Router {
    registry: Arc<Mutex<Registry>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component under its address and hand back its handle.
    ///
    /// On success every *other* registered receiver is told the new address
    /// is `Available`. Returns `None` if the address is already taken.
    pub fn add_receiver(&self, component: &Component) -> Option<ComponentHandle> {
        let (handle, others) = {
            let mut registry = lock(&self.registry);
            if registry.by_address.contains_key(component.address()) {
                return None;
            }
            let index = match registry.free.pop() {
                Some(index) => index,
                None => {
                    registry.slots.push(Slot {
                        generation: 0,
                        component: None,
                    });
                    (registry.slots.len() - 1) as u32
                }
            };
            let slot = &mut registry.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.component = Some(component.clone());
            let handle = ComponentHandle {
                index,
                generation: slot.generation,
            };
            registry
                .by_address
                .insert(component.address().clone(), index);
            let others: Vec<Component> = registry
                .slots
                .iter()
                .filter_map(|slot| slot.component.clone())
                .filter(|other| other.address() != component.address())
                .collect();
            (handle, others)
        };
        component.set_handle(Some(handle));
        debug!(address = %component.address(), "receiver registered");
        let msg = receiver_status(component.address(), Availability::Available);
        for other in others {
            other.post_message(msg.clone());
        }
        Some(handle)
    }

    /// Unregister a component. On success every remaining receiver is told
    /// the address is `Unavailable`. Returns `false` if the handle is stale.
    pub fn remove_receiver(&self, handle: ComponentHandle) -> bool {
        let removed = {
            let mut registry = lock(&self.registry);
            let Some(slot) = registry.slots.get_mut(handle.index as usize) else {
                return false;
            };
            if slot.generation != handle.generation {
                return false;
            }
            let Some(component) = slot.component.take() else {
                return false;
            };
            slot.generation = slot.generation.wrapping_add(1);
            let address = component.address().clone();
            registry.by_address.remove(&address);
            registry.free.push(handle.index);
            component.set_handle(None);
            address
        };
        debug!(address = %removed, "receiver unregistered");
        self.broadcast(receiver_status(&removed, Availability::Unavailable));
        true
    }

    /// Pure lookup by address; never blocks beyond the registry lock.
    pub fn find_receiver(&self, address: &Address) -> Option<Component> {
        let registry = lock(&self.registry);
        let index = *registry.by_address.get(address)?;
        registry.slots[index as usize].component.clone()
    }

    /// Resolve a handle to the live component, or `None` if it is gone.
    pub fn resolve(&self, handle: ComponentHandle) -> Option<Component> {
        let registry = lock(&self.registry);
        let slot = registry.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.component.clone()
    }

    /// Post a message into the addressed component's mailbox.
    pub fn route_message(&self, address: &Address, msg: Message) -> bool {
        match self.find_receiver(address) {
            Some(component) => component.post_message(msg),
            None => false,
        }
    }

    /// Post a message and block until it has been handled, bounded by
    /// `timeout`.
    pub fn route_message_and_wait(&self, address: &Address, msg: Message, timeout: Duration) -> bool {
        match self.find_receiver(address) {
            Some(component) => component.post_and_wait(msg, timeout),
            None => false,
        }
    }

    /// Post a deferred execution into the addressed component's mailbox.
    pub fn route_execution(&self, address: &Address, exec: impl FnOnce() + Send + 'static) -> bool {
        match self.find_receiver(address) {
            Some(component) => component.execute(exec),
            None => false,
        }
    }

    /// Post an execution and block until it has run, bounded by `timeout`.
    pub fn route_and_wait_execution(
        &self,
        address: &Address,
        exec: impl FnOnce() + Send + 'static,
        timeout: Duration,
    ) -> bool {
        match self.find_receiver(address) {
            Some(component) => component.execute_and_wait(exec, timeout),
            None => false,
        }
    }

    /// Deliver to every registered component. Returns `true` iff at least
    /// one delivery succeeded.
    pub fn broadcast(&self, msg: Message) -> bool {
        let receivers: Vec<Component> = {
            let registry = lock(&self.registry);
            registry
                .slots
                .iter()
                .filter_map(|slot| slot.component.clone())
                .collect()
        };
        let mut delivered = false;
        for receiver in receivers {
            delivered |= receiver.post_message(msg.clone());
        }
        delivered
    }
}

fn receiver_status(address: &Address, current: Availability) -> Message {
    let previous = match current {
        Availability::Available => Availability::Unavailable,
        Availability::Unavailable => Availability::Available,
    };
    let content = match encode(&StatusChange::new(previous, current)) {
        Ok(content) => Some(content),
        Err(err) => {
            warn!(error = %err, "failed to encode receiver status");
            None
        }
    };
    Message {
        source: address.clone(),
        content,
        ..Message::new(
            ServiceID::invalid(),
            StatusChange::operation_id(),
            OpCode::ServerStatusChanged,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use csbus_message::{decode, OpID};

    use super::*;

    fn spawn_component(router: &Router, name: &str) -> (Component, ComponentHandle) {
        let component = Component::new(Address::new(name, 0));
        assert!(component.start());
        let handle = router
            .add_receiver(&component)
            .expect("address should be free");
        (component, handle)
    }

    fn probe() -> Message {
        Message::new(
            ServiceID::from("svc"),
            OpID::from("probe"),
            OpCode::SignalBroadcast,
        )
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let router = Router::new();
        let (first, _) = spawn_component(&router, "dup");
        let second = Component::new(Address::new("dup", 0));
        assert!(router.add_receiver(&second).is_none());
        first.stop();
    }

    #[test]
    fn route_to_missing_receiver_is_false_not_error() {
        let router = Router::new();
        assert!(!router.route_message(&Address::new("ghost", 0), probe()));
        assert!(!router.route_execution(&Address::new("ghost", 0), || {}));
    }

    #[test]
    fn stale_handle_resolves_to_gone() {
        let router = Router::new();
        let (component, handle) = spawn_component(&router, "ephemeral");
        assert!(router.resolve(handle).is_some());
        assert!(router.remove_receiver(handle));
        assert!(router.resolve(handle).is_none());
        assert!(!router.remove_receiver(handle));
        component.stop();

        // Reusing the slot must not resurrect the old handle.
        let (next, next_handle) = spawn_component(&router, "successor");
        assert!(router.resolve(handle).is_none());
        assert!(router.resolve(next_handle).is_some());
        next.stop();
    }

    #[test]
    fn registration_broadcasts_availability_to_others() {
        let router = Router::new();
        let observer = Component::new(Address::new("observer", 0));
        let (tx, rx) = mpsc::channel();
        observer.set_message_handler(move |msg| {
            if msg.op_code == OpCode::ServerStatusChanged {
                let change: StatusChange =
                    decode(&msg.op_id, msg.content.as_ref()).expect("status payload");
                tx.send((msg.source.clone(), change.current)).unwrap();
            }
        });
        assert!(observer.start());
        router.add_receiver(&observer).unwrap();

        let (newcomer, newcomer_handle) = spawn_component(&router, "newcomer");
        let (source, status) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(source, Address::new("newcomer", 0));
        assert_eq!(status, Availability::Available);

        router.remove_receiver(newcomer_handle);
        let (source, status) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(source, Address::new("newcomer", 0));
        assert_eq!(status, Availability::Unavailable);

        newcomer.stop();
        observer.stop();
    }

    #[test]
    fn broadcast_reports_any_delivery() {
        let router = Router::new();
        assert!(!router.broadcast(probe()));
        let (component, _) = spawn_component(&router, "listener");
        assert!(router.broadcast(probe()));
        component.stop();
    }

    #[test]
    fn route_and_wait_execution_runs_on_target() {
        let router = Router::new();
        let (component, _) = spawn_component(&router, "target");
        let (tx, rx) = mpsc::channel();
        let ok = router.route_and_wait_execution(
            &Address::new("target", 0),
            move || {
                tx.send(Component::current()).unwrap();
            },
            Duration::from_secs(2),
        );
        assert!(ok);
        let seen = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(seen, component.handle());
        component.stop();
    }
}
