//! Service availability: announcements, teardown, and subscriber pruning.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use csbus::message::{
    decode, Address, Availability, Message, OpCode, OpID, Payload, ServiceID, StatusChange,
};
use csbus::routing::{Component, Router};
use csbus::service::{Client, Request, Server, ServiceError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Report {
    value: i64,
}

impl Payload for Report {
    fn operation_id() -> OpID {
        OpID::new("report")
    }
}

fn weather() -> ServiceID {
    ServiceID::new("weather")
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn availability_follows_start_and_stop() {
    let router = Router::new();
    let server = Server::new(&router, Address::new("server", 1)).unwrap();
    let provider = server.serve(weather()).unwrap();
    let client = Client::new(&router, Address::new("client", 1), Address::new("server", 1)).unwrap();
    let requester = client.requester(&weather());
    assert_eq!(requester.service_status(), Availability::Unavailable);

    provider.start_serving();
    assert!(wait_until(Duration::from_secs(5), || {
        requester.service_status().is_available()
    }));

    provider.stop_serving();
    assert!(wait_until(Duration::from_secs(5), || {
        !requester.service_status().is_available()
    }));
}

#[test]
fn stop_serving_unblocks_sync_callers() {
    let router = Router::new();
    let server = Server::new(&router, Address::new("server", 1)).unwrap();
    let provider = server.serve(weather()).unwrap();
    let (held_tx, held_rx) = mpsc::channel::<()>();
    provider
        .register_request_handler(Report::operation_id(), move |req: Request| {
            held_tx.send(()).ok();
            std::mem::forget(req);
            Ok(())
        })
        .unwrap();
    let client = Client::new(&router, Address::new("client", 1), Address::new("server", 1)).unwrap();
    let requester = client.requester(&weather());
    provider.start_serving();
    assert!(wait_until(Duration::from_secs(5), || {
        requester.service_status().is_available()
    }));

    let blocked = {
        let requester = requester.clone();
        thread::spawn(move || {
            requester.call_sync::<Report, Report>(&Report { value: 1 }, Duration::from_secs(30))
        })
    };
    held_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    provider.stop_serving();
    let err = blocked.join().unwrap().unwrap_err();
    assert!(matches!(err, ServiceError::ServiceUnavailable(_)));
}

#[test]
fn requests_are_dropped_while_not_serving() {
    let router = Router::new();
    let server = Server::new(&router, Address::new("server", 1)).unwrap();
    let provider = server.serve(weather()).unwrap();
    provider
        .register_request_handler(Report::operation_id(), |req: Request| {
            let input: Report = req.input()?;
            req.reply(&input)
        })
        .unwrap();
    // Never started serving.

    let client = Client::new(&router, Address::new("client", 1), Address::new("server", 1)).unwrap();
    let requester = client.requester(&weather());

    let err = requester
        .call_sync::<Report, Report>(&Report { value: 1 }, Duration::from_millis(100))
        .unwrap_err();
    assert!(matches!(err, ServiceError::Timeout(_)));
}

#[test]
fn disconnected_client_stops_receiving_updates() {
    let router = Router::new();
    let server = Server::new(&router, Address::new("server", 1)).unwrap();
    let provider = server.serve(weather()).unwrap();
    provider.start_serving();

    let staying =
        Client::new(&router, Address::new("staying", 1), Address::new("server", 1)).unwrap();
    let leaving =
        Client::new(&router, Address::new("leaving", 1), Address::new("server", 1)).unwrap();

    let (stay_tx, stay_rx) = mpsc::channel::<Report>();
    staying
        .requester(&weather())
        .subscribe_status::<Report, _>(move |value| {
            stay_tx.send(value).ok();
        })
        .unwrap();
    let (leave_tx, leave_rx) = mpsc::channel::<Report>();
    leaving
        .requester(&weather())
        .subscribe_status::<Report, _>(move |value| {
            leave_tx.send(value).ok();
        })
        .unwrap();

    provider.set_status(&Report { value: 1 }).unwrap();
    assert_eq!(
        stay_rx.recv_timeout(Duration::from_secs(5)).unwrap().value,
        1
    );
    assert_eq!(
        leave_rx.recv_timeout(Duration::from_secs(5)).unwrap().value,
        1
    );

    leaving.disconnect();
    provider.set_status(&Report { value: 2 }).unwrap();

    // The staying client still gets updates; the leaving one is gone.
    assert_eq!(
        stay_rx.recv_timeout(Duration::from_secs(5)).unwrap().value,
        2
    );
    assert!(leave_rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn interested_component_is_notified_through_its_mailbox() {
    let router = Router::new();
    let server = Server::new(&router, Address::new("server", 1)).unwrap();
    let provider = server.serve(weather()).unwrap();
    let client = Client::new(&router, Address::new("client", 1), Address::new("server", 1)).unwrap();

    let watcher = Component::new(Address::new("watcher", 1));
    let (tx, rx) = mpsc::channel::<Message>();
    watcher.set_message_handler(move |msg| {
        tx.send(msg).ok();
    });
    router.add_receiver(&watcher).unwrap();
    watcher.start();

    // Creating the requester from the watcher's own thread registers it
    // for availability notifications.
    let (ready_tx, ready_rx) = mpsc::channel::<()>();
    {
        let client = client.clone();
        watcher.execute(move || {
            client.requester(&weather());
            ready_tx.send(()).ok();
        });
    }
    ready_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    provider.start_serving();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = rx.recv_timeout(remaining).unwrap();
        if msg.op_code != OpCode::ServerStatusChanged || !msg.service_id.is_valid() {
            continue;
        }
        let change: StatusChange = decode(&msg.op_id, msg.content.as_ref()).unwrap();
        if change.current.is_available() {
            break;
        }
    }
    watcher.stop();
}
