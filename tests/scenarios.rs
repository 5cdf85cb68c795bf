//! End-to-end scenarios across the public API

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerlink::config::ConnectionConfig;
use peerlink::connection::{Connection, Driver, SendOptions};
use peerlink::core::serialization::TypeRegistry;
use peerlink::core::value::{FieldType, Value};
use peerlink::error::{ProtocolError, Result};
use peerlink::field_serializable;
use peerlink::service::{
    PingService, RemoteCapability, RemoteObject, RemoteObjectManager, RemoteProxy, Server,
    SharedObjectListener, SharedObjectManager,
};
use peerlink::translator::{EncryptionTranslator, KeyPair, Translator};
use peerlink::transport::ChannelTransport;
use peerlink::utils::ManualClock;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
struct Counter {
    value: i32,
}

field_serializable!(Counter, "scenario.Counter", { value: I32 });

#[derive(Debug, Default, Clone, PartialEq)]
struct Note {
    text: String,
}

field_serializable!(Note, "scenario.Note", { text: Str });

fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry.register_fields::<Counter>().unwrap();
    registry.register_fields::<Note>().unwrap();
    Arc::new(registry)
}

fn linked() -> (Arc<Connection>, Arc<Connection>) {
    let (ta, tb) = ChannelTransport::pair();
    let a = Connection::builder(registry()).peer_id(1).build(ta).unwrap();
    let b = Connection::builder(registry()).peer_id(2).build(tb).unwrap();
    (a, b)
}

fn pump(connections: &[&Arc<Connection>]) {
    for _ in 0..3 {
        for connection in connections {
            connection.update();
        }
    }
}

fn chunk_lengths(mut wire: &[u8]) -> Vec<usize> {
    let mut lengths = Vec::new();
    while wire.len() >= 2 {
        let len = usize::from(u16::from_be_bytes([wire[0], wire[1]]));
        lengths.push(len);
        wire = &wire[2 + len..];
    }
    assert!(wire.is_empty());
    lengths
}

#[test]
fn scenario_encrypt_300_bytes_in_three_chunks() {
    let alice = Arc::new(KeyPair::generate());
    let bob = Arc::new(KeyPair::generate());
    let mut sender = EncryptionTranslator::new(1024, alice.clone(), bob.public()).unwrap();
    let mut receiver = EncryptionTranslator::new(1024, bob, alice.public()).unwrap();
    assert_eq!(sender.block_size(), 124);

    let payload: Vec<u8> = (0..300u32).map(|i| (i * 7 % 251) as u8).collect();
    let wire = sender.outbound(&payload).unwrap();

    // ephemeral key + salt + tag around each plaintext block
    let overhead = 32 + 4 + 16;
    assert_eq!(
        chunk_lengths(&wire),
        vec![124 + overhead, 124 + overhead, 52 + overhead]
    );
    assert_eq!(receiver.inbound(&wire).unwrap(), payload);
}

#[derive(Default)]
struct Changes(Mutex<Vec<(String, String, Value)>>);

impl SharedObjectListener for Changes {
    fn changed(&self, name: &str, field: &str, value: &Value) {
        self.0
            .lock()
            .unwrap()
            .push((name.to_string(), field.to_string(), value.clone()));
    }
}

#[test]
fn scenario_shared_counter_through_a_hub() {
    let server = Arc::new(Server::new());
    let hub_registry = registry();
    let hub_shared = SharedObjectManager::new(hub_registry.clone());
    let hub_changes = Arc::new(Changes::default());
    hub_shared.add_listener(hub_changes.clone());
    hub_shared.enable(server.clone());

    let mut clients = Vec::new();
    for peer in 1..=2u16 {
        let (hub_side, client_side) = ChannelTransport::pair();
        server.add_connection(
            Connection::builder(hub_registry.clone())
                .peer_id(100)
                .build(hub_side)
                .unwrap(),
        );
        let client_registry = registry();
        let connection = Connection::builder(client_registry.clone())
            .peer_id(peer)
            .build(client_side)
            .unwrap();
        let shared = SharedObjectManager::new(client_registry);
        let changes = Arc::new(Changes::default());
        shared.add_listener(changes.clone());
        shared.enable(connection.clone());
        clients.push((connection, shared, changes));
    }
    let pump_all = || {
        for _ in 0..4 {
            server.update();
            for (connection, _, _) in &clients {
                connection.update();
            }
        }
    };
    pump_all();
    assert!(clients.iter().all(|(connection, _, _)| connection.is_open()));

    hub_shared.share("Counter", &Counter { value: 0 }).unwrap();
    pump_all();
    for (_, shared, _) in &clients {
        assert_eq!(shared.get_object::<Counter>("Counter").unwrap(), Some(Counter { value: 0 }));
    }

    clients[0].1.handle("Counter").unwrap().set("value", 5).unwrap();
    pump_all();

    let expected = vec![("Counter".to_string(), "value".to_string(), Value::I32(5))];
    assert_eq!(*hub_changes.0.lock().unwrap(), expected);
    for (_, shared, changes) in &clients {
        assert_eq!(*changes.0.lock().unwrap(), expected);
        assert_eq!(shared.get_object::<Counter>("Counter").unwrap().unwrap().value, 5);
    }
    assert_eq!(hub_shared.get_object::<Counter>("Counter").unwrap().unwrap().value, 5);
}

struct RemoteAction {
    message: Mutex<String>,
}

impl RemoteAction {
    fn capability() -> RemoteCapability {
        RemoteCapability::new("RemoteAction")
            .method("getMessage", vec![], FieldType::Str)
            .method("setMessage", vec![FieldType::Str], FieldType::Any)
    }
}

impl RemoteObject for RemoteAction {
    fn capability(&self) -> RemoteCapability {
        Self::capability()
    }

    fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        match method {
            "getMessage" => Ok(Value::from(self.message.lock().unwrap().clone())),
            "setMessage" => {
                let text = args.into_iter().next().unwrap_or_default().into_string()?;
                *self.message.lock().unwrap() = text;
                Ok(Value::Null)
            }
            other => Err(ProtocolError::Invocation(format!("no method {other}"))),
        }
    }
}

/// Caller-side stub for `RemoteAction`
struct RemoteActionProxy(RemoteProxy);

impl RemoteActionProxy {
    fn get_message(&self) -> Result<String> {
        self.0.invoke("getMessage", vec![])?.into_string()
    }

    fn set_message(&self, message: &str) -> Result<()> {
        self.0.invoke("setMessage", vec![message.into()]).map(|_| ())
    }
}

#[test]
fn scenario_remote_action_read_after_write() {
    let (host, caller) = linked();
    let host_remote = RemoteObjectManager::default();
    host_remote
        .register(
            Arc::new(RemoteAction {
                message: Mutex::new("Initial Message".to_string()),
            }),
            host.as_ref(),
        )
        .unwrap();
    let _host_driver = Driver::spawn(host.clone(), Duration::from_millis(1)).unwrap();
    let _caller_driver = Driver::spawn(caller.clone(), Duration::from_millis(1)).unwrap();

    let caller_remote = RemoteObjectManager::default();
    let proxy = caller_remote
        .create_proxy("RemoteAction", &caller, Duration::from_secs(5))
        .unwrap()
        .expect("lookup answered");
    assert_eq!(proxy.capability(), &RemoteAction::capability());
    let action = RemoteActionProxy(proxy);

    assert_eq!(action.get_message().unwrap(), "Initial Message");
    action.set_message("Testing").unwrap();
    assert_eq!(action.get_message().unwrap(), "Testing");

    assert!(matches!(
        caller_remote.create_proxy("Missing", &caller, Duration::from_secs(5)),
        Err(ProtocolError::NotRegistered(name)) if name == "Missing"
    ));

    caller.close_now();
    assert!(matches!(action.get_message(), Err(ProtocolError::Disconnected)));
}

#[test]
fn scenario_queue_of_ten_frees_a_slot_on_ack() {
    let (ta, tb) = ChannelTransport::pair();
    let config = ConnectionConfig {
        queue_capacity: 10,
        ..ConnectionConfig::default()
    };
    let a = Connection::builder(registry())
        .connection_config(config)
        .build(ta)
        .unwrap();
    let b = Connection::builder(registry()).build(tb).unwrap();
    pump(&[&a, &b]);

    let note = Note { text: "queued".into() };
    for _ in 0..10 {
        a.send(&note, SendOptions::certified()).unwrap();
    }
    assert!(matches!(
        a.send(&note, SendOptions::certified()),
        Err(ProtocolError::QueueFull { capacity: 10 })
    ));

    a.update();
    b.update();
    a.update();
    assert!(a.pending() < 10);
    assert!(a.send(&note, SendOptions::certified()).is_ok());
}

#[test]
fn scenario_ping_measures_simulated_fifty_millis() {
    let (a, b) = linked();
    pump(&[&a, &b]);

    let clock = Arc::new(ManualClock::new(1_000_000));
    let pinger = PingService::with_clock(clock.clone());
    PingService::new().enable(b.as_ref());

    let probe = pinger.ping(&a).unwrap();
    a.update();
    b.update();
    b.update();
    assert_eq!(probe.rtt(), None);

    clock.advance(50);
    a.update();
    let rtt = probe.rtt().expect("pong processed");
    assert_eq!(rtt, Duration::from_millis(50));
}

#[test]
fn scenario_ping_and_wait_with_drivers() {
    let (a, b) = linked();
    PingService::new().enable(b.as_ref());
    let _a_driver = Driver::spawn(a.clone(), Duration::from_millis(1)).unwrap();
    let _b_driver = Driver::spawn(b.clone(), Duration::from_millis(1)).unwrap();

    let rtt = PingService::new()
        .ping_and_wait(&a, Duration::from_secs(5))
        .unwrap()
        .expect("echo within timeout");
    assert!(rtt < Duration::from_secs(5));
}
