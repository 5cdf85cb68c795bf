//! Connections over real TCP sockets

#![allow(clippy::expect_used, clippy::unwrap_used)]

use peerlink::connection::{
    Connection, ConnectionListener, DisconnectReason, Envelope, SendOptions,
};
use peerlink::core::serialization::TypeRegistry;
use peerlink::error::Result;
use peerlink::field_serializable;
use peerlink::translator::{EncryptionFactory, KeyPair, TranslatorFactory};
use peerlink::transport::tcp;
use peerlink::utils::timeout::with_timeout_error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default, Clone, PartialEq)]
struct Note {
    text: String,
}

field_serializable!(Note, "tcp.Note", { text: Str });

#[derive(Default)]
struct Inbox {
    notes: Mutex<Vec<String>>,
    reason: Mutex<Option<DisconnectReason>>,
}

impl ConnectionListener for Inbox {
    fn message_received(&self, _connection: &Connection, message: &Envelope) {
        if let Some(note) = message.downcast_ref::<Note>() {
            self.notes.lock().unwrap().push(note.text.clone());
        }
    }

    fn disconnected(&self, _connection: &Connection, reason: &DisconnectReason) {
        *self.reason.lock().unwrap() = Some(reason.clone());
    }
}

fn registry() -> Arc<TypeRegistry> {
    let registry = TypeRegistry::new();
    registry.register_fields::<Note>().unwrap();
    Arc::new(registry)
}

/// Update both sides until `done` holds
async fn drive_until(a: &Connection, b: &Connection, done: impl Fn() -> bool) -> Result<()> {
    with_timeout_error(
        async {
            while !done() {
                a.update();
                b.update();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            Ok(())
        },
        Duration::from_secs(5),
    )
    .await
}

async fn tcp_pair(
    client_translators: Vec<Arc<dyn TranslatorFactory>>,
    server_translators: Vec<Arc<dyn TranslatorFactory>>,
) -> (Arc<Connection>, Arc<Connection>, Arc<Inbox>) {
    let acceptor = tcp::listen("127.0.0.1:0").await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let (client_side, server_side) = tokio::join!(tcp::connect(addr), acceptor.accept());

    let inbox = Arc::new(Inbox::default());
    let client = Connection::builder(registry())
        .translators(client_translators)
        .build(client_side.unwrap())
        .unwrap();
    let server = Connection::builder(registry())
        .translators(server_translators)
        .listener(inbox.clone())
        .build(server_side.unwrap())
        .unwrap();
    (client, server, inbox)
}

#[tokio::test]
async fn test_certified_message_over_tcp() {
    let (client, server, inbox) = tcp_pair(Vec::new(), Vec::new()).await;
    client
        .send(&Note { text: "over the wire".into() }, SendOptions::certified())
        .unwrap();

    drive_until(&client, &server, || client.pending() == 0 && !inbox.notes.lock().unwrap().is_empty())
        .await
        .unwrap();
    assert_eq!(*inbox.notes.lock().unwrap(), vec!["over the wire".to_string()]);
    assert_eq!(client.metrics().messages_certified, 1);
}

#[tokio::test]
async fn test_encrypted_tcp_link() {
    let client_keys = Arc::new(KeyPair::generate());
    let server_keys = Arc::new(KeyPair::generate());
    let client_factory: Arc<dyn TranslatorFactory> = Arc::new(
        EncryptionFactory::new(1024, client_keys.clone(), server_keys.public()).unwrap(),
    );
    let server_factory: Arc<dyn TranslatorFactory> =
        Arc::new(EncryptionFactory::new(1024, server_keys, client_keys.public()).unwrap());
    let (client, server, inbox) = tcp_pair(vec![client_factory], vec![server_factory]).await;

    let long = "x".repeat(1000);
    client
        .send(&Note { text: long.clone() }, SendOptions::certified())
        .unwrap();
    drive_until(&client, &server, || !inbox.notes.lock().unwrap().is_empty())
        .await
        .unwrap();
    assert_eq!(inbox.notes.lock().unwrap()[0], long);
}

#[tokio::test]
async fn test_close_reaches_peer() {
    let (client, server, inbox) = tcp_pair(Vec::new(), Vec::new()).await;
    drive_until(&client, &server, || client.is_open() && server.is_open())
        .await
        .unwrap();

    client.close();
    drive_until(&client, &server, || server.is_closed()).await.unwrap();
    assert!(client.is_closed());
    assert_eq!(
        *inbox.reason.lock().unwrap(),
        Some(DisconnectReason::RemoteClose)
    );
}
