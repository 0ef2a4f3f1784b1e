//! Shared test harness: a scripted bus peer over the loopback transport.
//!
//! `FakeBus` owns the server end of a [`MemoryTransport`] pair and speaks
//! just enough of the protocol to drive the client: it accepts the auth
//! handshake, parses client frames with the crate's own framing, and sends
//! scripted replies and signals with its own serial counter.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dbus_client_core::connection::{AuthMethod, BusConnection};
use dbus_client_core::interface::{registry, MethodArg};
use dbus_client_core::message::{required_length, Message};
use dbus_client_core::transport::{MemoryTransport, Transport};
use dbus_client_core::Value;

pub const ECHO_INTERFACE: &str = "org.example.Echo";
pub const ECHO_PATH: &str = "/org/example/echo";
pub const UNIQUE_NAME: &str = ":1.42";

/// Register the interfaces the tests exercise. Idempotent: re-registration
/// returns the existing sealed declaration.
pub fn register_test_interfaces() {
    registry()
        .builder(ECHO_INTERFACE)
        .add_method("Echo", [MethodArg::input("s"), MethodArg::output("s")])
        .add_method("Poke", [])
        .add_signal("Pulsed", ["u"])
        .add_property("Level", "i")
        .end()
        .expect("test interface declaration is well-formed");
}

/// The bus side of a loopback connection.
pub struct FakeBus {
    transport: MemoryTransport,
    buffer: tokio::sync::Mutex<Vec<u8>>,
    serial: AtomicU32,
}

impl FakeBus {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            buffer: tokio::sync::Mutex::new(Vec::new()),
            serial: AtomicU32::new(1),
        }
    }

    async fn next_byte(&self) -> u8 {
        let chunk = self.transport.recv(1, None).await.expect("bus recv failed");
        assert_eq!(chunk.len(), 1);
        chunk[0]
    }

    /// Read one `\r\n`-terminated auth line, without the terminator.
    pub async fn read_line(&self) -> String {
        let mut line = Vec::new();
        loop {
            line.push(self.next_byte().await);
            if line.ends_with(b"\r\n") {
                line.truncate(line.len() - 2);
                return String::from_utf8(line).expect("auth line is ASCII");
            }
        }
    }

    pub async fn accept_pre_authorized(&self) {
        assert_eq!(self.read_line().await, "BEGIN");
    }

    pub async fn accept_anonymous(&self) {
        let auth = self.read_line().await;
        assert!(
            auth.starts_with("\0AUTH ANONYMOUS"),
            "unexpected auth line {auth:?}"
        );
        self.transport.send_buf(b"OK 0123deadbeef\r\n").await.unwrap();
        assert_eq!(self.read_line().await, "BEGIN");
    }

    /// Read exactly one client frame off the stream, buffering leftovers.
    pub async fn read_message(&self) -> Message {
        let mut buffer = self.buffer.lock().await;
        loop {
            if let Some(total) = required_length(&buffer).expect("client sent a valid preamble") {
                if buffer.len() >= total {
                    let frame: Vec<u8> = buffer.drain(..total).collect();
                    return Message::from_bytes(&frame).expect("client sent a valid frame");
                }
            }
            let chunk = self.transport.recv(4096, None).await.expect("bus recv failed");
            buffer.extend_from_slice(&chunk);
        }
    }

    /// Read a frame and assert its member name.
    pub async fn expect_call(&self, member: &str) -> Message {
        let msg = self.read_message().await;
        assert_eq!(msg.member.as_deref(), Some(member), "unexpected call {msg:?}");
        msg
    }

    /// Push raw bytes at the client, bypassing framing.
    pub async fn send_raw(&self, bytes: &[u8]) {
        self.transport.send_buf(bytes).await.expect("bus send failed");
    }

    pub async fn send_message(&self, msg: Message) -> u32 {
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        self.transport
            .send_buf(&msg.to_bytes(serial).expect("scripted message marshals"))
            .await
            .expect("bus send failed");
        serial
    }

    pub async fn reply_return(&self, call: &Message, signature: &str, args: &[Value]) {
        let reply = Message::method_return(call)
            .with_body(signature, args)
            .expect("scripted reply marshals");
        self.send_message(reply).await;
    }

    pub async fn reply_error(&self, call: &Message, error_name: &str, text: &str) {
        let reply = Message::error_reply(call, error_name)
            .with_body("s", &[Value::Str(text.to_string())])
            .expect("scripted error marshals");
        self.send_message(reply).await;
    }

    pub async fn answer_hello(&self) {
        let call = self.expect_call("Hello").await;
        self.reply_return(&call, "s", &[Value::Str(UNIQUE_NAME.to_string())])
            .await;
    }

    /// Handle one AddMatch call and return the rule it carried.
    pub async fn answer_add_match(&self) -> String {
        let call = self.expect_call("AddMatch").await;
        let rule = call.args().unwrap()[0]
            .as_str()
            .expect("AddMatch takes a string rule")
            .to_string();
        self.reply_return(&call, "", &[]).await;
        rule
    }

    /// Handle one RemoveMatch call and return the rule it carried.
    pub async fn answer_remove_match(&self) -> String {
        let call = self.expect_call("RemoveMatch").await;
        let rule = call.args().unwrap()[0]
            .as_str()
            .expect("RemoveMatch takes a string rule")
            .to_string();
        self.reply_return(&call, "", &[]).await;
        rule
    }

    /// Emit a signal toward the client.
    pub async fn emit(&self, path: &str, interface: &str, member: &str, signature: &str, args: &[Value]) {
        let msg = Message::signal(path, interface, member)
            .with_body(signature, args)
            .expect("scripted signal marshals");
        self.send_message(msg).await;
    }
}

/// A connected (client, fake bus) pair with the handshake and Hello done.
pub async fn connected_pair() -> (BusConnection, FakeBus) {
    register_test_interfaces();
    let (client_end, bus_end) = MemoryTransport::pair();
    let bus = FakeBus::new(bus_end);
    let conn = BusConnection::new();
    let (connect_result, ()) = tokio::join!(
        conn.using_transport(Arc::new(client_end), AuthMethod::PreAuthorized),
        async {
            bus.accept_pre_authorized().await;
            bus.answer_hello().await;
        }
    );
    connect_result.expect("handshake against the fake bus succeeds");
    (conn, bus)
}
