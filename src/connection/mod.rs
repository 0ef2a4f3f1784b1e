//! Bus connection engine
//!
//! Owns one transport at a time and turns it into a D-Bus peer: performs the
//! authentication handshake, assigns serial numbers, correlates replies to
//! pending invocations, demultiplexes signals to subscribers, and proxies
//! property access through `org.freedesktop.DBus.Properties`.
//!
//! ## Lifecycle
//!
//! `Disconnected -> Authenticating -> Connected -> Disconnected`. A fresh
//! [`BusConnection::using_transport`] call tears down any prior transport,
//! authenticates, says `Hello()` to obtain the unique bus name and spawns the
//! receive loop. Transport loss rejects every pending invocation with
//! `Disconnected` and flips the connected watch; the loop is only restarted
//! by another `using_transport` call, never automatically.
//!
//! ## Invocation timeout
//!
//! One shared 5.5 s timer guards the whole pending table. It starts when the
//! table goes from empty to non-empty and is reset when the table empties;
//! if it fires with any invocation still outstanding the connection is
//! forcibly closed — a single slow peer is presumed dead, not just one call.
//!
//! ## Signal subscriptions
//!
//! Callers hold a [`SignalHandle`]; the first observer of a
//! (path, interface, member) tuple issues `AddMatch`, dropping the last one
//! issues `RemoveMatch`. Subscriptions survive transport swaps — match rules
//! do not, so every observed signal re-issues `AddMatch` on reconnect.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dbus_client_core::connection::{AuthMethod, BusConnection};
//! use dbus_client_core::transport::Transport;
//!
//! # async fn example(transport: Arc<dyn Transport>) -> dbus_client_core::error::Result<()> {
//! let bus = BusConnection::new();
//! bus.using_transport(transport, AuthMethod::Anonymous).await?;
//! let names = bus.list_names().await?;
//! println!("{} names on the bus", names.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::codec::{Value, Variant};
use crate::error::{from_error_name, DBusError, Result};
use crate::interface::registry;
use crate::message::{
    self, Message, MessageType, BUS_INTERFACE, BUS_NAME, BUS_PATH, ERROR_NOT_SUPPORTED,
    INTROSPECTABLE_INTERFACE, PEER_INTERFACE, PROPERTIES_INTERFACE,
};
use crate::transport::Transport;

/// Connection-wide invocation timeout. Shared by every outstanding call.
pub const INVOCATION_TIMEOUT: Duration = Duration::from_millis(5500);

/// Timeout for each read during the authentication line exchange.
const AUTH_TIMEOUT: Duration = Duration::from_millis(5500);

/// Answer to `Introspectable.Introspect`; this engine hosts no objects.
const INTROSPECT_STUB: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node/>\n";

/// How the stream is authenticated before binary framing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// `\0AUTH ANONYMOUS <hex>` awaiting an `OK` line, then `BEGIN`
    Anonymous,
    /// Bare `BEGIN` for transports authorized out of band
    PreAuthorized,
}

/// One delivered signal occurrence.
#[derive(Debug)]
pub struct SignalEvent {
    /// Object path the signal was emitted from
    pub path: String,
    /// Decoded body, per the message's own signature
    pub args: Vec<Value>,
}

/// A property change delivered by [`PropertiesStream`].
#[derive(Debug)]
pub struct PropertyChange {
    pub interface: String,
    /// Changed properties, converted to their native registered types when
    /// the interface declares them
    pub changed: Vec<(String, Value)>,
    /// Properties whose value was invalidated without a new value
    pub invalidated: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SignalKey {
    path: String,
    interface: String,
    member: String,
}

struct Subscription {
    match_rule: String,
    observers: Vec<(u64, mpsc::UnboundedSender<SignalEvent>)>,
}

struct Inner {
    serial: AtomicU32,
    observer_ids: AtomicU64,
    /// Invalidates the shared invocation timer when the pending table empties
    timeout_generation: AtomicU64,
    /// Invalidates a stale receive loop after a transport swap
    loop_generation: AtomicU64,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Message>>>>,
    subscriptions: Mutex<HashMap<SignalKey, Subscription>>,
    unique_name: Mutex<Option<String>>,
    connected_tx: watch::Sender<bool>,
}

/// A client connection to a D-Bus message bus.
///
/// Cheap to clone via the `Arc` inside; all clones share one transport,
/// serial counter and pending table.
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl BusConnection {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                serial: AtomicU32::new(1),
                observer_ids: AtomicU64::new(1),
                timeout_generation: AtomicU64::new(0),
                loop_generation: AtomicU64::new(0),
                transport: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                unique_name: Mutex::new(None),
                connected_tx,
            }),
        }
    }

    /// Install a transport: dispose any prior one, authenticate, say Hello,
    /// start the receive loop and re-issue match rules for every observed
    /// signal.
    pub async fn using_transport(
        &self,
        transport: Arc<dyn Transport>,
        auth: AuthMethod,
    ) -> Result<()> {
        self.inner.teardown(None, "transport replaced").await;
        let generation = self.inner.loop_generation.fetch_add(1, Ordering::SeqCst) + 1;

        transport.connect().await?;
        if let Err(err) = authenticate(transport.as_ref(), auth).await {
            transport.close().await.ok();
            return Err(err);
        }

        *self
            .inner
            .transport
            .lock()
            .expect("transport lock poisoned") = Some(transport.clone());
        self.inner.connected_tx.send_replace(true);

        let loop_inner = self.inner.clone();
        let loop_transport = transport;
        tokio::spawn(async move {
            mainloop(loop_inner, loop_transport, generation).await;
        });

        let mut reply = self
            .invoke(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "Hello", &[])
            .await?;
        let name = match reply.pop() {
            Some(Value::Str(name)) => name,
            other => {
                return Err(DBusError::invalid_packet(format!(
                    "Hello returned {other:?} instead of a bus name"
                )))
            }
        };
        info!(unique_name = %name, "connected to message bus");
        *self
            .inner
            .unique_name
            .lock()
            .expect("unique name lock poisoned") = Some(name);

        self.resubscribe_all().await;
        Ok(())
    }

    /// Close the connection. Every pending invocation rejects with
    /// `Disconnected`; subscriptions are kept for the next transport.
    pub async fn disconnect(&self) {
        self.inner.teardown(None, "closed by caller").await;
    }

    /// The unique bus name assigned by Hello, while connected.
    pub fn unique_name(&self) -> Option<String> {
        self.inner
            .unique_name
            .lock()
            .expect("unique name lock poisoned")
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Watch connected-state transitions (reconnect notifications).
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Call a registered method and return its decoded OUT arguments.
    ///
    /// The IN arguments are marshalled against the registry-derived input
    /// signature before anything is sent; shape mismatches surface
    /// synchronously. The reply body signature must equal the declared
    /// output signature.
    pub async fn invoke(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value],
    ) -> Result<Vec<Value>> {
        let iface = registry().lookup(interface)?;
        let method = iface.method(member)?.clone();
        let mut msg = Message::method_call(path, interface, member)
            .with_body(&method.in_signature, args)?;
        if let Some(destination) = destination {
            msg = msg.with_destination(destination);
        }
        let reply = self.inner.call(msg).await?;
        if reply.signature != method.out_signature {
            return Err(DBusError::invalid_signature(format!(
                "{interface}.{member} replied {:?}, declared {:?}",
                reply.signature, method.out_signature
            )));
        }
        reply.args()
    }

    /// Fire-and-forget method call; never populates the pending table.
    pub async fn invoke_no_reply(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value],
    ) -> Result<()> {
        let iface = registry().lookup(interface)?;
        let method = iface.method(member)?.clone();
        let mut msg = Message::method_call(path, interface, member)
            .with_body(&method.in_signature, args)?
            .with_no_reply();
        if let Some(destination) = destination {
            msg = msg.with_destination(destination);
        }
        self.inner.send_message(msg).await.map(|_| ())
    }

    /// Emit a registered signal from `path`.
    pub async fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        member: &str,
        args: &[Value],
    ) -> Result<()> {
        let iface = registry().lookup(interface)?;
        let signal = iface.signal(member)?.clone();
        let msg = Message::signal(path, interface, member).with_body(&signal.signature, args)?;
        self.inner.send_message(msg).await.map(|_| ())
    }

    /// Observe a registered signal.
    ///
    /// `path` may end in `*` to match a whole object-path namespace. The
    /// first observer of a tuple issues `AddMatch`; dropping the returned
    /// handle decrements the count and the last drop issues `RemoveMatch`.
    /// Subscribing while disconnected is allowed — the match rule is issued
    /// on the next `using_transport`.
    pub async fn subscribe(
        &self,
        path: &str,
        interface: &str,
        member: &str,
    ) -> Result<SignalHandle> {
        let iface = registry().lookup(interface)?;
        iface.signal(member)?;

        let key = SignalKey {
            path: path.to_string(),
            interface: interface.to_string(),
            member: member.to_string(),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.observer_ids.fetch_add(1, Ordering::SeqCst);

        let (first_observer, rule) = {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            match subs.get_mut(&key) {
                Some(sub) => {
                    sub.observers.push((id, tx));
                    (false, sub.match_rule.clone())
                }
                None => {
                    let rule = match_rule_for(&key);
                    subs.insert(
                        key.clone(),
                        Subscription {
                            match_rule: rule.clone(),
                            observers: vec![(id, tx)],
                        },
                    );
                    (true, rule)
                }
            }
        };

        if first_observer && self.is_connected() {
            if let Err(err) = self.add_match(&rule).await {
                // roll the registration back so a retry starts clean
                let mut subs = self
                    .inner
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned");
                if let Some(sub) = subs.get_mut(&key) {
                    sub.observers.retain(|(observer, _)| *observer != id);
                    if sub.observers.is_empty() {
                        subs.remove(&key);
                    }
                }
                return Err(err);
            }
            debug!(rule = %rule, "issued AddMatch");
        }

        Ok(SignalHandle {
            key,
            id,
            rx,
            inner: self.inner.clone(),
        })
    }

    /// `Properties.Get`, converted to the native registered type when the
    /// property is declared locally; unknown properties pass the raw variant
    /// through.
    pub async fn get_property(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<Value> {
        let mut out = self
            .invoke(
                destination,
                path,
                PROPERTIES_INTERFACE,
                "Get",
                &[
                    Value::Str(interface.to_string()),
                    Value::Str(name.to_string()),
                ],
            )
            .await?;
        match out.pop() {
            Some(Value::Variant(variant)) => Ok(variant_to_native(interface, name, *variant)),
            other => Err(DBusError::invalid_packet(format!(
                "Properties.Get returned {other:?} instead of a variant"
            ))),
        }
    }

    /// `Properties.Set`. Plain values are wrapped in a variant of the
    /// property's registered signature; pass a [`Value::Variant`] explicitly
    /// for properties unknown to the registry.
    pub async fn set_property(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let variant = match value {
            Value::Variant(variant) => *variant,
            plain => {
                let signature = registry()
                    .find(interface)
                    .and_then(|iface| iface.find_property(name).map(|p| p.signature.clone()))
                    .ok_or_else(|| {
                        DBusError::UnknownProperty(format!(
                            "{interface}.{name} is not registered; pass a variant explicitly"
                        ))
                    })?;
                Variant::new(signature, plain)
            }
        };
        self.invoke(
            destination,
            path,
            PROPERTIES_INTERFACE,
            "Set",
            &[
                Value::Str(interface.to_string()),
                Value::Str(name.to_string()),
                Value::Variant(Box::new(variant)),
            ],
        )
        .await?;
        Ok(())
    }

    /// `Properties.GetAll`, with the same conversion rules as
    /// [`get_property`](Self::get_property).
    pub async fn get_all_properties(
        &self,
        destination: Option<&str>,
        path: &str,
        interface: &str,
    ) -> Result<Vec<(String, Value)>> {
        let mut out = self
            .invoke(
                destination,
                path,
                PROPERTIES_INTERFACE,
                "GetAll",
                &[Value::Str(interface.to_string())],
            )
            .await?;
        let Some(Value::Dict(entries)) = out.pop() else {
            return Err(DBusError::invalid_packet(
                "Properties.GetAll did not return a dictionary".to_string(),
            ));
        };
        let mut properties = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let (Some(name), Value::Variant(variant)) = (key.as_str().map(str::to_string), value)
            else {
                return Err(DBusError::invalid_packet(
                    "malformed Properties.GetAll entry".to_string(),
                ));
            };
            properties.push((name.clone(), variant_to_native(interface, &name, *variant)));
        }
        Ok(properties)
    }

    /// Stream of `PropertiesChanged` occurrences at `path`, filtered down to
    /// `interface` and converted like property reads.
    pub async fn properties_changed(
        &self,
        path: &str,
        interface: &str,
    ) -> Result<PropertiesStream> {
        let handle = self
            .subscribe(path, PROPERTIES_INTERFACE, "PropertiesChanged")
            .await?;
        Ok(PropertiesStream {
            handle,
            interface: interface.to_string(),
        })
    }

    // Standard bus proxies

    pub async fn add_match(&self, rule: &str) -> Result<()> {
        self.invoke(
            Some(BUS_NAME),
            BUS_PATH,
            BUS_INTERFACE,
            "AddMatch",
            &[Value::Str(rule.to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn remove_match(&self, rule: &str) -> Result<()> {
        self.invoke(
            Some(BUS_NAME),
            BUS_PATH,
            BUS_INTERFACE,
            "RemoveMatch",
            &[Value::Str(rule.to_string())],
        )
        .await
        .map(|_| ())
    }

    pub async fn request_name(&self, name: &str, flags: u32) -> Result<u32> {
        let mut out = self
            .invoke(
                Some(BUS_NAME),
                BUS_PATH,
                BUS_INTERFACE,
                "RequestName",
                &[Value::Str(name.to_string()), Value::F64(flags as f64)],
            )
            .await?;
        out.pop()
            .and_then(|v| v.as_f64())
            .map(|v| v as u32)
            .ok_or_else(|| DBusError::invalid_packet("RequestName reply malformed".to_string()))
    }

    pub async fn release_name(&self, name: &str) -> Result<u32> {
        let mut out = self
            .invoke(
                Some(BUS_NAME),
                BUS_PATH,
                BUS_INTERFACE,
                "ReleaseName",
                &[Value::Str(name.to_string())],
            )
            .await?;
        out.pop()
            .and_then(|v| v.as_f64())
            .map(|v| v as u32)
            .ok_or_else(|| DBusError::invalid_packet("ReleaseName reply malformed".to_string()))
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        let mut out = self
            .invoke(Some(BUS_NAME), BUS_PATH, BUS_INTERFACE, "ListNames", &[])
            .await?;
        let Some(Value::Array(values)) = out.pop() else {
            return Err(DBusError::invalid_packet(
                "ListNames reply malformed".to_string(),
            ));
        };
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    async fn resubscribe_all(&self) {
        let rules: Vec<String> = {
            let subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            subs.values().map(|sub| sub.match_rule.clone()).collect()
        };
        for rule in rules {
            match self.add_match(&rule).await {
                Ok(()) => debug!(rule = %rule, "re-issued AddMatch after reconnect"),
                Err(err) => warn!(rule = %rule, error = %err, "AddMatch failed on reconnect"),
            }
        }
    }
}

impl Default for BusConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for BusConnection {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Inner {
    fn current_transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .clone()
            .ok_or(DBusError::NoConnection)
    }

    /// Assign a serial and put the frame on the wire.
    async fn send_message(&self, msg: Message) -> Result<u32> {
        let transport = self.current_transport()?;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let bytes = msg.to_bytes(serial)?;
        transport.send_buf(&bytes).await?;
        trace!(serial, message_type = ?msg.message_type, "sent message");
        Ok(serial)
    }

    /// Send a call expecting a reply and await it.
    async fn call(self: &Arc<Self>, msg: Message) -> Result<Message> {
        let transport = self.current_transport()?;
        let serial = self.serial.fetch_add(1, Ordering::SeqCst);
        let bytes = msg.to_bytes(serial)?;

        let (tx, rx) = oneshot::channel();
        let first_outstanding = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let first = pending.is_empty();
            pending.insert(serial, tx);
            first
        };
        if first_outstanding {
            self.spawn_invocation_timer();
        }

        if let Err(err) = transport.send_buf(&bytes).await {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(&serial);
            if pending.is_empty() {
                self.timeout_generation.fetch_add(1, Ordering::SeqCst);
            }
            return Err(err);
        }

        let reply = rx
            .await
            .map_err(|_| DBusError::disconnected("connection closed while awaiting reply"))??;

        if reply.message_type == MessageType::Error {
            let name = reply
                .reply
                .as_ref()
                .and_then(|r| r.error_name.clone())
                .unwrap_or_else(|| "org.freedesktop.DBus.Error.Failed".to_string());
            let text = reply
                .args()
                .ok()
                .and_then(|mut args| args.pop())
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            return Err(from_error_name(&name, &text));
        }
        Ok(reply)
    }

    /// One timer guards the whole pending table: armed on the empty to
    /// non-empty transition, invalidated by generation bump when the table
    /// empties. Firing closes the connection, not just one call.
    fn spawn_invocation_timer(self: &Arc<Self>) {
        let generation = self.timeout_generation.load(Ordering::SeqCst);
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INVOCATION_TIMEOUT).await;
            let still_armed = inner.timeout_generation.load(Ordering::SeqCst) == generation;
            let outstanding = !inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .is_empty();
            if still_armed && outstanding {
                warn!("invocation timed out, closing connection");
                inner.teardown(None, "invocation timeout").await;
            }
        });
    }

    /// Drop the transport (when `expected_generation` still matches, if
    /// given), reject every pending invocation and notify the connected
    /// watch. Subscriptions stay registered for the next transport.
    async fn teardown(self: &Arc<Self>, expected_generation: Option<u64>, reason: &str) {
        let transport = {
            let mut slot = self.transport.lock().expect("transport lock poisoned");
            if let Some(generation) = expected_generation {
                if self.loop_generation.load(Ordering::SeqCst) != generation {
                    return; // a newer transport took over already
                }
            }
            slot.take()
        };
        self.connected_tx.send_replace(false);
        *self.unique_name.lock().expect("unique name lock poisoned") = None;

        let rejected: Vec<_> = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            self.timeout_generation.fetch_add(1, Ordering::SeqCst);
            pending.drain().collect()
        };
        let had_pending = !rejected.is_empty();
        for (_, tx) in rejected {
            let _ = tx.send(Err(DBusError::disconnected(reason)));
        }

        if let Some(transport) = transport {
            let _ = transport.close().await;
            info!(reason, rejected_calls = had_pending, "bus connection torn down");
        }
    }
}

/// Handle for one signal observer. Dropping it unsubscribes; the last drop
/// for a tuple issues `RemoveMatch` in the background.
pub struct SignalHandle {
    key: SignalKey,
    id: u64,
    rx: mpsc::UnboundedReceiver<SignalEvent>,
    inner: Arc<Inner>,
}

impl SignalHandle {
    /// Next signal occurrence; `None` once the connection drops the stream.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.rx.recv().await
    }
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        let last_observer = {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .expect("subscriptions lock poisoned");
            match subs.get_mut(&self.key) {
                Some(sub) => {
                    sub.observers.retain(|(id, _)| *id != self.id);
                    if sub.observers.is_empty() {
                        let rule = sub.match_rule.clone();
                        subs.remove(&self.key);
                        Some(rule)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(rule) = last_observer {
            if !*self.inner.connected_tx.borrow() {
                return;
            }
            // drop is synchronous; the bus round-trip happens in the background
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    let connection = BusConnection { inner };
                    match connection.remove_match(&rule).await {
                        Ok(()) => debug!(rule = %rule, "issued RemoveMatch"),
                        Err(err) => warn!(rule = %rule, error = %err, "RemoveMatch failed"),
                    }
                });
            }
        }
    }
}

/// Filtered, converted view of `PropertiesChanged` for one interface.
pub struct PropertiesStream {
    handle: SignalHandle,
    interface: String,
}

impl PropertiesStream {
    /// Next change for the watched interface; occurrences for other
    /// interfaces at the same path are skipped.
    pub async fn recv(&mut self) -> Option<PropertyChange> {
        while let Some(event) = self.handle.recv().await {
            let mut args = event.args.into_iter();
            let (Some(Value::Str(interface)), Some(Value::Dict(changed)), invalidated) =
                (args.next(), args.next(), args.next())
            else {
                warn!("malformed PropertiesChanged body, skipping");
                continue;
            };
            if interface != self.interface {
                trace!(interface = %interface, "PropertiesChanged for another interface");
                continue;
            }
            let changed = changed
                .into_iter()
                .filter_map(|(key, value)| {
                    let name = key.as_str()?.to_string();
                    let value = match value {
                        Value::Variant(variant) => {
                            variant_to_native(&interface, &name, *variant)
                        }
                        other => other,
                    };
                    Some((name, value))
                })
                .collect();
            let invalidated = match invalidated {
                Some(Value::Array(names)) => names
                    .into_iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect(),
                _ => Vec::new(),
            };
            return Some(PropertyChange {
                interface,
                changed,
                invalidated,
            });
        }
        None
    }
}

/// Unwrap a variant to the property's native registered type.
///
/// Unknown interfaces/properties pass the variant through unchanged; a
/// signature mismatch against the declaration is surfaced as a diagnostic
/// but still passed through raw rather than dropped.
fn variant_to_native(interface: &str, name: &str, variant: Variant) -> Value {
    match registry()
        .find(interface)
        .and_then(|iface| iface.find_property(name).map(|p| p.signature.clone()))
    {
        Some(declared) if declared == variant.signature => variant.value,
        Some(declared) => {
            warn!(
                interface,
                property = name,
                declared = %declared,
                received = %variant.signature,
                "property signature mismatch, passing raw variant through"
            );
            Value::Variant(Box::new(variant))
        }
        None => {
            debug!(
                interface,
                property = name,
                "property not registered, passing raw variant through"
            );
            Value::Variant(Box::new(variant))
        }
    }
}

/// Derive the bus match rule for a subscription tuple. A registered path
/// ending in `*` becomes a path-namespace match.
fn match_rule_for(key: &SignalKey) -> String {
    if let Some(prefix) = key.path.strip_suffix('*') {
        let namespace = prefix.trim_end_matches('/');
        let namespace = if namespace.is_empty() { "/" } else { namespace };
        format!(
            "type='signal',path_namespace='{}',interface='{}',member='{}'",
            namespace, key.interface, key.member
        )
    } else {
        format!(
            "type='signal',path='{}',interface='{}',member='{}'",
            key.path, key.interface, key.member
        )
    }
}

/// Namespace matches stop at whole path elements: `/a/b*` covers `/a/b`
/// and `/a/b/c` but not the sibling `/a/bc`.
fn path_matches(registered: &str, actual: &str) -> bool {
    match registered.strip_suffix('*') {
        Some(prefix) => {
            let namespace = prefix.trim_end_matches('/');
            if namespace.is_empty() {
                return true;
            }
            actual == namespace
                || actual
                    .strip_prefix(namespace)
                    .is_some_and(|rest| rest.starts_with('/'))
        }
        None => registered == actual,
    }
}

async fn authenticate(transport: &dyn Transport, auth: AuthMethod) -> Result<()> {
    match auth {
        AuthMethod::PreAuthorized => {
            transport.send_buf(b"BEGIN\r\n").await?;
            debug!("pre-authorized transport, sent bare BEGIN");
            Ok(())
        }
        AuthMethod::Anonymous => {
            let trace_hex = hex_encode(b"dbus-client-core");
            let line = format!("\0AUTH ANONYMOUS {trace_hex}\r\n");
            transport.send_buf(line.as_bytes()).await?;
            let response = read_auth_line(transport).await?;
            if response.starts_with("OK") {
                transport.send_buf(b"BEGIN\r\n").await?;
                debug!("anonymous authentication accepted");
                Ok(())
            } else {
                Err(DBusError::AuthorizationFailure(response))
            }
        }
    }
}

/// Read one `\r\n`-terminated ASCII line, a byte at a time so no binary
/// framing bytes are consumed past the line.
async fn read_auth_line(transport: &dyn Transport) -> Result<String> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let chunk = transport.recv(1, Some(AUTH_TIMEOUT)).await?;
        if chunk.is_empty() {
            return Err(DBusError::disconnected("transport closed during auth"));
        }
        line.extend_from_slice(&chunk);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return Ok(String::from_utf8_lossy(&line).into_owned());
        }
        if line.len() > 4096 {
            return Err(DBusError::AuthorizationFailure(
                "auth line exceeds 4096 bytes".to_string(),
            ));
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Accumulate exactly one frame off the arbitrarily-chunked stream.
async fn read_frame(transport: &Arc<dyn Transport>) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::with_capacity(64);
    let total = loop {
        if let Some(total) = message::required_length(&buf)? {
            break total;
        }
        let chunk = transport.recv(16 - buf.len(), None).await?;
        if chunk.is_empty() {
            return Err(DBusError::disconnected("transport closed mid-frame"));
        }
        buf.extend_from_slice(&chunk);
    };
    while buf.len() < total {
        let chunk = transport.recv(total - buf.len(), None).await?;
        if chunk.is_empty() {
            return Err(DBusError::disconnected("transport closed mid-frame"));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// The receive loop: one message at a time, in arrival order.
///
/// Decode errors for a single frame are logged and the frame dropped; a
/// preamble that cannot be parsed at all is unrecoverable and tears the
/// connection down. The loop exits when the transport dies or a newer
/// `using_transport` supersedes this generation.
async fn mainloop(inner: Arc<Inner>, transport: Arc<dyn Transport>, generation: u64) {
    debug!(generation, "receive loop started");
    loop {
        let frame = match read_frame(&transport).await {
            Ok(frame) => frame,
            Err(DBusError::InvalidPacket(reason)) => {
                // bad preamble: stream framing is lost for good
                warn!(%reason, "unrecoverable preamble error");
                inner
                    .teardown(Some(generation), "unrecoverable preamble error")
                    .await;
                return;
            }
            Err(err) => {
                debug!(error = %err, generation, "transport completed");
                inner.teardown(Some(generation), "transport closed").await;
                return;
            }
        };
        let msg = match Message::from_bytes(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                // one bad message never takes the connection down
                warn!(error = %err, "dropping undecodable frame");
                continue;
            }
        };
        dispatch(&inner, msg).await;
    }
}

async fn dispatch(inner: &Arc<Inner>, msg: Message) {
    match msg.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            let Some(reply) = msg.reply.clone() else {
                warn!("reply without correlation, dropping");
                return;
            };
            let waiter = {
                let mut pending = inner.pending.lock().expect("pending lock poisoned");
                let waiter = pending.remove(&reply.serial);
                if pending.is_empty() {
                    // call queue drained: disarm the shared timer
                    inner.timeout_generation.fetch_add(1, Ordering::SeqCst);
                }
                waiter
            };
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(msg));
                }
                None => debug!(reply_serial = reply.serial, "reply matched no pending call"),
            }
        }
        MessageType::Signal => dispatch_signal(inner, msg),
        MessageType::MethodCall => answer_method_call(inner, msg).await,
    }
}

fn dispatch_signal(inner: &Arc<Inner>, msg: Message) {
    let (Some(path), Some(interface), Some(member)) =
        (msg.path.clone(), msg.interface.clone(), msg.member.clone())
    else {
        warn!("signal without path/interface/member, dropping");
        return;
    };
    let args = match msg.args() {
        Ok(args) => args,
        Err(err) => {
            warn!(%interface, %member, error = %err, "dropping undecodable signal");
            return;
        }
    };

    let subs = inner
        .subscriptions
        .lock()
        .expect("subscriptions lock poisoned");
    let mut delivered = false;
    for (key, sub) in subs.iter() {
        if key.interface != interface || key.member != member || !path_matches(&key.path, &path)
        {
            continue;
        }
        for (_, tx) in &sub.observers {
            let _ = tx.send(SignalEvent {
                path: path.clone(),
                args: args.clone(),
            });
        }
        delivered = true;
    }
    if !delivered {
        trace!(%path, %interface, %member, "signal matched no subscription");
    }
}

/// The engine consumes services, it does not host them: only the standard
/// Peer/Introspectable stubs are answered, everything else is NotSupported.
async fn answer_method_call(inner: &Arc<Inner>, msg: Message) {
    let reply = match (msg.interface.as_deref(), msg.member.as_deref()) {
        (Some(PEER_INTERFACE), Some("Ping")) => Ok(Message::method_return(&msg)),
        (Some(INTROSPECTABLE_INTERFACE), Some("Introspect")) => Message::method_return(&msg)
            .with_body("s", &[Value::Str(INTROSPECT_STUB.to_string())]),
        (interface, member) => {
            debug!(?interface, ?member, "rejecting inbound method call");
            Message::error_reply(&msg, ERROR_NOT_SUPPORTED).with_body(
                "s",
                &[Value::Str(
                    "this peer does not host callable objects".to_string(),
                )],
            )
        }
    };
    if msg.no_reply_expected {
        return;
    }
    match reply {
        Ok(reply) => {
            if let Err(err) = inner.send_message(reply).await {
                warn!(error = %err, "failed to answer inbound method call");
            }
        }
        Err(err) => warn!(error = %err, "failed to build reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_rule_exact_path() {
        let key = SignalKey {
            path: "/org/example/Obj".to_string(),
            interface: "org.example.I".to_string(),
            member: "Changed".to_string(),
        };
        assert_eq!(
            match_rule_for(&key),
            "type='signal',path='/org/example/Obj',interface='org.example.I',member='Changed'"
        );
    }

    #[test]
    fn test_match_rule_namespace() {
        let key = SignalKey {
            path: "/org/example/*".to_string(),
            interface: "org.example.I".to_string(),
            member: "Changed".to_string(),
        };
        assert_eq!(
            match_rule_for(&key),
            "type='signal',path_namespace='/org/example',interface='org.example.I',member='Changed'"
        );
    }

    #[test]
    fn test_path_matching() {
        assert!(path_matches("/a/b", "/a/b"));
        assert!(!path_matches("/a/b", "/a/b/c"));
        assert!(path_matches("/a/*", "/a/b/c"));
        assert!(path_matches("/a*", "/a/b"));
        assert!(!path_matches("/a/b/*", "/a"));
        assert!(path_matches("/*", "/anything/at/all"));
    }

    #[test]
    fn test_namespace_match_stops_at_path_elements() {
        // the namespace itself is covered
        assert!(path_matches("/org/example/*", "/org/example"));
        assert!(path_matches("/org/example/*", "/org/example/obj"));
        // a sibling sharing the prefix as a string is not
        assert!(!path_matches("/org/example/*", "/org/examples"));
        assert!(!path_matches("/org/example/*", "/org/examples/leak"));
        assert!(!path_matches("/a*", "/ab"));
    }

    #[test]
    fn test_hex_encode() {
        assert_eq!(hex_encode(b"ab"), "6162");
        assert_eq!(hex_encode(&[0x00, 0xff]), "00ff");
    }
}
