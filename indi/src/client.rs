//! INDI client implementation
//!
//! This module provides the INDI client with:
//! - Bounded connection timeout and a fixed initial sync grace period
//! - A single receive task that frames the XML stream and owns model writes
//! - A writer task fed through an mpsc channel
//! - Validated property writes with structured errors
//! - Auto-connect of newly defined devices
//! - Isolated listener callbacks plus a broadcast subscription

use crate::error::{IndiError, IndiResult, SetPropertyError};
use crate::framing::FrameBuffer;
use crate::model::{IndiProperty, PropertyModel};
use crate::protocol::{self, standard_properties};
use crate::xml::XmlElement;
use crate::{ClientConfig, IndiPropertyType, INDI_DEFAULT_PORT};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::time::{sleep, timeout, Instant};

/// INDI client event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndiEvent {
    /// Property defined (or redefined) by the server
    PropertyDefined { device: String, property: IndiProperty },
    /// Property values or state updated
    PropertyUpdated { device: String, property: IndiProperty },
    /// A single property was deleted
    PropertyDeleted { device: String, name: String },
    /// A whole device was deleted
    DeviceDeleted { device: String },
    /// Server or device message
    Message {
        device: Option<String>,
        message: String,
        timestamp: String,
    },
    /// BLOB received with format information
    BlobReceived {
        device: String,
        property: String,
        element: String,
        format: String,
        size: usize,
        #[serde(skip)]
        data: Vec<u8>,
    },
    /// Connection state changed
    ConnectionStateChanged { connected: bool },
}

impl IndiEvent {
    /// Event name as used in push payloads
    pub fn kind(&self) -> &'static str {
        match self {
            IndiEvent::PropertyDefined { .. } => "property_defined",
            IndiEvent::PropertyUpdated { .. } => "property_updated",
            IndiEvent::PropertyDeleted { .. } => "property_deleted",
            IndiEvent::DeviceDeleted { .. } => "device_deleted",
            IndiEvent::Message { .. } => "message",
            IndiEvent::BlobReceived { .. } => "blob_received",
            IndiEvent::ConnectionStateChanged { .. } => "connection_state_changed",
        }
    }

    /// Device the event concerns, if any
    pub fn device(&self) -> Option<&str> {
        match self {
            IndiEvent::PropertyDefined { device, .. }
            | IndiEvent::PropertyUpdated { device, .. }
            | IndiEvent::PropertyDeleted { device, .. }
            | IndiEvent::DeviceDeleted { device }
            | IndiEvent::BlobReceived { device, .. } => Some(device),
            IndiEvent::Message { device, .. } => device.as_deref(),
            IndiEvent::ConnectionStateChanged { .. } => None,
        }
    }
}

/// Listener callback; errors and panics are logged and isolated
pub type IndiListener = dyn Fn(&IndiEvent) -> anyhow::Result<()> + Send + Sync;

/// Handle returned by [`IndiClient::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Arc<IndiListener>)>,
}

struct ClientInner {
    host: String,
    port: u16,
    config: ClientConfig,
    connected: AtomicBool,
    /// Incremented per connection so a stale reader cannot flip the state of a newer one
    session: AtomicU64,
    model: RwLock<PropertyModel>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    event_tx: broadcast::Sender<IndiEvent>,
    listeners: Mutex<Listeners>,
}

/// INDI client for communicating with an INDI server
///
/// Cloning is cheap; clones share the connection and the property model.
#[derive(Clone)]
pub struct IndiClient {
    inner: Arc<ClientInner>,
}

impl IndiClient {
    /// Create a new INDI client
    pub fn new(host: &str, port: Option<u16>) -> Self {
        Self::with_config(host, port, ClientConfig::default())
    }

    /// Create a new INDI client with custom configuration
    pub fn with_config(host: &str, port: Option<u16>, config: ClientConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ClientInner {
                host: host.to_string(),
                port: port.unwrap_or(INDI_DEFAULT_PORT),
                config,
                connected: AtomicBool::new(false),
                session: AtomicU64::new(0),
                model: RwLock::new(PropertyModel::new()),
                tx: Mutex::new(None),
                shutdown_tx: Mutex::new(None),
                event_tx,
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Subscribe to INDI events
    pub fn subscribe(&self) -> broadcast::Receiver<IndiEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a callback invoked for every event, in registration order
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&IndiEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.inner.listeners);
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        let listener: Arc<IndiListener> = Arc::new(listener);
        listeners.entries.push((id, listener));
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.entries.len();
        listeners.entries.retain(|(existing, _)| *existing != id);
        listeners.entries.len() != before
    }

    /// Connect to the INDI server
    ///
    /// Returns once the initial sync grace period has elapsed, so properties
    /// the server sends immediately are already in the model.
    pub async fn connect(&self) -> IndiResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let inner = &self.inner;
        let addr = format!("{}:{}", inner.host, inner.port);
        let connection_timeout = inner.config.connection_timeout();

        let stream = match timeout(connection_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!("Failed to connect to INDI server at {}: {}", addr, e);
                return Err(IndiError::ConnectionFailed(format!(
                    "Failed to connect to INDI server at {}: {}. Check that the server is running and the address is correct.",
                    addr, e
                )));
            }
            Err(_) => {
                tracing::error!("Timed out connecting to INDI server at {}", addr);
                return Err(IndiError::ConnectionTimeout {
                    host: inner.host.clone(),
                    port: inner.port,
                    duration: connection_timeout,
                });
            }
        };

        let (read_half, write_half) = stream.into_split();

        // A new session starts from an empty model
        inner.model.write().await.clear();

        let (tx, rx) = mpsc::channel::<String>(100);
        *lock(&inner.tx) = Some(tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *lock(&inner.shutdown_tx) = Some(shutdown_tx);

        tokio::spawn(writer_task(write_half, rx));

        let session = inner.session.fetch_add(1, Ordering::SeqCst) + 1;
        inner.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to INDI server at {}", addr);
        notify(inner, &IndiEvent::ConnectionStateChanged { connected: true });

        tokio::spawn(reader_task(inner.clone(), read_half, shutdown_rx, session));

        self.send_command(&protocol::get_properties(&inner.config.protocol_version))
            .await?;

        sleep(inner.config.initial_sync()).await;
        Ok(())
    }

    /// Disconnect from the INDI server
    ///
    /// Stops the reader, closes the writer and clears the property model.
    /// Calling it while disconnected does nothing.
    pub async fn disconnect(&self) -> IndiResult<()> {
        let inner = &self.inner;
        let was_connected = inner.connected.swap(false, Ordering::SeqCst);
        if let Some(tx) = lock(&inner.shutdown_tx).take() {
            let _ = tx.send(());
        }
        lock(&inner.tx).take();
        inner.model.write().await.clear();

        if was_connected {
            tracing::info!("Disconnected from INDI server {}:{}", inner.host, inner.port);
            notify(inner, &IndiEvent::ConnectionStateChanged { connected: false });
        }
        Ok(())
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Send a raw INDI command
    pub async fn send_command(&self, command: &str) -> IndiResult<()> {
        send_command(&self.inner, command).await
    }

    /// Ask the server to include BLOB payloads for a device
    pub async fn enable_blob(&self, device: &str) -> IndiResult<()> {
        self.send_command(&protocol::enable_blob(device)).await
    }

    /// Names of all known devices
    pub async fn get_devices(&self) -> Vec<String> {
        self.inner.model.read().await.devices()
    }

    /// All properties of a device keyed by name
    pub async fn get_device_properties(&self, device: &str) -> Option<BTreeMap<String, IndiProperty>> {
        self.inner.model.read().await.device_properties(device).cloned()
    }

    /// Snapshot of one property
    pub async fn get_property(&self, device: &str, property: &str) -> Option<IndiProperty> {
        self.inner.model.read().await.property(device, property).cloned()
    }

    /// Write element values of a property.
    ///
    /// Success means the command was transmitted. The device applies it
    /// asynchronously; the outcome shows up as a later property update.
    pub async fn set_property<K, V>(
        &self,
        device: &str,
        property: &str,
        values: &[(K, V)],
    ) -> Result<(), SetPropertyError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        set_property(&self.inner, device, property, values).await
    }

    /// Property names changed since the last call; clears the set
    pub async fn get_dirty_properties(&self, device: &str) -> Vec<String> {
        self.inner.model.write().await.drain_dirty(device)
    }

    /// Like [`get_dirty_properties`](Self::get_dirty_properties) but only
    /// returns names changed at or after `since`
    pub async fn get_dirty_properties_since(&self, device: &str, since: DateTime<Utc>) -> Vec<String> {
        self.inner.model.write().await.drain_dirty_since(device, since)
    }

    /// Current snapshots of the named properties; unknown names are skipped
    pub async fn get_changed_properties<S: AsRef<str>>(
        &self,
        device: &str,
        names: &[S],
    ) -> BTreeMap<String, IndiProperty> {
        self.inner.model.read().await.changed_properties(device, names)
    }

    /// Properties of a device grouped by group name
    pub async fn get_device_structure(
        &self,
        device: &str,
    ) -> Option<BTreeMap<String, BTreeMap<String, IndiProperty>>> {
        self.inner.model.read().await.device_structure(device)
    }

    /// Poll until the device is known or `wait` elapses
    pub async fn wait_for_device(&self, device: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let interval = self.inner.config.device_poll_interval();
        loop {
            if self.inner.model.read().await.has_device(device) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(interval).await;
        }
    }
}

impl Default for IndiClient {
    fn default() -> Self {
        Self::new("localhost", None)
    }
}

/// Writer task - sends commands to INDI server
async fn writer_task<W: AsyncWrite + Unpin>(mut writer: W, mut rx: mpsc::Receiver<String>) {
    while let Some(cmd) = rx.recv().await {
        if let Err(e) = writer.write_all(cmd.as_bytes()).await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            tracing::error!("INDI write error: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Reader task - frames the stream and applies each element to the model
async fn reader_task<R: AsyncRead + Unpin>(
    inner: Arc<ClientInner>,
    mut reader: R,
    mut shutdown_rx: oneshot::Receiver<()>,
    session: u64,
) {
    let mut frames = FrameBuffer::new();
    let mut chunk = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                tracing::info!("INDI reader task received shutdown signal");
                break;
            }
            read = reader.read(&mut chunk) => match read {
                Ok(0) => {
                    tracing::info!("INDI connection closed (EOF)");
                    break;
                }
                Ok(n) => {
                    frames.push(&chunk[..n]);
                    while let Some(frame) = frames.next_frame() {
                        process_frame(&inner, &frame).await;
                    }
                }
                Err(e) => {
                    tracing::error!("INDI read error: {}", e);
                    break;
                }
            }
        }
    }

    if frames.pending() > 0 {
        tracing::debug!("Discarding {} bytes of incomplete INDI data", frames.pending());
    }

    // Only the current session may report the connection as gone
    if inner.session.load(Ordering::SeqCst) == session
        && inner.connected.swap(false, Ordering::SeqCst)
    {
        lock(&inner.tx).take();
        inner.model.write().await.clear();
        notify(&inner, &IndiEvent::ConnectionStateChanged { connected: false });
    }
}

async fn process_frame(inner: &Arc<ClientInner>, frame: &str) {
    let root = match XmlElement::parse(frame) {
        Ok(root) => root,
        Err(e) => {
            tracing::warn!(
                "Dropping malformed INDI element: {}. Frame (first 200 chars): {:?}",
                e,
                frame.chars().take(200).collect::<String>()
            );
            return;
        }
    };

    let events = inner.model.write().await.apply(&root);

    for event in &events {
        if let IndiEvent::PropertyDefined { device, property } = event {
            if inner.config.auto_connect && property.name == standard_properties::CONNECTION {
                schedule_auto_connect(inner, device, property);
            }
        }
        notify(inner, event);
    }
}

/// Turn on a freshly defined device after a short settling delay
fn schedule_auto_connect(inner: &Arc<ClientInner>, device: &str, connection: &IndiProperty) {
    if connection.element(standard_properties::CONNECT).is_none()
        || connection.is_on(standard_properties::CONNECT)
    {
        return;
    }

    let inner = inner.clone();
    let device = device.to_string();
    tokio::spawn(async move {
        sleep(inner.config.auto_connect_delay()).await;
        if !inner.connected.load(Ordering::SeqCst) {
            return;
        }

        let current = inner
            .model
            .read()
            .await
            .property(&device, standard_properties::CONNECTION)
            .cloned();
        let current = match current {
            Some(p) if !p.is_on(standard_properties::CONNECT) => p,
            _ => return,
        };

        let mut values = vec![(standard_properties::CONNECT, "On")];
        if current.element(standard_properties::DISCONNECT).is_some() {
            values.push((standard_properties::DISCONNECT, "Off"));
        }

        tracing::info!("Auto-connecting device: {}", device);
        if let Err(e) = set_property(&inner, &device, standard_properties::CONNECTION, &values).await {
            tracing::warn!("Auto-connect of {} failed: {}", device, e);
        }
    });
}

/// Call every listener, then broadcast
fn notify(inner: &ClientInner, event: &IndiEvent) {
    let listeners: Vec<Arc<IndiListener>> = lock(&inner.listeners)
        .entries
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();

    for listener in listeners {
        match catch_unwind(AssertUnwindSafe(|| listener(event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Error in INDI listener for {}: {:#}", event.kind(), e),
            Err(_) => tracing::error!("INDI listener panicked handling {}", event.kind()),
        }
    }

    // No subscribers is fine
    let _ = inner.event_tx.send(event.clone());
}

async fn send_command(inner: &ClientInner, command: &str) -> IndiResult<()> {
    let tx = lock(&inner.tx).clone();
    match tx {
        Some(tx) => tx.send(command.to_string()).await.map_err(|e| {
            IndiError::ChannelClosed(format!(
                "Failed to send INDI command to {}:{}: {}. The connection may have been lost.",
                inner.host, inner.port, e
            ))
        }),
        None => Err(IndiError::NotConnected),
    }
}

async fn set_property<K, V>(
    inner: &ClientInner,
    device: &str,
    property: &str,
    values: &[(K, V)],
) -> Result<(), SetPropertyError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    if !inner.connected.load(Ordering::SeqCst) {
        return Err(SetPropertyError::NotConnected);
    }

    let message = {
        let model = inner.model.read().await;
        let prop = model
            .property(device, property)
            .ok_or_else(|| SetPropertyError::PropertyNotFound {
                device: device.to_string(),
                property: property.to_string(),
            })?;

        if !prop.perm.is_writable() {
            return Err(SetPropertyError::PermissionDenied {
                property: property.to_string(),
            });
        }
        if matches!(prop.property_type, IndiPropertyType::Light | IndiPropertyType::Blob) {
            return Err(SetPropertyError::UnsupportedType(prop.property_type));
        }

        let mut normalized = Vec::with_capacity(values.len());
        for (element, value) in values {
            let (element, value) = (element.as_ref(), value.as_ref());
            if prop.element(element).is_none() {
                return Err(SetPropertyError::ElementNotFound {
                    device: device.to_string(),
                    property: property.to_string(),
                    element: element.to_string(),
                });
            }
            let value = validate_value(prop.property_type, element, value)?;
            normalized.push((element.to_string(), value));
        }

        protocol::new_vector(prop.property_type, device, property, &normalized)
            .ok_or(SetPropertyError::UnsupportedType(prop.property_type))?
    };

    send_command(inner, &message).await?;
    tracing::debug!("Sent new value for {}.{}", device, property);
    Ok(())
}

/// Check the value shape for the property type and return the wire form
fn validate_value(
    property_type: IndiPropertyType,
    element: &str,
    value: &str,
) -> Result<String, SetPropertyError> {
    let invalid = || SetPropertyError::InvalidValue {
        element: element.to_string(),
        value: value.to_string(),
    };
    match property_type {
        IndiPropertyType::Number => {
            let trimmed = value.trim();
            trimmed.parse::<f64>().map_err(|_| invalid())?;
            Ok(trimmed.to_string())
        }
        IndiPropertyType::Switch => {
            if value.trim().eq_ignore_ascii_case("on") {
                Ok("On".to_string())
            } else if value.trim().eq_ignore_ascii_case("off") {
                Ok("Off".to_string())
            } else {
                Err(invalid())
            }
        }
        IndiPropertyType::Text => Ok(value.to_string()),
        IndiPropertyType::Light | IndiPropertyType::Blob => {
            Err(SetPropertyError::UnsupportedType(property_type))
        }
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
