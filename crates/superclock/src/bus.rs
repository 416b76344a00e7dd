//! Broker connection: keeps one MQTT session alive, routes inbound messages
//! through the [`DispatchTable`], and hands out a fire-and-forget
//! [`Publisher`] to the rest of the kiosk.
//!
//! ## Connection state machine
//!
//! ```text
//!             ┌──────────[ConnAck ok]──────────┐
//!             │                                ▼
//!  Connecting ─[error]─▶ Backoff(30s)       Connected ─[transport error]─▶ Backoff(10s)
//!      ▲                    │                                                  │
//!      └────[cooldown]──────┴──────────────────────[cooldown]──────────────────┘
//! ```
//!
//! Every transport error is retried. Cooldowns are raced against the shutdown
//! token so stopping the kiosk never waits them out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill,
    MqttOptions, Outgoing, Packet, QoS,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::LocalClock;
use crate::config::MqttSettings;
use crate::dispatch::DispatchTable;
use crate::heartbeat::SystemProbe;
use crate::mqtt::{client_identity, lwt_topic, state_topic, OFFLINE, ONLINE};
use crate::store::SharedStore;

/// Capacity of the request channel between publishers and the event loop.
const REQUEST_CAPACITY: usize = 32;

/// Upper bound on flushing the final Offline + DISCONNECT at shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a publish or subscribe request was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishError {
    /// The client could not be created; the bus is a permanent no-op.
    Disabled,
    /// The event loop is gone.
    Closed,
    /// No live session; nothing is queued until the broker is back.
    Disconnected,
    /// The request queue is full.
    Full,
    /// The payload could not be serialised.
    Encode,
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "mqtt client unavailable"),
            Self::Closed => write!(f, "mqtt event loop closed"),
            Self::Disconnected => write!(f, "not connected to broker"),
            Self::Full => write!(f, "mqtt request queue full"),
            Self::Encode => write!(f, "payload not serialisable"),
        }
    }
}

/// rumqttc folds "queue full" and "event loop dropped" into the same
/// `TryRequest`; [`Publisher`] tells them apart by checking the run loop first.
impl From<ClientError> for PublishError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Request(_) => Self::Closed,
            ClientError::TryRequest(_) => Self::Full,
        }
    }
}

/// Classified transport failure reported by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Refused(String),
    Io(String),
    Timeout,
    Protocol(String),
    Unknown(String),
}

impl TransportError {
    pub fn classify(e: &ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionRefused(code) => Self::Refused(refusal_reason(*code)),
            ConnectionError::Io(io) => Self::Io(io.to_string()),
            ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Self::Timeout,
            ConnectionError::MqttState(state) => Self::Protocol(state.to_string()),
            ConnectionError::NotConnAck(packet) => {
                Self::Protocol(format!("expected ConnAck, got {packet:?}"))
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(why) => write!(f, "connection refused ({why})"),
            Self::Io(e) => write!(f, "i/o: {e}"),
            Self::Timeout => write!(f, "network timeout"),
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Unknown(e) => write!(f, "unknown: {e}"),
        }
    }
}

fn refusal_reason(code: ConnectReturnCode) -> String {
    match code {
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version".into(),
        ConnectReturnCode::BadClientId => "identifier rejected".into(),
        ConnectReturnCode::ServiceUnavailable => "broker unavailable".into(),
        ConnectReturnCode::BadUserNamePassword => "bad user name or password".into(),
        ConnectReturnCode::NotAuthorized => "not authorized".into(),
        other => format!("{other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Sink seam
// ---------------------------------------------------------------------------

/// Non-blocking request side of a broker session.
pub trait BusSink: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError>;
    fn subscribe(&self, topic: &str) -> Result<(), PublishError>;
}

impl BusSink for AsyncClient {
    fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(PublishError::from)
    }

    fn subscribe(&self, topic: &str) -> Result<(), PublishError> {
        self.try_subscribe(topic, QoS::AtMostOnce)
            .map_err(PublishError::from)
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// View of the run loop a [`Publisher`] checks before queueing anything.
///
/// While the session is down rumqttc does not drain its request channel, so
/// anything queued then would sit in front of the resubscribes on the next
/// ConnAck and could fill the channel before they get in.
#[derive(Clone)]
struct Link {
    state: watch::Receiver<ConnectionState>,
    closed: CancellationToken,
}

impl Link {
    fn check(&self) -> Result<(), PublishError> {
        if self.closed.is_cancelled() {
            Err(PublishError::Closed)
        } else if *self.state.borrow() != ConnectionState::Connected {
            Err(PublishError::Disconnected)
        } else {
            Ok(())
        }
    }
}

/// Cloneable handle for publishing. Never blocks; failures are logged and
/// returned, and the caller's next attempt is the retry.
#[derive(Clone)]
pub struct Publisher {
    sink: Option<Arc<dyn BusSink>>,
    link: Option<Link>,
    node: String,
}

impl Publisher {
    pub fn new(sink: Arc<dyn BusSink>, node: impl Into<String>) -> Self {
        Self {
            sink: Some(sink),
            link: None,
            node: node.into(),
        }
    }

    /// A publisher whose every call fails with [`PublishError::Disabled`].
    pub fn disabled(node: impl Into<String>) -> Self {
        Self {
            sink: None,
            link: None,
            node: node.into(),
        }
    }

    /// Only queue requests while `state` is `Connected`, and report
    /// `Closed` once `closed` fires.
    fn linked(
        mut self,
        state: watch::Receiver<ConnectionState>,
        closed: CancellationToken,
    ) -> Self {
        self.link = Some(Link { state, closed });
        self
    }

    fn sink(&self) -> Result<&Arc<dyn BusSink>, PublishError> {
        let sink = self.sink.as_ref().ok_or(PublishError::Disabled)?;
        if let Some(link) = &self.link {
            link.check()?;
        }
        Ok(sink)
    }

    /// This kiosk's node name, used in its own topics.
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        retain: bool,
    ) -> Result<(), PublishError> {
        let result = self
            .sink()
            .and_then(|sink| sink.publish(topic, payload.into(), retain));
        match &result {
            Err(PublishError::Disconnected) => debug!(%topic, "not published: offline"),
            Err(e) => error!(%topic, "can't publish: {e}"),
            Ok(()) => {}
        }
        result
    }

    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<(), PublishError> {
        match serde_json::to_vec(value) {
            Ok(body) => {
                debug!(%topic, body = %String::from_utf8_lossy(&body), "publish");
                self.publish(topic, body, false)
            }
            Err(e) => {
                error!(%topic, "can't encode payload: {e}");
                Err(PublishError::Encode)
            }
        }
    }

    /// Retained "Online"/"Offline" on this node's liveness topic.
    pub fn publish_lwt(&self, online: bool) -> Result<(), PublishError> {
        let topic = lwt_topic(&self.node);
        let msg = if online { ONLINE } else { OFFLINE };
        info!(%topic, %msg, "publish liveness");
        self.publish(&topic, msg, true)
    }

    fn subscribe(&self, topic: &str) -> Result<(), PublishError> {
        self.sink()?.subscribe(topic)
    }
}

// ---------------------------------------------------------------------------
// Connection supervisor (pure state machine)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// One poll result, reduced to what the supervisor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Any successful poll that does not change the connection.
    Event,
    ConnAck { accepted: bool },
    /// The broker closed the session.
    BrokerDisconnect,
    Error(TransportError),
    /// Every client handle is gone; nothing left to serve.
    Closed,
}

/// What the run loop has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Session (re)established: resubscribe and announce.
    Announce,
    Cooldown(Duration),
    Stop,
}

#[derive(Debug)]
pub struct Supervisor {
    state: ConnectionState,
    retry: Duration,
    connect_retry: Duration,
    connects: u64,
}

impl Supervisor {
    pub fn new(retry: Duration, connect_retry: Duration) -> Self {
        Self {
            state: ConnectionState::Connecting,
            retry,
            connect_retry,
            connects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of successful (re)connections so far.
    pub fn connects(&self) -> u64 {
        self.connects
    }

    pub fn on_outcome(&mut self, outcome: &Outcome) -> Step {
        match outcome {
            Outcome::Event => Step::Continue,
            Outcome::ConnAck { accepted: true } => {
                self.state = ConnectionState::Connected;
                self.connects += 1;
                Step::Announce
            }
            Outcome::ConnAck { accepted: false } => {
                self.state = ConnectionState::Backoff;
                Step::Cooldown(self.connect_retry)
            }
            Outcome::BrokerDisconnect => {
                self.state = ConnectionState::Backoff;
                Step::Cooldown(self.retry)
            }
            Outcome::Error(TransportError::Unknown(_)) => {
                // Transient: the next poll reconnects on its own.
                if self.state == ConnectionState::Connected {
                    self.state = ConnectionState::Disconnected;
                }
                Step::Continue
            }
            Outcome::Error(_) if self.state == ConnectionState::Connected => {
                self.state = ConnectionState::Backoff;
                Step::Cooldown(self.retry)
            }
            Outcome::Error(_) => {
                // Not connected: the connection attempt itself failed.
                self.state = ConnectionState::Backoff;
                Step::Cooldown(self.connect_retry)
            }
            Outcome::Closed => {
                self.state = ConnectionState::Disconnected;
                Step::Stop
            }
        }
    }

    /// Cooldown elapsed; the next poll is a reconnect attempt.
    pub fn resume(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Backoff | ConnectionState::Disconnected
        ) {
            self.state = ConnectionState::Connecting;
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Everything the run loop needs besides the event loop itself.
struct Session {
    publisher: Publisher,
    table: Arc<DispatchTable>,
    store: SharedStore,
    probe: SystemProbe,
    clock: LocalClock,
}

/// Subscribe every table topic, then announce "Online" and a state snapshot.
/// Returns the number of subscriptions queued.
fn announce(publisher: &Publisher, table: &DispatchTable, state: &impl Serialize) -> usize {
    let mut subscribed = 0;
    for topic in table.topics() {
        match publisher.subscribe(topic) {
            Ok(()) => {
                info!(%topic, "subscribe");
                subscribed += 1;
            }
            Err(e) => error!(%topic, "can't subscribe: {e}"),
        }
    }
    let _ = publisher.publish_lwt(true);
    let _ = publisher.publish_json(&state_topic(publisher.node()), state);
    subscribed
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Build the session options: identity, keep-alive, credentials, and the
/// retained "Offline" last will on `tele/<node>/LWT`.
pub fn connect_options(settings: &MqttSettings, identity: &str, node: &str) -> MqttOptions {
    let mut opts = MqttOptions::new(identity, settings.host.clone(), settings.port);
    opts.set_keep_alive(Duration::from_secs(settings.keep_alive_secs));
    opts.set_clean_session(true);
    if let Some(user) = &settings.username {
        opts.set_credentials(user.clone(), settings.password.clone().unwrap_or_default());
    }
    opts.set_last_will(LastWill::new(
        lwt_topic(node),
        OFFLINE,
        QoS::AtMostOnce,
        true,
    ));
    opts
}

pub struct BusClient {
    publisher: Publisher,
    state: watch::Receiver<ConnectionState>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BusClient {
    /// Create the session and spawn its run loop. The first connection
    /// attempt happens inside the loop; failures go down the reconnect path.
    ///
    /// When no client can be created the returned handle is inert: its
    /// publisher always reports [`PublishError::Disabled`].
    pub fn connect(
        settings: &MqttSettings,
        node: &str,
        table: DispatchTable,
        store: SharedStore,
        probe: SystemProbe,
        clock: LocalClock,
    ) -> Self {
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let shutdown = CancellationToken::new();

        let Some(identity) = client_identity(&settings.program, node) else {
            error!(
                program = %settings.program,
                %node,
                "mqtt client unavailable: invalid identity, bus disabled"
            );
            return Self {
                publisher: Publisher::disabled(node),
                state,
                shutdown,
                task: None,
            };
        };

        info!(
            %identity,
            host = %settings.host,
            port = settings.port,
            "connecting to broker"
        );
        let (client, eventloop) =
            AsyncClient::new(connect_options(settings, &identity, node), REQUEST_CAPACITY);
        let sink: Arc<dyn BusSink> = Arc::new(client.clone());
        let publisher = Publisher::new(sink, node).linked(state.clone(), shutdown.clone());

        let session = Session {
            publisher: publisher.clone(),
            table: Arc::new(table),
            store,
            probe,
            clock,
        };
        let supervisor = Supervisor::new(
            Duration::from_secs(settings.retry_secs),
            Duration::from_secs(settings.connect_retry_secs),
        );
        let task = tokio::spawn(run(
            client,
            eventloop,
            session,
            supervisor,
            state_tx,
            shutdown.clone(),
        ));

        Self {
            publisher,
            state,
            shutdown,
            task: Some(task),
        }
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Stop the run loop and wait for it. Consumes the client, so it can
    /// only happen once; publishers cloned earlier report `Closed` afterwards.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("mqtt loop ended abnormally: {e}");
            }
        }
        info!("mqtt client shut down");
    }
}

/// The run loop: poll, classify, act. Ends on shutdown or when every client
/// handle has been dropped.
async fn run(
    client: AsyncClient,
    mut eventloop: EventLoop,
    session: Session,
    mut supervisor: Supervisor,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
) {
    info!("mqtt loop started");
    publish_state(&state_tx, supervisor.state());

    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let outcome = match polled {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                session
                    .table
                    .dispatch(&session.store, &p.topic, &p.payload)
                    .await;
                Outcome::Event
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => Outcome::ConnAck {
                accepted: ack.code == ConnectReturnCode::Success,
            },
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                debug!("subscribed successfully");
                Outcome::Event
            }
            Ok(Event::Incoming(Packet::Disconnect)) => Outcome::BrokerDisconnect,
            Ok(_) => Outcome::Event,
            Err(ConnectionError::RequestsDone) => Outcome::Closed,
            Err(e) => Outcome::Error(TransportError::classify(&e)),
        };

        let was = supervisor.state();
        let step = supervisor.on_outcome(&outcome);
        publish_state(&state_tx, supervisor.state());

        match step {
            Step::Continue => {
                if let Outcome::Error(e) = &outcome {
                    warn!("mqtt error, continuing: {e}");
                }
            }
            Step::Announce => {
                info!(connects = supervisor.connects(), "mqtt connected");
                let snapshot = session.probe.state(&session.clock);
                announce(&session.publisher, &session.table, &snapshot);
            }
            Step::Cooldown(wait) => {
                match (&outcome, was) {
                    (Outcome::Error(e), ConnectionState::Connected) => {
                        error!("mqtt transport error, disconnected: {e}");
                    }
                    (Outcome::Error(e), _) => error!("can't connect to broker: {e}"),
                    (Outcome::BrokerDisconnect, _) => error!("broker closed the session"),
                    _ => error!("broker rejected the connection"),
                }
                info!(secs = wait.as_secs(), "mqtt cooldown");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(wait) => {}
                }
                supervisor.resume();
                publish_state(&state_tx, supervisor.state());
                info!("mqtt reconnecting");
            }
            Step::Stop => {
                warn!("all mqtt client handles dropped");
                break;
            }
        }
    }

    // Publishers refuse from here on; the goodbye goes out on the raw client.
    shutdown.cancel();
    if supervisor.state() == ConnectionState::Connected {
        let lwt = lwt_topic(session.publisher.node());
        info!(topic = %lwt, msg = OFFLINE, "publish liveness");
        if let Err(e) = BusSink::publish(&client, &lwt, OFFLINE.into(), true) {
            error!(topic = %lwt, "can't publish: {e}");
        }
        if client.try_disconnect().is_ok() {
            flush_disconnect(&mut eventloop).await;
        }
    }
    publish_state(&state_tx, ConnectionState::Disconnected);
    info!("mqtt loop finished");
}

/// Drive the event loop until the DISCONNECT packet is written.
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("timed out flushing mqtt disconnect");
    }
}

fn publish_state(tx: &watch::Sender<ConnectionState>, state: ConnectionState) {
    tx.send_if_modified(|current| {
        if *current == state {
            false
        } else {
            debug!(?state, "mqtt state");
            *current = state;
            true
        }
    });
}

// ===========================================================================
// Tests
// ===========================================================================
