use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devclaim::cloud::{Cloud, InboundEvent, SESSION_END_EVENT, SubscriptionScope, Visibility};
use devclaim::error::{Error as ClaimError, ErrorKind as ClaimErrorKind, Result as ClaimResult};

use rumqttc::v5::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, mqttbytes::QoS,
    mqttbytes::v5::Packet,
};

use tokio::task::JoinHandle;

use tokio_util::sync::{CancellationToken, DropGuard};

use tracing::{debug, error, info, warn};

use crate::config::BrokerSettings;

// The capacity of the bounded asynchronous channels.
const ASYNC_CHANNEL_CAPACITY: usize = 10;

// Topic level of private events.
const PRIVATE_LEVEL: &str = "private";
// Topic level of public events.
const PUBLIC_LEVEL: &str = "public";

#[inline]
const fn visibility_level(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Private => PRIVATE_LEVEL,
        Visibility::Public => PUBLIC_LEVEL,
    }
}

#[inline]
const fn scope_level(scope: SubscriptionScope) -> &'static str {
    match scope {
        SubscriptionScope::MyDevices => PRIVATE_LEVEL,
        SubscriptionScope::AllDevices => PUBLIC_LEVEL,
    }
}

/// Returns the `MQTT` topic where an event is published.
#[must_use]
pub fn event_topic(prefix: &str, name: &str, visibility: Visibility) -> String {
    format!("{prefix}/{}/{name}", visibility_level(visibility))
}

/// Returns the `MQTT` topic filter matching all events whose name starts
/// with `pattern`.
///
/// The multi-level wildcard also matches the pattern itself.
#[must_use]
pub fn subscription_filter(prefix: &str, pattern: &str, scope: SubscriptionScope) -> String {
    format!("{prefix}/{}/{pattern}/#", scope_level(scope))
}

/// Extracts the event name from an `MQTT` topic.
#[must_use]
pub fn event_name<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;

    [PRIVATE_LEVEL, PUBLIC_LEVEL]
        .iter()
        .find_map(|level| rest.strip_prefix(level)?.strip_prefix('/'))
        .filter(|name| !name.is_empty())
}

fn cloud_error(error: impl std::fmt::Display) -> ClaimError {
    ClaimError::new(ClaimErrorKind::Cloud, error.to_string())
}

// State shared between the cloud connection and its event loop task.
struct Shared {
    client: AsyncClient,
    prefix: String,
    connected: AtomicBool,
    filters: Mutex<Vec<String>>,
}

impl Shared {
    fn new(client: AsyncClient, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            connected: AtomicBool::new(false),
            filters: Mutex::new(Vec::new()),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn publish(&self, name: &str, data: &str, visibility: Visibility) -> ClaimResult<()> {
        let topic = event_topic(&self.prefix, name, visibility);
        self.client
            .try_publish(
                topic.as_str(),
                QoS::AtLeastOnce,
                false,
                data.as_bytes().to_vec(),
            )
            .map_err(cloud_error)?;

        if name == SESSION_END_EVENT {
            debug!("Ending the cloud session");
            self.client.try_disconnect().map_err(cloud_error)?;
        }

        Ok(())
    }

    fn subscribe(&self, pattern: &str, scope: SubscriptionScope) -> ClaimResult<()> {
        let filter = subscription_filter(&self.prefix, pattern, scope);

        self.filters
            .lock()
            .map_err(cloud_error)?
            .push(filter.clone());

        self.client
            .try_subscribe(filter.as_str(), QoS::AtLeastOnce)
            .map_err(cloud_error)
    }

    fn mark_connected(&self) {
        info!("Connected to the broker");
        self.resubscribe();
        self.connected.store(true, Ordering::Release);
    }

    fn resubscribe(&self) {
        let Ok(filters) = self.filters.lock() else {
            error!("Subscriptions lock poisoned, impossible to resubscribe");
            return;
        };

        for filter in filters.iter() {
            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                error!("Impossible to resubscribe to `{filter}`: {e}");
            }
        }
    }

    fn parse_publish(&self, event: &Event) -> Option<InboundEvent> {
        let Event::Incoming(Packet::Publish(publish)) = event else {
            return None;
        };

        let topic = String::from_utf8_lossy(&publish.topic);
        let Some(name) = event_name(&self.prefix, &topic) else {
            warn!("Publish on unexpected topic `{topic}`, discard it");
            return None;
        };

        Some(InboundEvent::new(
            name,
            String::from_utf8_lossy(&publish.payload),
        ))
    }

    fn mark_disconnected(&self, e: &ConnectionError) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("Disconnected from the broker: {e}");
        } else {
            debug!("Broker still unreachable: {e}");
        }
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    mut eventloop: EventLoop,
    sender: flume::Sender<InboundEvent>,
    reconnect_delay: Duration,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        shared.mark_disconnected(&e);
                        // Keep the disconnection observable for a while
                        // before reconnecting.
                        tokio::time::sleep(reconnect_delay).await;
                        continue;
                    }
                };

                if let Event::Incoming(Packet::ConnAck(_)) = event {
                    shared.mark_connected();
                    continue;
                }

                let Some(inbound) = shared.parse_publish(&event) else {
                    continue;
                };

                if let Err(e) = sender.send_async(inbound).await {
                    error!("Stop forwarding inbound events: {e}");
                    break;
                }
            }
        }
    }
    shared.connected.store(false, Ordering::Release);
}

/// A [`Cloud`] connection over `MQTT`.
///
/// Events are published on `<prefix>/private/<name>` or
/// `<prefix>/public/<name>` depending on their visibility. Inbound events
/// are forwarded by a background task into a channel drained by
/// [`Cloud::poll_inbound`].
///
/// Publishing [`SESSION_END_EVENT`] also closes the connection, which is
/// then reopened by the background task.
pub struct MqttCloud {
    shared: Arc<Shared>,
    receiver: flume::Receiver<InboundEvent>,
    task: JoinHandle<()>,
    cancellation_token: CancellationToken,
    _guard: DropGuard,
}

impl MqttCloud {
    /// Connects to the broker described by the [`BrokerSettings`].
    ///
    /// The connection is established in the background, check
    /// [`Cloud::is_connected`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a `tokio` runtime.
    #[must_use]
    pub fn connect(settings: &BrokerSettings, client_id: &str) -> Self {
        let mut options =
            MqttOptions::new(client_id.to_string(), settings.host.clone(), settings.port);
        let _ = options
            .set_keep_alive(Duration::from_secs(settings.keep_alive_secs))
            .set_clean_start(true);

        let (client, eventloop) = AsyncClient::new(options, ASYNC_CHANNEL_CAPACITY);
        let (sender, receiver) = flume::bounded(ASYNC_CHANNEL_CAPACITY);

        let shared = Arc::new(Shared::new(client, &settings.prefix));

        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(run_event_loop(
            Arc::clone(&shared),
            eventloop,
            sender,
            Duration::from_millis(settings.reconnect_delay_ms),
            cancellation_token.clone(),
        ));

        info!(
            "Connecting to {}:{} as `{client_id}`",
            settings.host, settings.port
        );

        Self {
            shared,
            receiver,
            task,
            _guard: cancellation_token.clone().drop_guard(),
            cancellation_token,
        }
    }

    /// Stops the background task and waits for its termination.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.task.await {
            error!("The event loop task terminated abnormally: {e}");
        }
    }
}

impl Cloud for MqttCloud {
    fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    fn publish(&mut self, name: &str, data: &str, visibility: Visibility) -> ClaimResult<()> {
        self.shared.publish(name, data, visibility)
    }

    fn subscribe(&mut self, prefix: &str, scope: SubscriptionScope) -> ClaimResult<()> {
        self.shared.subscribe(prefix, scope)
    }

    fn poll_inbound(&mut self) -> Option<InboundEvent> {
        self.receiver.try_recv().ok()
    }
}
