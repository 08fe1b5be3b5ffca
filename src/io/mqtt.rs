// src/io/mqtt.rs
//
// MQTT cloud link - device-identity operations over a message broker.
//
// Topic layout, device-scoped:
//   outbound:  fieldgate/<device-id>/{register,auth,schema,data,unregister}
//   inbound:   fieldgate/<device-id>/cloud/{registered,auth,schema,update,
//              request,unregister,list}
//
// Inbound payloads are JSON with an error flag; the ingress router in
// events.rs turns them into control events. The event-loop task reports
// link edges: ConnAck means up, a connection error means down (rumqttc
// keeps retrying the session on the next poll).

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, Packet, QoS};
use serde_json::json;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::CloudPort;
use crate::error::CloudError;
use crate::events::{CloudMessage, Event, MessageKind};
use crate::registry::{SchemaEntry, Value};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// MQTT cloud link configuration
#[derive(Clone, Debug)]
pub struct MqttCloudConfig {
    /// Broker URL, e.g. "mqtt://broker.example.com:1883"
    pub url: String,
    /// Device name, used as the broker username and client id suffix
    pub device_name: String,
    /// User-scoped access token, used as the broker password
    pub user_token: String,
}

/// Parse a "mqtt://host:port" broker URL. Port defaults to 1883.
fn parse_broker_url(url: &str) -> Result<(String, u16), String> {
    let rest = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .ok_or_else(|| format!("unsupported cloud url '{}': expected mqtt://host:port", url))?;
    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|e| format!("invalid cloud port in '{}': {}", url, e))?;
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), 1883)),
    }
}

/// MQTT cloud link
pub struct MqttLink {
    client: AsyncClient,
    /// Taken by the event-loop task on start
    eventloop: Mutex<Option<EventLoop>>,
    /// Inbound topic filter for the registered device id, re-subscribed on
    /// every reconnect
    filter: Arc<StdMutex<Option<String>>>,
    cancel: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    pub fn new(config: &MqttCloudConfig) -> Result<Self, String> {
        let (host, port) = parse_broker_url(&config.url)?;

        let client_id = format!("fieldgate-{}", config.device_name);
        let mut options = MqttOptions::new(&client_id, host, port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_credentials(&config.device_name, &config.user_token);

        let (client, eventloop) = AsyncClient::new(options, 100);
        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            filter: Arc::new(StdMutex::new(None)),
            cancel: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        })
    }

    /// Spawn the event-loop task. Link edges and routed inbound events land
    /// in `tx`.
    pub async fn start(&self, tx: UnboundedSender<Event>) -> Result<(), String> {
        let eventloop = self
            .eventloop
            .lock()
            .await
            .take()
            .ok_or_else(|| "cloud link already started".to_string())?;

        self.cancel.store(false, Ordering::Relaxed);
        let client = self.client.clone();
        let filter = self.filter.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            run_eventloop(eventloop, client, filter, cancel, tx).await;
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the event-loop task and disconnect.
    pub async fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
        info!("[cloud] stopped");
    }

    fn topic(&self, id: &str, op: &str) -> String {
        format!("fieldgate/{}/{}", id, op)
    }

    /// Subscribe to the device's inbound topics. Handshake entry points call
    /// this so the subscription follows the device id, including the id
    /// generated on first registration.
    async fn ensure_subscribed(&self, id: &str) -> Result<(), CloudError> {
        let wanted = format!("fieldgate/{}/cloud/#", id);
        {
            let current = self.filter.lock().unwrap();
            if current.as_deref() == Some(wanted.as_str()) {
                return Ok(());
            }
        }
        self.client
            .subscribe(&wanted, QoS::AtLeastOnce)
            .await
            .map_err(|e| CloudError::Client(e.to_string()))?;
        *self.filter.lock().unwrap() = Some(wanted);
        Ok(())
    }

    async fn publish_json(
        &self,
        topic: String,
        payload: serde_json::Value,
    ) -> Result<(), CloudError> {
        let body = serde_json::to_vec(&payload)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| CloudError::Client(e.to_string()))
    }
}

async fn run_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    filter: Arc<StdMutex<Option<String>>>,
    cancel: Arc<AtomicBool>,
    tx: UnboundedSender<Event>,
) {
    let mut connected = false;

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        // Poll with timeout to check the cancel flag periodically
        match tokio::time::timeout(POLL_TIMEOUT, eventloop.poll()).await {
            Ok(Ok(rumqttc::Event::Incoming(Packet::ConnAck(_)))) => {
                info!("[cloud] connected to broker");
                let wanted = filter.lock().unwrap().clone();
                if let Some(wanted) = wanted {
                    if let Err(e) = client.subscribe(&wanted, QoS::AtLeastOnce).await {
                        warn!("[cloud] resubscribe to '{}' failed: {}", wanted, e);
                    }
                }
                connected = true;
                let _ = tx.send(Event::Link(crate::events::Link::Cloud, true));
            }
            Ok(Ok(rumqttc::Event::Incoming(Packet::Publish(publish)))) => {
                match parse_inbound(&publish.topic, &publish.payload) {
                    Some(msg) => {
                        if let Some(event) = crate::events::route(msg) {
                            let _ = tx.send(event);
                        }
                    }
                    None => {
                        debug!("[cloud] dropped message on '{}'", publish.topic);
                    }
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                if connected {
                    connected = false;
                    let _ = tx.send(Event::Link(crate::events::Link::Cloud, false));
                }
                warn!("[cloud] connection error: {}", e);
                tokio::time::sleep(RETRY_PAUSE).await;
            }
            Err(_) => {
                // Timeout - continue loop to check cancel flag
            }
        }
    }

    let _ = client.disconnect().await;
}

/// Parse an inbound publish into a cloud message. Returns `None` for topics
/// outside the device scope and for malformed payloads.
fn parse_inbound(topic: &str, payload: &[u8]) -> Option<CloudMessage> {
    let suffix = topic.rsplit('/').next()?;
    let kind = MessageKind::from_topic_suffix(suffix)?;

    match serde_json::from_slice::<CloudMessage>(payload) {
        Ok(mut msg) => {
            msg.kind = Some(kind);
            Some(msg)
        }
        Err(e) => {
            warn!("[cloud] bad payload on '{}': {}", topic, e);
            None
        }
    }
}

#[async_trait]
impl CloudPort for MqttLink {
    async fn register(&self, id: &str, name: &str) -> Result<(), CloudError> {
        self.ensure_subscribed(id).await?;
        self.publish_json(self.topic(id, "register"), json!({ "id": id, "name": name }))
            .await
    }

    async fn authenticate(&self, id: &str, token: &str) -> Result<(), CloudError> {
        self.ensure_subscribed(id).await?;
        self.publish_json(self.topic(id, "auth"), json!({ "id": id, "token": token }))
            .await
    }

    async fn update_schema(&self, id: &str, schemas: &[SchemaEntry]) -> Result<(), CloudError> {
        self.publish_json(self.topic(id, "schema"), json!({ "schemas": schemas }))
            .await
    }

    async fn publish_data(
        &self,
        id: &str,
        sensor_id: u16,
        value: &Value,
    ) -> Result<(), CloudError> {
        self.publish_json(
            self.topic(id, "data"),
            json!({ "sensor_id": sensor_id, "value": value }),
        )
        .await
    }

    async fn unregister(&self, id: &str) -> Result<(), CloudError> {
        self.publish_json(self.topic(id, "unregister"), json!({ "id": id }))
            .await
    }
}
