// src/machine.rs
//
// Control state machine - sequences registration, authentication, schema
// upload, steady-state operation, and teardown.
//
// The machine consumes one event at a time from the gateway queue. Events
// that do not map to a transition in the current state are logged and
// dropped; handshake replies arriving in a state that did not originate
// them fall out the same way. All cloud and Modbus calls happen through the
// port traits, so tests drive the machine with mock transports.

use log::{debug, error, info, warn};
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::credentials::CredentialStore;
use crate::error::GatewayError;
use crate::events::{Event, SensorWrite};
use crate::io::{CloudPort, ModbusPort};
use crate::poller::ConfigTimers;
use crate::registry::SensorRegistry;
use crate::timeout::TimeoutSlot;

/// Device id width: 16 lowercase hex characters
pub const DEVICE_ID_LEN: usize = 16;
/// Cloud-issued token width
pub const TOKEN_LEN: usize = 40;

/// Handshake reply wait, seconds. One value for register, auth and schema.
const HANDSHAKE_TIMEOUT_SEC: u64 = 10;

/// Control plane state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// One or both transports down
    Disconnected,
    /// Cloud up, no local token, awaiting registration reply
    Registering,
    /// Token present, awaiting authentication reply
    Authenticating,
    /// Authenticated, uploading the declared schema
    Schema,
    /// Steady state: publications flow, inbound requests honored
    Online,
    /// Unregistration in progress
    Unregistering,
    /// Shutdown
    Terminal,
}

/// Device identity: id, cloud-issued token, human-readable name.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    pub id: String,
    pub token: String,
    pub name: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            token: String::new(),
            name: name.into(),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Generate a fresh device id: 8 random bytes as lowercase hex.
    pub fn generate_id(&mut self) {
        let mut bytes = [0u8; DEVICE_ID_LEN / 2];
        rand::rng().fill_bytes(&mut bytes);
        self.id = hex::encode(bytes);
    }
}

/// The control state machine.
pub struct Machine {
    state: State,
    identity: DeviceIdentity,
    registry: Arc<SensorRegistry>,
    cloud: Arc<dyn CloudPort>,
    modbus: Arc<dyn ModbusPort>,
    creds: Arc<dyn CredentialStore>,
    timeout: TimeoutSlot,
    config_timers: ConfigTimers,
    tx: UnboundedSender<Event>,
}

impl Machine {
    pub fn new(
        identity: DeviceIdentity,
        registry: Arc<SensorRegistry>,
        cloud: Arc<dyn CloudPort>,
        modbus: Arc<dyn ModbusPort>,
        creds: Arc<dyn CredentialStore>,
        tx: UnboundedSender<Event>,
    ) -> Self {
        Self {
            state: State::Disconnected,
            identity,
            registry,
            cloud,
            modbus,
            creds,
            timeout: TimeoutSlot::new(tx.clone()),
            config_timers: ConfigTimers::new(),
            tx,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state == State::Terminal
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Stop the session-scoped timers. Part of the ordered shutdown.
    pub fn stop_config(&mut self) {
        self.config_timers.stop();
        self.timeout.remove();
    }

    /// Feed one event through the machine. The only fatal outcome is a
    /// credential store failure while persisting a freshly issued token.
    pub async fn handle(&mut self, event: Event) -> Result<(), GatewayError> {
        if self.state == State::Terminal {
            debug!("[sm] terminal, dropped {:?}", event);
            return Ok(());
        }

        match event {
            Event::NotReady => self.on_not_ready(),
            Event::Ready if self.state == State::Disconnected => self.on_ready().await,
            Event::RegOk(token) if self.state == State::Registering => {
                self.on_reg_ok(token).await?
            }
            Event::RegNotOk | Event::Timeout if self.state == State::Registering => {
                debug!("[sm] registration refused or timed out, retrying");
                self.send_register().await;
            }
            Event::AuthOk if self.state == State::Authenticating => self.on_auth_ok().await,
            Event::AuthNotOk if self.state == State::Authenticating => self.on_auth_not_ok(),
            Event::Timeout if self.state == State::Authenticating => {
                debug!("[sm] authentication timed out, retrying");
                self.send_auth().await;
            }
            Event::SchemaOk if self.state == State::Schema => self.on_schema_ok().await,
            Event::SchemaNotOk | Event::Timeout if self.state == State::Schema => {
                debug!("[sm] schema refused or timed out, retrying");
                self.send_schema().await;
            }
            Event::PubData(ids) if self.state == State::Online => {
                for id in ids {
                    self.publish_one(id).await;
                }
            }
            Event::DataUpdate(writes) if self.state == State::Online => {
                self.apply_updates(writes).await;
            }
            Event::UnregReq if self.state == State::Online => self.on_unregister().await,
            other => {
                debug!("[sm] dropped {:?} in {:?}", other, self.state);
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    async fn on_ready(&mut self) {
        if self.identity.has_token() {
            self.state = State::Authenticating;
            self.send_auth().await;
        } else {
            if self.identity.id.is_empty() {
                self.identity.generate_id();
                info!("[sm] generated device id {}", self.identity.id);
            }
            self.state = State::Registering;
            self.send_register().await;
        }
    }

    async fn send_register(&mut self) {
        if let Err(e) = self
            .cloud
            .register(&self.identity.id, &self.identity.name)
            .await
        {
            error!("[sm] register request failed: {}", e);
        }
        self.timeout.modify(HANDSHAKE_TIMEOUT_SEC);
    }

    async fn on_reg_ok(&mut self, token: String) -> Result<(), GatewayError> {
        if token.len() != TOKEN_LEN {
            warn!(
                "[sm] issued token has unexpected length {} (expected {})",
                token.len(),
                TOKEN_LEN
            );
        }
        // A token that cannot be persisted is unsafe to run with
        self.creds.store(&self.identity.id, &token)?;
        self.identity.token = token;
        info!("[sm] registered as {}", self.identity.id);

        self.state = State::Authenticating;
        self.send_auth().await;
        Ok(())
    }

    async fn send_auth(&mut self) {
        if let Err(e) = self
            .cloud
            .authenticate(&self.identity.id, &self.identity.token)
            .await
        {
            error!("[sm] auth request failed: {}", e);
        }
        self.timeout.modify(HANDSHAKE_TIMEOUT_SEC);
    }

    async fn on_auth_ok(&mut self) {
        self.state = State::Schema;
        self.send_schema().await;
    }

    fn on_auth_not_ok(&mut self) {
        // Stale or revoked token: drop it so the next READY re-registers.
        // The on-disk record is overwritten by that registration.
        warn!("[sm] authentication refused, clearing local token");
        self.identity.token.clear();
        self.timeout.remove();
        self.state = State::Disconnected;
    }

    async fn send_schema(&mut self) {
        let schemas = self.registry.schemas();
        if let Err(e) = self.cloud.update_schema(&self.identity.id, &schemas).await {
            error!("[sm] schema upload failed: {}", e);
        }
        self.timeout.modify(HANDSHAKE_TIMEOUT_SEC);
    }

    async fn on_schema_ok(&mut self) {
        self.timeout.remove();
        self.state = State::Online;
        info!("[sm] session online, {} sensors", self.registry.len());

        self.config_timers.start(&self.registry, &self.tx);

        // Initial snapshot: publish everything the poller has read so far
        let mut ids = self.registry.ids();
        ids.sort_unstable();
        for id in ids {
            self.publish_one(id).await;
        }
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    async fn publish_one(&mut self, id: u16) {
        // Ids with no registry entry are ignored
        let Some(entry) = self.registry.get(id) else {
            debug!("[sm] publish request for undeclared sensor {}", id);
            return;
        };
        // Nothing read yet: nothing to publish
        let Some(value) = entry.current else {
            debug!("[sm] sensor {} has no reading yet", id);
            return;
        };

        match self
            .cloud
            .publish_data(&self.identity.id, id, &value)
            .await
        {
            Ok(()) => self.registry.mark_sent(id, value),
            Err(e) => error!("[sm] publish for sensor {} failed: {}", id, e),
        }
    }

    async fn apply_updates(&mut self, writes: Vec<SensorWrite>) {
        for write in writes {
            let Some(entry) = self.registry.get(write.sensor_id) else {
                warn!("[sm] update for undeclared sensor {}", write.sensor_id);
                continue;
            };
            let Some(value) = write.value.coerce(entry.schema.kind) else {
                warn!(
                    "[sm] update for sensor {} has kind {:?}, expected {:?}",
                    write.sensor_id,
                    write.value.kind(),
                    entry.schema.kind
                );
                continue;
            };
            if let Err(e) = self.modbus.write(entry.source, &value).await {
                error!("[sm] write to sensor {} failed: {}", write.sensor_id, e);
            }
        }
    }

    async fn on_unregister(&mut self) {
        info!("[sm] cloud requested unregistration");
        self.state = State::Unregistering;
        self.timeout.remove();
        self.config_timers.stop();

        if let Err(e) = self.creds.clear() {
            error!("[sm] failed to clear credential store: {}", e);
        }

        // The unregister publication is the acknowledgement
        if let Err(e) = self.cloud.unregister(&self.identity.id).await {
            error!("[sm] unregister ack failed: {}", e);
        }

        self.identity.id.clear();
        self.identity.token.clear();
        self.state = State::Terminal;
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    fn on_not_ready(&mut self) {
        self.timeout.remove();
        self.config_timers.stop();
        if self.state != State::Disconnected {
            info!("[sm] link down, session suspended in {:?}", self.state);
        }
        // Registry entries and sent values survive; the next READY resumes
        // the handshake without losing edge state
        self.state = State::Disconnected;
    }
}
