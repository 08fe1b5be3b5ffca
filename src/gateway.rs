// src/gateway.rs
//
// Gateway assembly - wires the transports, poller, tracker and state
// machine to one event queue and runs the control loop.
//
// Everything shares a single unbounded mpsc queue. Link supervisors report
// raw edges; the loop folds them through the connectivity tracker (gating
// the poller on the Modbus edge, as the original gates its schedules on the
// slave connection) and hands the resulting READY / NOT_READY to the state
// machine, so the machine observes every edge in arrival order.

use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::connectivity::ConnectivityTracker;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::error::GatewayError;
use crate::events::{Event, Link};
use crate::io::{ModbusLink, ModbusTcpConfig, MqttCloudConfig, MqttLink};
use crate::machine::{DeviceIdentity, Machine, DEVICE_ID_LEN};
use crate::poller::Poller;
use crate::settings::GatewaySettings;

/// Run the gateway until the session terminates or the process is
/// interrupted. Fatal errors unwind every started collaborator before
/// surfacing.
pub async fn run(settings: GatewaySettings) -> Result<(), GatewayError> {
    let registry = Arc::new(settings.build_registry());

    // Stored credentials decide whether the first handshake registers or
    // authenticates
    let creds: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(&settings.credentials_path));
    let mut identity = DeviceIdentity::new(settings.name.clone());
    match creds.load() {
        Ok(Some(stored)) => {
            if stored.id.len() == DEVICE_ID_LEN {
                info!("loaded credentials for device {}", stored.id);
                identity.id = stored.id;
                identity.token = stored.token;
            } else {
                warn!(
                    "ignoring credential record with malformed id '{}'",
                    stored.id
                );
            }
        }
        Ok(None) => info!("no stored credentials, device will register"),
        Err(e) => return Err(GatewayError::Credentials(e)),
    }

    let (tx, mut rx) = mpsc::unbounded_channel();

    // Transport init errors are fatal; later failures unwind earlier starts
    let modbus = Arc::new(
        ModbusLink::new(&ModbusTcpConfig {
            url: settings.modbus.url.clone(),
            slave_id: settings.modbus.slave_id,
        })
        .map_err(GatewayError::Init)?,
    );
    let cloud = Arc::new(
        MqttLink::new(&MqttCloudConfig {
            url: settings.cloud.url.clone(),
            device_name: settings.name.clone(),
            user_token: settings.cloud.user_token.clone(),
        })
        .map_err(GatewayError::Init)?,
    );

    // Poll tasks exist for the whole run; they idle until the Modbus link
    // comes up
    let mut poller = Poller::create(registry.clone(), modbus.clone(), tx.clone());

    modbus.start(tx.clone()).await;
    if let Err(e) = cloud.start(tx.clone()).await {
        poller.destroy().await;
        modbus.stop().await;
        registry.clear();
        return Err(GatewayError::Init(e));
    }

    info!("device \"{}\" has started successfully", settings.name);

    let mut tracker = ConnectivityTracker::new();
    let mut machine = Machine::new(
        identity,
        registry.clone(),
        cloud.clone(),
        modbus.clone(),
        creds,
        tx.clone(),
    );

    let result = run_loop(&mut rx, &mut machine, &mut tracker, &poller).await;

    // Ordered shutdown: config-stop, poll-destroy, cloud-stop, modbus-stop,
    // registry-destroy
    machine.stop_config();
    poller.destroy().await;
    cloud.stop().await;
    modbus.stop().await;
    registry.clear();

    result
}

async fn run_loop(
    rx: &mut mpsc::UnboundedReceiver<Event>,
    machine: &mut Machine,
    tracker: &mut ConnectivityTracker,
    poller: &Poller,
) -> Result<(), GatewayError> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                match event {
                    Event::Link(link, up) => {
                        // The poller follows the slave link: schedules run
                        // whenever the slave is reachable, regardless of the
                        // cloud's state
                        if link == Link::Modbus {
                            if up {
                                poller.start();
                            } else {
                                poller.stop();
                            }
                        }
                        let edge = tracker.update(link, up);
                        machine.handle(edge).await?;
                    }
                    other => machine.handle(other).await?,
                }
                if machine.is_terminal() {
                    info!("session terminated");
                    break;
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupt received, shutting down");
                break;
            }
        }
    }

    Ok(())
}
