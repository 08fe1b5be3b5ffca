// src/io/modbus_tcp.rs
//
// Modbus TCP link - typed register access plus a connection supervisor.
//
// Architecture:
//   - The supervisor task owns the connection lifecycle: connect to the
//     slave, report the link up, wait for loss, report it down, reconnect
//     with a fixed backoff until cancelled.
//   - Read/write operations share the client context behind a Mutex. A
//     Modbus exception is an operation error and leaves the link alone; an
//     I/O error drops the context and wakes the supervisor.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_modbus::client::{self, tcp};
use tokio_modbus::prelude::*;

use super::{decode_value, encode_numeric, register_count, ModbusPort};
use crate::error::ModbusError;
use crate::events::{Event, Link};
use crate::registry::{ModbusSource, Value, ValueKind};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const CANCEL_POLL: Duration = Duration::from_millis(500);

/// Modbus TCP link configuration
#[derive(Clone, Debug)]
pub struct ModbusTcpConfig {
    /// Slave URL, e.g. "tcp://10.0.0.17:502"
    pub url: String,
    /// Modbus unit/slave ID (1-247)
    pub slave_id: u8,
}

/// Parse a "tcp://host:port" slave URL. Bad URLs are a fatal init error.
fn parse_slave_url(url: &str) -> Result<SocketAddr, String> {
    let rest = url
        .strip_prefix("tcp://")
        .ok_or_else(|| format!("unsupported modbus url '{}': expected tcp://host:port", url))?;
    rest.parse()
        .map_err(|e| format!("invalid modbus address '{}': {}", rest, e))
}

struct Shared {
    addr: SocketAddr,
    slave: Slave,
    ctx: Mutex<Option<client::Context>>,
    /// Signalled when an operation drops the context after an I/O error
    lost: Notify,
}

/// Modbus TCP link - connection supervisor plus typed register access
pub struct ModbusLink {
    shared: Arc<Shared>,
    cancel: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ModbusLink {
    pub fn new(config: &ModbusTcpConfig) -> Result<Self, String> {
        let addr = parse_slave_url(&config.url)?;
        Ok(Self {
            shared: Arc::new(Shared {
                addr,
                slave: Slave(config.slave_id),
                ctx: Mutex::new(None),
                lost: Notify::new(),
            }),
            cancel: Arc::new(AtomicBool::new(false)),
            supervisor: Mutex::new(None),
        })
    }

    /// Spawn the connection supervisor. Link edges land in `tx`.
    pub async fn start(&self, tx: UnboundedSender<Event>) {
        self.cancel.store(false, Ordering::Relaxed);

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            supervise(shared, cancel, tx).await;
        });
        *self.supervisor.lock().await = Some(handle);
    }

    /// Stop the supervisor and drop the connection.
    pub async fn stop(&self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.shared.lost.notify_waiters();
        if let Some(handle) = self.supervisor.lock().await.take() {
            let _ = handle.await;
        }
        *self.shared.ctx.lock().await = None;
        info!("[modbus] stopped");
    }
}

async fn supervise(shared: Arc<Shared>, cancel: Arc<AtomicBool>, tx: UnboundedSender<Event>) {
    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        match tcp::connect_slave(shared.addr, shared.slave).await {
            Ok(ctx) => {
                *shared.ctx.lock().await = Some(ctx);
                info!("[modbus] connected to {} (unit {})", shared.addr, shared.slave.0);
                let _ = tx.send(Event::Link(Link::Modbus, true));

                // Wait for an operation to drop the context, or for stop
                loop {
                    tokio::select! {
                        _ = shared.lost.notified() => break,
                        _ = tokio::time::sleep(CANCEL_POLL) => {
                            if cancel.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                    }
                }
                if cancel.load(Ordering::Relaxed) {
                    break;
                }

                warn!("[modbus] connection to {} lost", shared.addr);
                let _ = tx.send(Event::Link(Link::Modbus, false));
            }
            Err(e) => {
                debug!("[modbus] connect to {} failed: {}", shared.addr, e);
            }
        }

        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

impl Shared {
    /// Drop the context after an I/O failure and wake the supervisor.
    fn mark_lost(&self, guard: &mut Option<client::Context>) {
        *guard = None;
        self.lost.notify_waiters();
    }
}

#[async_trait]
impl ModbusPort for ModbusLink {
    async fn read(&self, source: ModbusSource, kind: ValueKind) -> Result<Value, ModbusError> {
        let mut guard = self.shared.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        // tokio-modbus read methods return Result<Result<Vec<u16>, Exception>>
        // Outer Result = IO error, Inner Result = Modbus exception
        match ctx
            .read_holding_registers(source.register, register_count(kind))
            .await
        {
            Ok(Ok(regs)) => decode_value(kind, source, &regs),
            Ok(Err(exc)) => Err(ModbusError::Exception(exc.to_string())),
            Err(e) => {
                self.shared.mark_lost(&mut guard);
                Err(ModbusError::Io(e.to_string()))
            }
        }
    }

    async fn write(&self, source: ModbusSource, value: &Value) -> Result<(), ModbusError> {
        let mut guard = self.shared.ctx.lock().await;
        let ctx = guard.as_mut().ok_or(ModbusError::NotConnected)?;

        match value {
            Value::Bool(on) => {
                // Read-modify-write the register holding the bit
                let current = match ctx.read_holding_registers(source.register, 1).await {
                    Ok(Ok(regs)) if !regs.is_empty() => regs[0],
                    Ok(Ok(_)) => {
                        return Err(ModbusError::ShortRead {
                            register: source.register,
                            expected: 1,
                            got: 0,
                        })
                    }
                    Ok(Err(exc)) => return Err(ModbusError::Exception(exc.to_string())),
                    Err(e) => {
                        self.shared.mark_lost(&mut guard);
                        return Err(ModbusError::Io(e.to_string()));
                    }
                };
                let updated = if *on {
                    current | (1 << source.bit_offset)
                } else {
                    current & !(1 << source.bit_offset)
                };
                match ctx.write_single_register(source.register, updated).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(exc)) => Err(ModbusError::Exception(exc.to_string())),
                    Err(e) => {
                        self.shared.mark_lost(&mut guard);
                        Err(ModbusError::Io(e.to_string()))
                    }
                }
            }
            numeric => {
                // encode_numeric only returns None for Bool, handled above
                let regs = encode_numeric(numeric).expect("numeric value");
                match ctx.write_multiple_registers(source.register, &regs).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(exc)) => Err(ModbusError::Exception(exc.to_string())),
                    Err(e) => {
                        self.shared.mark_lost(&mut guard);
                        Err(ModbusError::Io(e.to_string()))
                    }
                }
            }
        }
    }
}
