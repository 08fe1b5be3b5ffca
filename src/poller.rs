// src/poller.rs
//
// Periodic sampler - one recurring poll task per sensor.
//
// Each tick reads the sensor's Modbus source, runs the change evaluator
// against the registry snapshot, records the fresh reading, and emits a
// PUB_DATA event when a rule triggers. Read failures are logged and the
// schedule continues. The tasks exist for the gateway's whole lifetime;
// start/stop gate whether ticks do work, so a restart resumes at the next
// natural tick.
//
// ConfigTimers is the companion service armed while the session is online:
// per-sensor periodic publication timers for every sensor carrying a time
// rule, forcing publication even when no value rule triggers.

use log::warn;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant};

use crate::events::Event;
use crate::io::ModbusPort;
use crate::registry::SensorRegistry;
use crate::rules::{self, Decision};

/// Periodic sampler over all declared sensors.
pub struct Poller {
    tasks: Vec<JoinHandle<()>>,
    active: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
}

impl Poller {
    /// Spawn one poll task per declared sensor. Tasks idle until `start`.
    pub fn create(
        registry: Arc<SensorRegistry>,
        modbus: Arc<dyn ModbusPort>,
        tx: UnboundedSender<Event>,
    ) -> Self {
        let active = Arc::new(AtomicBool::new(false));
        let cancel = Arc::new(AtomicBool::new(false));

        let mut tasks = Vec::new();
        for (id, period) in registry.poll_intervals() {
            tasks.push(tokio::spawn(poll_task(
                id,
                period,
                registry.clone(),
                modbus.clone(),
                tx.clone(),
                active.clone(),
                cancel.clone(),
            )));
        }

        Self {
            tasks,
            active,
            cancel,
        }
    }

    /// Arm all schedules.
    pub fn start(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// Pause all schedules. Ticks keep arriving but do no work.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// Cancel the poll tasks. Shutdown only.
    pub async fn destroy(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn poll_task(
    id: u16,
    period: Duration,
    registry: Arc<SensorRegistry>,
    modbus: Arc<dyn ModbusPort>,
    tx: UnboundedSender<Event>,
    active: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
) {
    let mut timer = interval(period);
    loop {
        timer.tick().await;

        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if !active.load(Ordering::Relaxed) {
            continue;
        }

        if let Err(e) = poll_once(id, &registry, modbus.as_ref(), &tx).await {
            warn!("[poll] sensor {}: {}", id, e);
        }
    }
}

/// One poll tick for one sensor. Errors are reported to the schedule, which
/// logs them and keeps ticking.
async fn poll_once(
    id: u16,
    registry: &SensorRegistry,
    modbus: &dyn ModbusPort,
    tx: &UnboundedSender<Event>,
) -> Result<(), String> {
    // Absent id: the tick is dropped
    let Some(sample) = registry.sample(id) else {
        return Ok(());
    };

    let value = modbus
        .read(sample.source, sample.kind)
        .await
        .map_err(|e| e.to_string())?;

    let decision = rules::evaluate(
        &sample.rules,
        &value,
        sample.previous.as_ref(),
        sample.sent.as_ref(),
        sample.elapsed,
    )
    .map_err(|e| e.to_string())?;

    // Every reading lands in the registry so threshold edges track the
    // latest value; the sent value only advances at publication time.
    registry.update_current(id, value);

    if decision == Decision::Publish {
        let _ = tx.send(Event::PubData(vec![id]));
    }

    Ok(())
}

/// Per-sensor periodic publication timers, armed while the session is
/// online. Each fires PUB_DATA at the sensor's `time` rule interval.
#[derive(Default)]
pub struct ConfigTimers {
    tasks: Vec<JoinHandle<()>>,
}

impl ConfigTimers {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Arm timers for every sensor carrying a time rule. The first firing is
    /// one full interval out; the online snapshot already published.
    pub fn start(&mut self, registry: &SensorRegistry, tx: &UnboundedSender<Event>) {
        self.stop();
        for (id, secs) in registry.timed_ids() {
            let tx = tx.clone();
            let period = Duration::from_secs(secs);
            self.tasks.push(tokio::spawn(async move {
                let mut timer = interval_at(Instant::now() + period, period);
                loop {
                    timer.tick().await;
                    let _ = tx.send(Event::PubData(vec![id]));
                }
            }));
        }
    }

    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }
}

impl Drop for ConfigTimers {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModbusError;
    use crate::io::ModbusPort;
    use crate::registry::{
        ModbusSource, PublishRules, SensorSchema, Value, ValueKind,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// Modbus port fed from a script of readings; errors once exhausted.
    struct ScriptedModbus {
        readings: StdMutex<VecDeque<Value>>,
    }

    impl ScriptedModbus {
        fn new(values: &[Value]) -> Arc<Self> {
            Arc::new(Self {
                readings: StdMutex::new(values.iter().copied().collect()),
            })
        }
    }

    #[async_trait]
    impl ModbusPort for ScriptedModbus {
        async fn read(
            &self,
            _source: ModbusSource,
            _kind: ValueKind,
        ) -> Result<Value, ModbusError> {
            self.readings
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(ModbusError::NotConnected)
        }

        async fn write(&self, _source: ModbusSource, _value: &Value) -> Result<(), ModbusError> {
            Ok(())
        }
    }

    fn registry_with_change_sensor(id: u16) -> Arc<SensorRegistry> {
        let registry = SensorRegistry::new();
        registry.insert(
            id,
            SensorSchema {
                kind: ValueKind::Int,
                unit: String::new(),
                name: format!("s{}", id),
            },
            PublishRules {
                change: true,
                ..Default::default()
            },
            ModbusSource {
                register: 0,
                bit_offset: 0,
            },
            Duration::from_secs(1),
        );
        Arc::new(registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_edge_publishes_once() {
        let registry = registry_with_change_sensor(7);
        // Sent seeded as if the online snapshot already ran
        registry.mark_sent(7, Value::Int(10));

        let modbus = ScriptedModbus::new(&[Value::Int(10), Value::Int(10), Value::Int(11)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut poller = Poller::create(registry.clone(), modbus, tx);
        poller.start();

        assert_eq!(rx.recv().await, Some(Event::PubData(vec![7])));
        // Script exhausted: reads fail, no further publications
        let extra = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(extra.is_err());

        // Current tracked the last reading even though sent did not advance
        assert_eq!(registry.get(7).unwrap().current, Some(Value::Int(11)));

        poller.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_poller_does_not_read() {
        let registry = registry_with_change_sensor(1);
        let modbus = ScriptedModbus::new(&[Value::Int(5)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut poller = Poller::create(registry.clone(), modbus, tx);
        // Never started: ticks arrive but do nothing
        let quiet = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(quiet.is_err());
        assert_eq!(registry.get(1).unwrap().current, None);

        poller.start();
        assert_eq!(rx.recv().await, Some(Event::PubData(vec![1])));

        poller.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_timers_fire_pub_data() {
        let registry = SensorRegistry::new();
        registry.insert(
            4,
            SensorSchema {
                kind: ValueKind::Float,
                unit: String::new(),
                name: "timed".to_string(),
            },
            PublishRules {
                time_sec: Some(30),
                ..Default::default()
            },
            ModbusSource {
                register: 0,
                bit_offset: 0,
            },
            Duration::from_secs(1),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timers = ConfigTimers::new();
        timers.start(&registry, &tx);
        assert!(timers.is_running());

        assert_eq!(rx.recv().await, Some(Event::PubData(vec![4])));
        assert_eq!(rx.recv().await, Some(Event::PubData(vec![4])));

        timers.stop();
        let quiet = tokio::time::timeout(Duration::from_secs(90), rx.recv()).await;
        assert!(quiet.is_err());
    }
}
