//! Periodic read, map and apply cycle with its client handle.
//!
//! [`ControlLoop`] owns every piece of mutable control state and runs on a
//! single task. Clients talk to it through a cloneable [`ControlHandle`]:
//! commands travel over an mpsc channel and are applied between ticks, while
//! status snapshots are published on a watch channel so that reading the
//! status never waits for a tick.

use std::{
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    controller::{Hardware, HardwareConnector},
    error::{FanControlError, Result},
    event::{Event, EventBus},
    fan_config::{ConfigStore, FanConfiguration},
    fan_controller::{FanController, FanSpeed},
    fan_curve::CurveFollower,
    sensors::TemperatureReading,
    status::{ControlState, FanMode, FanState, ServiceStatus},
};

pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

/// Tick period while no configuration is active.
const IDLE_PERIOD: Duration = Duration::from_millis(3000);

const COMMAND_QUEUE: usize = 16;

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
pub enum Command {
    Start(Reply),
    Stop(Reply),
    /// Carries a configuration that already passed validation.
    SelectConfiguration(Arc<FanConfiguration>, Reply),
    SetFanSpeed {
        fan: usize,
        speed: FanSpeed,
        reply: Reply,
    },
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Consecutive failed ticks before a fan falls back.
    pub retry_threshold: u32,
    /// Configuration loaded by `start`.
    pub selected_config: Option<String>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            retry_threshold: DEFAULT_RETRY_THRESHOLD,
            selected_config: None,
        }
    }
}

/// Token of the current session, shared so that `stop` can cancel it
/// without waiting for the loop.
type SessionSlot = Arc<Mutex<CancellationToken>>;

fn lock(slot: &SessionSlot) -> MutexGuard<'_, CancellationToken> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Session {
    hardware: Hardware,
    config: Arc<FanConfiguration>,
    cancel: CancellationToken,
}

struct FanRuntime {
    state: FanState,
    follower: CurveFollower,
    faulted: bool,
}

impl FanRuntime {
    fn new(config: &FanConfiguration, fan: usize) -> Self {
        Self {
            state: FanState {
                mode: FanMode::ManualCurve,
                ..FanState::disabled(config.fan_name(fan))
            },
            follower: CurveFollower::new(config.hysteresis)
                .with_critical_temperature(config.critical_temperature),
            faulted: false,
        }
    }

    fn disable(&mut self) {
        self.state = FanState::disabled(mem::take(&mut self.state.name));
        self.follower.reset();
        self.faulted = false;
    }
}

pub struct ControlLoop {
    store: ConfigStore,
    connector: Arc<dyn HardwareConnector>,
    retry_threshold: u32,
    selected: Option<String>,
    session: Option<Session>,
    /// Sessions opened so far.
    opened: u64,
    state: ControlState,
    fans: Vec<FanRuntime>,
    readings: Vec<TemperatureReading>,
    cpu_temperature: Option<f32>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<Arc<ServiceStatus>>,
    session_cancel: SessionSlot,
    events: Option<EventBus>,
}

impl ControlLoop {
    pub fn new(
        store: ConfigStore,
        connector: Arc<dyn HardwareConnector>,
        settings: LoopSettings,
    ) -> (Self, ControlHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status_rx) =
            watch::channel(Arc::new(ServiceStatus::stopped(settings.selected_config.clone())));
        let session_cancel = SessionSlot::default();

        let handle = ControlHandle {
            commands: command_tx,
            status: status_rx,
            session_cancel: session_cancel.clone(),
            store: store.clone(),
        };

        let control = Self {
            store,
            connector,
            retry_threshold: settings.retry_threshold.max(1),
            selected: settings.selected_config,
            session: None,
            opened: 0,
            state: ControlState::Stopped,
            fans: Vec::new(),
            readings: Vec::new(),
            cpu_temperature: None,
            commands: command_rx,
            status: status_tx,
            session_cancel,
            events: None,
        };
        (control, handle)
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Runs until `shutdown` fires or every handle is dropped, then releases
    /// the hardware.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Control loop running");
        let mut period = self.period();
        let mut ticker = schedule(period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    let opened = self.opened;
                    self.process(command).await;
                    if self.opened != opened || self.period() != period {
                        period = self.period();
                        ticker = schedule(period);
                    }
                }
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.stop_session().await;
        self.status.send_replace(Arc::new(ServiceStatus {
            service_available: false,
            ..self.snapshot()
        }));
        info!("Control loop stopped");
    }

    /// Applies one client command.
    pub async fn process(&mut self, command: Command) {
        let (result, reply) = match command {
            Command::Start(reply) => (self.start().await, reply),
            Command::Stop(reply) => {
                self.stop_session().await;
                (Ok(()), reply)
            }
            Command::SelectConfiguration(config, reply) => (self.select(config).await, reply),
            Command::SetFanSpeed { fan, speed, reply } => {
                (self.set_fan_speed(fan, speed).await, reply)
            }
        };

        if let Err(e) = &result {
            warn!("Command failed: {e}");
        }
        let _ = reply.send(result);
    }

    /// One read, map and apply cycle over all fans.
    pub async fn tick(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.cancel.is_cancelled() {
            return;
        }

        let mut readings = Vec::with_capacity(session.hardware.sensors.len());
        let mut sensor_errors = Vec::new();
        for sensor in &session.hardware.sensors {
            match sensor.read().await {
                Ok(reading) => readings.push(reading),
                Err(e) => {
                    warn!("{}: {e}", sensor.label());
                    sensor_errors.push((sensor.index(), e));
                }
            }
        }
        if session.cancel.is_cancelled() {
            return;
        }

        let driver = session.hardware.driver.as_ref();
        let mut new_faults = Vec::new();
        let mut all_ok = true;

        for (fan, runtime) in self.fans.iter_mut().enumerate() {
            if runtime.faulted {
                continue;
            }

            match control_fan(fan, runtime, &session.config, driver, &readings, &sensor_errors).await {
                Ok(()) => {
                    runtime.state.stale = false;
                    runtime.state.consecutive_failures = 0;
                }
                Err(_) if session.cancel.is_cancelled() => return,
                Err(e) => {
                    all_ok = false;
                    runtime.state.stale = true;
                    runtime.state.consecutive_failures += 1;
                    warn!(
                        "fan {fan}: {e} ({}/{})",
                        runtime.state.consecutive_failures, self.retry_threshold
                    );
                    if runtime.state.consecutive_failures >= self.retry_threshold {
                        let automatic = fall_back(fan, runtime, driver).await;
                        new_faults.push((fan, automatic));
                    }
                }
            }
        }

        self.cpu_temperature = readings.iter().map(|r| r.value).reduce(f32::max);
        self.readings = readings;

        if !new_faults.is_empty() {
            if let Some(events) = &self.events {
                for &(fan, automatic) in &new_faults {
                    events.notify(Event::FaultFallback { fan, automatic });
                }
            }
            self.set_state(ControlState::FaultFallback);
        } else if self.state == ControlState::Starting && all_ok {
            self.set_state(ControlState::Running);
        }

        debug!(
            "tick: cpu {:?}°C, targets {:?}",
            self.cpu_temperature,
            self.fans.iter().map(|f| f.state.target).collect::<Vec<_>>()
        );
        self.publish();
    }

    async fn start(&mut self) -> Result<()> {
        match self.state {
            ControlState::Running | ControlState::Starting => {
                debug!("Start ignored, fan control is {}", self.state);
                return Ok(());
            }
            ControlState::FaultFallback => {
                info!("Restarting fan control after fault fallback");
                self.stop_session().await;
            }
            ControlState::Stopped => {}
        }

        let name = self
            .selected
            .clone()
            .ok_or_else(|| FanControlError::invalid("no fan configuration selected"))?;
        let config = self.store.load(&name).await?;
        self.open_session(config).await
    }

    async fn select(&mut self, config: Arc<FanConfiguration>) -> Result<()> {
        info!("Selected fan configuration '{}'", config.name);
        self.selected = Some(config.name.clone());

        match self.state {
            ControlState::Running | ControlState::Starting => {
                self.stop_session().await;
                self.open_session(config).await
            }
            ControlState::Stopped => {
                self.fans = (0..config.fans.len())
                    .map(|fan| FanState::disabled(config.fan_name(fan)))
                    .map(|state| FanRuntime {
                        state,
                        follower: CurveFollower::default(),
                        faulted: false,
                    })
                    .collect();
                self.publish();
                Ok(())
            }
            // The faulted session keeps running until an explicit start.
            ControlState::FaultFallback => {
                self.publish();
                Ok(())
            }
        }
    }

    async fn open_session(&mut self, config: Arc<FanConfiguration>) -> Result<()> {
        let cancel = CancellationToken::new();
        *lock(&self.session_cancel) = cancel.clone();

        let hardware = self.connector.connect(config.clone(), cancel.clone()).await?;
        if let Err(e) = hardware.driver.initialize().await {
            if let Err(release) = hardware.driver.release().await {
                warn!("Failed to release after initialization error: {release}");
            }
            return Err(e);
        }

        self.fans = (0..config.fans.len())
            .map(|fan| FanRuntime::new(&config, fan))
            .collect();
        self.readings.clear();
        self.cpu_temperature = None;
        self.session = Some(Session {
            hardware,
            config,
            cancel,
        });
        self.opened += 1;

        self.set_state(ControlState::Starting);
        self.publish();
        Ok(())
    }

    async fn stop_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        session.cancel.cancel();
        if let Err(e) = session.hardware.driver.release().await {
            error!("Failed to hand fans back to the firmware: {e}");
        }
        drop(session);

        self.fans.iter_mut().for_each(FanRuntime::disable);
        self.readings.clear();
        self.cpu_temperature = None;
        self.set_state(ControlState::Stopped);
        self.publish();
    }

    async fn set_fan_speed(&mut self, fan: usize, speed: FanSpeed) -> Result<()> {
        let Some(session) = self.session.as_ref() else {
            return Err(FanControlError::invalid("fan control is not running"));
        };
        let runtime = self
            .fans
            .get_mut(fan)
            .ok_or_else(|| FanControlError::invalid(format!("fan {fan} does not exist")))?;
        if runtime.faulted {
            return Err(FanControlError::invalid(format!(
                "fan {fan} is in fault fallback, restart fan control first"
            )));
        }

        let driver = session.hardware.driver.as_ref();
        match speed {
            FanSpeed::Percent(percent) => {
                FanSpeed::percent(percent)?;
                driver.apply(fan, percent).await?;
                runtime.state.mode = FanMode::Fixed(percent);
                runtime.state.target = Some(percent);
                runtime.state.applied = Some(percent);
            }
            FanSpeed::Auto => {
                if !driver.set_automatic(fan).await? {
                    return Err(FanControlError::invalid(format!(
                        "fan {fan} has no automatic mode"
                    )));
                }
                runtime.state.mode = FanMode::Automatic;
                runtime.state.target = None;
                runtime.state.applied = None;
            }
        }
        runtime.follower.reset();
        info!("fan {fan} set to {speed}");

        self.publish();
        Ok(())
    }

    fn period(&self) -> Duration {
        self.session
            .as_ref()
            .map_or(IDLE_PERIOD, |s| s.config.polling_interval())
    }

    fn set_state(&mut self, to: ControlState) {
        if self.state == to {
            return;
        }
        let from = mem::replace(&mut self.state, to);
        info!("Fan control {from} -> {to}");
        if let Some(events) = &self.events {
            events.notify(Event::ControlStateChanged { from, to });
        }
    }

    fn snapshot(&self) -> ServiceStatus {
        ServiceStatus {
            state: self.state,
            config_name: self
                .session
                .as_ref()
                .map(|s| s.config.name.clone())
                .or_else(|| self.selected.clone()),
            cpu_temperature: self.cpu_temperature,
            readings: self.readings.clone(),
            fans: self.fans.iter().map(|f| f.state.clone()).collect(),
            service_available: true,
            timestamp: Utc::now(),
        }
    }

    fn publish(&self) {
        self.status.send_replace(Arc::new(self.snapshot()));
    }
}

fn schedule(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn control_fan(
    fan: usize,
    runtime: &mut FanRuntime,
    config: &FanConfiguration,
    driver: &dyn FanController,
    readings: &[TemperatureReading],
    sensor_errors: &[(usize, FanControlError)],
) -> Result<()> {
    let selected = config.fan_sensors(fan);
    let temperature = readings
        .iter()
        .filter(|r| selected.contains(&r.sensor))
        .map(|r| r.value)
        .reduce(f32::max);
    runtime.state.temperature = temperature;

    let target = match runtime.state.mode {
        FanMode::ManualCurve => {
            if let Some((_, e)) = sensor_errors.iter().find(|(s, _)| selected.contains(s)) {
                return Err(e.clone());
            }
            let temperature = temperature
                .ok_or_else(|| FanControlError::invalid(format!("fan {fan} has no sensors")))?;
            Some(runtime.follower.next(&config.fans[fan].curve, temperature))
        }
        FanMode::Fixed(percent) => Some(percent),
        FanMode::Automatic | FanMode::Disabled => None,
    };

    runtime.state.target = target;
    if let Some(target) = target {
        driver.apply(fan, target).await?;
        runtime.follower.commit(target);
        runtime.state.applied = Some(target);
    }
    runtime.state.rpm = driver.read_rpm(fan).await?;
    Ok(())
}

/// Takes a fan out of control; returns whether the firmware took over.
async fn fall_back(fan: usize, runtime: &mut FanRuntime, driver: &dyn FanController) -> bool {
    runtime.faulted = true;
    runtime.follower.reset();
    runtime.state.target = None;

    let automatic = match driver.set_automatic(fan).await {
        Ok(supported) => supported,
        Err(e) => {
            warn!("fan {fan}: automatic mode failed: {e}");
            false
        }
    };

    if automatic {
        runtime.state.mode = FanMode::Automatic;
        error!(
            "fan {fan}: {} consecutive failures, handed back to the firmware",
            runtime.state.consecutive_failures
        );
    } else {
        runtime.state.mode = FanMode::Disabled;
        error!(
            "fan {fan}: {} consecutive failures, left at {:?}%",
            runtime.state.consecutive_failures, runtime.state.applied
        );
    }
    automatic
}

/// Client side of the control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Arc<ServiceStatus>>,
    session_cancel: SessionSlot,
    store: ConfigStore,
}

impl ControlHandle {
    /// Latest published snapshot; never waits for a tick.
    pub fn get_status(&self) -> Arc<ServiceStatus> {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ServiceStatus>> {
        self.status.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.request(Command::Start).await
    }

    /// Cancels in-flight hardware calls immediately, then stops at the next
    /// command boundary.
    pub async fn stop(&self) -> Result<()> {
        lock(&self.session_cancel).cancel();
        self.request(Command::Stop).await
    }

    /// Validates `name` before handing it to the loop.
    pub async fn select_configuration(&self, name: &str) -> Result<()> {
        let config = self.store.load(name).await?;
        self.request(|reply| Command::SelectConfiguration(config, reply))
            .await
    }

    pub async fn set_fan_speed(&self, fan: usize, speed: FanSpeed) -> Result<()> {
        if let FanSpeed::Percent(p) = speed {
            FanSpeed::percent(p)?;
        }
        self.request(|reply| Command::SetFanSpeed { fan, speed, reply })
            .await
    }

    pub async fn list_configurations(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    async fn request(&self, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let unavailable = || FanControlError::ServiceUnavailable("control loop is not running".into());
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| unavailable())?;
        response.await.map_err(|_| unavailable())?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        controller::{EcBackend, EcConnector},
        drivers::MemoryEc,
        fan_config::tests::TWO_FANS,
    };
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const CPU_TEMP: u8 = 104;
    const GPU_TEMP: u8 = 105;
    const CPU_FAN: u8 = 148;
    const GPU_FAN: u8 = 150;
    const CPU_RPM: u8 = 132;

    /// Counts sessions that are still open.
    #[derive(Debug)]
    struct TrackedDriver {
        inner: Box<dyn FanController>,
        open: Arc<AtomicUsize>,
    }

    impl Drop for TrackedDriver {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FanController for TrackedDriver {
        fn fan_count(&self) -> usize {
            self.inner.fan_count()
        }
        async fn initialize(&self) -> Result<()> {
            self.inner.initialize().await
        }
        async fn apply(&self, fan: usize, percent: f32) -> Result<()> {
            self.inner.apply(fan, percent).await
        }
        async fn read_speed(&self, fan: usize) -> Result<f32> {
            self.inner.read_speed(fan).await
        }
        async fn read_rpm(&self, fan: usize) -> Result<Option<u32>> {
            self.inner.read_rpm(fan).await
        }
        async fn set_automatic(&self, fan: usize) -> Result<bool> {
            self.inner.set_automatic(fan).await
        }
        async fn release(&self) -> Result<()> {
            self.inner.release().await
        }
    }

    struct TrackingConnector {
        inner: EcConnector,
        open: Arc<AtomicUsize>,
        opened: AtomicUsize,
    }

    #[async_trait]
    impl HardwareConnector for TrackingConnector {
        async fn connect(
            &self,
            config: Arc<FanConfiguration>,
            cancel: CancellationToken,
        ) -> Result<Hardware> {
            let hw = self.inner.connect(config, cancel).await?;
            self.open.fetch_add(1, Ordering::SeqCst);
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Hardware {
                sensors: hw.sensors,
                driver: Box::new(TrackedDriver {
                    inner: hw.driver,
                    open: self.open.clone(),
                }),
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        ec: Arc<MemoryEc>,
        connector: Arc<TrackingConnector>,
        control: ControlLoop,
        handle: ControlHandle,
    }

    fn fixture() -> Fixture {
        fixture_with_timeout(Duration::from_millis(200))
    }

    fn fixture_with_timeout(io_timeout: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("testbook.yml"), TWO_FANS).unwrap();
        std::fs::write(
            dir.path().join("quiet.yml"),
            TWO_FANS.replace("speed: 30", "speed: 10"),
        )
        .unwrap();

        let ec = Arc::new(MemoryEc::new());
        ec.set(CPU_TEMP, 45);
        ec.set(GPU_TEMP, 45);

        let connector = Arc::new(TrackingConnector {
            inner: EcConnector::new(EcBackend::Memory(ec.clone()), io_timeout),
            open: Arc::new(AtomicUsize::new(0)),
            opened: AtomicUsize::new(0),
        });
        let (control, handle) = ControlLoop::new(
            ConfigStore::new(dir.path()),
            connector.clone(),
            LoopSettings {
                retry_threshold: 3,
                selected_config: Some("testbook".into()),
            },
        );

        Fixture {
            _dir: dir,
            ec,
            connector,
            control,
            handle,
        }
    }

    async fn send(control: &mut ControlLoop, command: impl FnOnce(Reply) -> Command) -> Result<()> {
        let (reply, response) = oneshot::channel();
        control.process(command(reply)).await;
        response.await.unwrap()
    }

    fn status(handle: &ControlHandle) -> Arc<ServiceStatus> {
        handle.get_status()
    }

    #[tokio::test]
    async fn first_successful_tick_enters_running() {
        let mut f = fixture();

        send(&mut f.control, Command::Start).await.unwrap();
        assert_eq!(f.control.state(), ControlState::Starting);
        assert_eq!(f.ec.get(147), 20, "initialization write");

        f.control.tick().await;
        let s = status(&f.handle);
        assert_eq!(s.state, ControlState::Running);
        assert_eq!(s.config_name.as_deref(), Some("testbook"));
        assert_eq!(s.cpu_temperature, Some(45.0));
        assert_eq!(s.fans[0].target, Some(30.0));
        assert_eq!(s.fans[0].mode, FanMode::ManualCurve);
        assert_eq!(f.ec.get(CPU_FAN), 60);
        assert_eq!(f.ec.get(GPU_FAN), 20);
    }

    #[tokio::test]
    async fn start_stop_start_repeats_lifecycle_without_leaking() {
        let mut f = fixture();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        f.control = f.control.with_events(events);

        for _ in 0..2 {
            send(&mut f.control, Command::Start).await.unwrap();
            f.control.tick().await;
            send(&mut f.control, Command::Stop).await.unwrap();
            assert_eq!(f.connector.open.load(Ordering::SeqCst), 0);
            assert_eq!(f.ec.get(CPU_FAN), 255, "reset value written on release");
        }

        let mut transitions = Vec::new();
        while let Ok(Event::ControlStateChanged { to, .. }) = rx.try_recv() {
            transitions.push(to);
        }
        use ControlState::*;
        assert_eq!(
            transitions,
            vec![Starting, Running, Stopped, Starting, Running, Stopped]
        );
        assert_eq!(f.connector.opened.load(Ordering::SeqCst), 2);

        let s = status(&f.handle);
        assert!(s.fans.iter().all(|fan| fan.mode == FanMode::Disabled));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let mut f = fixture();

        send(&mut f.control, Command::Stop).await.unwrap();
        send(&mut f.control, Command::Start).await.unwrap();
        send(&mut f.control, Command::Start).await.unwrap();
        assert_eq!(f.connector.opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hysteresis_holds_speed_on_small_drops() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();

        let mut targets = Vec::new();
        for temp in [45, 58, 42] {
            f.ec.set(CPU_TEMP, temp);
            f.control.tick().await;
            targets.push(status(&f.handle).fans[0].target);
        }
        assert_eq!(targets, vec![Some(30.0), Some(30.0), Some(30.0)]);

        f.ec.set(CPU_TEMP, 65);
        f.control.tick().await;
        f.ec.set(CPU_TEMP, 59);
        f.control.tick().await;
        assert_eq!(status(&f.handle).fans[0].target, Some(60.0));
    }

    #[tokio::test]
    async fn failed_write_does_not_count_as_applied() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;
        assert_eq!(f.ec.get(CPU_FAN), 60);

        f.ec.fail_writes(CPU_FAN, true);
        f.ec.set(CPU_TEMP, 65);
        f.control.tick().await;
        assert!(status(&f.handle).fans[0].stale);

        // 60 % never reached the fan, so 59 °C is not held at 60 %.
        f.ec.fail_writes(CPU_FAN, false);
        f.ec.set(CPU_TEMP, 59);
        f.control.tick().await;
        let s = status(&f.handle);
        assert!(!s.fans[0].stale);
        assert_eq!(s.fans[0].target, Some(30.0));
        assert_eq!(s.fans[0].applied, Some(30.0));
    }

    #[tokio::test]
    async fn repeated_driver_failures_fall_back_one_fan() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;

        f.ec.fail_reads(CPU_RPM, true);
        for expected in 1..=2 {
            f.control.tick().await;
            let s = status(&f.handle);
            assert_eq!(s.state, ControlState::Running);
            assert!(s.fans[0].stale);
            assert_eq!(s.fans[0].consecutive_failures, expected);
        }

        f.control.tick().await;
        let s = status(&f.handle);
        assert_eq!(s.state, ControlState::FaultFallback);
        assert!(s.fans[0].stale);
        assert_eq!(s.fans[0].mode, FanMode::Automatic);
        assert_eq!(f.ec.get(CPU_FAN), 255);
        assert!(!s.fans[1].stale);
        assert_eq!(s.fans[1].mode, FanMode::ManualCurve);

        // The healthy fan keeps following its curve.
        f.ec.set(GPU_TEMP, 75);
        f.control.tick().await;
        let s = status(&f.handle);
        assert_eq!(s.state, ControlState::FaultFallback);
        assert_eq!(s.fans[1].target, Some(80.0));
        assert_eq!(f.ec.get(GPU_FAN), 80);
        assert_eq!(f.ec.get(CPU_FAN), 255);
    }

    #[tokio::test]
    async fn fan_without_automatic_mode_stays_at_last_speed() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;

        f.ec.fail_writes(GPU_FAN, true);
        for _ in 0..3 {
            f.control.tick().await;
        }

        let s = status(&f.handle);
        assert_eq!(s.state, ControlState::FaultFallback);
        assert_eq!(s.fans[1].mode, FanMode::Disabled);
        assert_eq!(s.fans[1].applied, Some(20.0));
        assert!(!s.fans[0].stale);
    }

    #[tokio::test]
    async fn start_recovers_from_fault_fallback() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.ec.fail_reads(CPU_RPM, true);
        for _ in 0..3 {
            f.control.tick().await;
        }
        assert_eq!(f.control.state(), ControlState::FaultFallback);

        f.ec.fail_reads(CPU_RPM, false);
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;

        let s = status(&f.handle);
        assert_eq!(s.state, ControlState::Running);
        assert_eq!(s.fans[0].mode, FanMode::ManualCurve);
        assert_eq!(f.connector.open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_sensor_marks_only_its_fans_stale() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();

        f.ec.fail_reads(GPU_TEMP, true);
        f.control.tick().await;

        let s = status(&f.handle);
        assert!(!s.fans[0].stale);
        assert!(s.fans[1].stale);
        assert_eq!(s.readings.len(), 1);
        assert_eq!(s.state, ControlState::Starting);
    }

    #[tokio::test]
    async fn fixed_speed_overrides_curve_until_reload() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;

        send(&mut f.control, |reply| Command::SetFanSpeed {
            fan: 0,
            speed: FanSpeed::Percent(50.0),
            reply,
        })
        .await
        .unwrap();
        assert_eq!(status(&f.handle).fans[0].mode, FanMode::Fixed(50.0));
        assert_eq!(f.ec.get(CPU_FAN), 100);

        f.ec.set(CPU_TEMP, 85);
        f.control.tick().await;
        assert_eq!(status(&f.handle).fans[0].applied, Some(50.0));

        let config = f.control.store.load("testbook").await.unwrap();
        send(&mut f.control, |reply| Command::SelectConfiguration(config, reply))
            .await
            .unwrap();
        f.control.tick().await;
        assert_eq!(status(&f.handle).fans[0].mode, FanMode::ManualCurve);
        assert_eq!(status(&f.handle).fans[0].target, Some(100.0));
    }

    #[tokio::test]
    async fn automatic_request_needs_reset_value() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();

        let auto = |fan| {
            move |reply| Command::SetFanSpeed {
                fan,
                speed: FanSpeed::Auto,
                reply,
            }
        };
        send(&mut f.control, auto(0)).await.unwrap();
        assert_eq!(status(&f.handle).fans[0].mode, FanMode::Automatic);

        let err = send(&mut f.control, auto(1)).await.unwrap_err();
        assert!(matches!(err, FanControlError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn set_fan_speed_requires_running_control() {
        let mut f = fixture();
        let err = send(&mut f.control, |reply| Command::SetFanSpeed {
            fan: 0,
            speed: FanSpeed::Percent(50.0),
            reply,
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FanControlError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn selecting_while_running_switches_configuration() {
        let mut f = fixture();
        send(&mut f.control, Command::Start).await.unwrap();
        f.control.tick().await;

        let quiet = f.control.store.load("quiet").await.unwrap();
        send(&mut f.control, |reply| Command::SelectConfiguration(quiet, reply))
            .await
            .unwrap();
        f.control.tick().await;

        let s = status(&f.handle);
        assert_eq!(s.config_name.as_deref(), Some("quiet"));
        assert_eq!(s.fans[0].target, Some(10.0));
        assert_eq!(f.connector.open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_without_selection_is_invalid() {
        let dir = TempDir::new().unwrap();
        let connector = Arc::new(EcConnector::new(
            EcBackend::Memory(Arc::new(MemoryEc::new())),
            Duration::from_millis(100),
        ));
        let (mut control, handle) =
            ControlLoop::new(ConfigStore::new(dir.path()), connector, LoopSettings::default());

        let err = send(&mut control, Command::Start).await.unwrap_err();
        assert!(matches!(err, FanControlError::InvalidConfiguration(_)));
        assert_eq!(handle.get_status().state, ControlState::Stopped);
    }

    #[tokio::test]
    async fn handle_drives_running_loop() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.control.run(shutdown.clone()));
        let handle = f.handle;

        handle.start().await.unwrap();
        let mut rx = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.state == ControlState::Running),
        )
        .await
        .unwrap()
        .unwrap();

        handle.set_fan_speed(0, FanSpeed::Percent(50.0)).await.unwrap();
        let s = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.fans[0].mode == FanMode::Fixed(50.0)),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        assert_eq!(s.fans[0].applied, Some(50.0));

        assert!(handle.select_configuration("missing").await.is_err());
        assert!(handle.set_fan_speed(0, FanSpeed::Percent(150.0)).await.is_err());
        assert_eq!(handle.get_status().config_name.as_deref(), Some("testbook"));
        assert_eq!(handle.list_configurations().await.unwrap(), vec!["quiet", "testbook"]);

        handle.stop().await.unwrap();
        assert_eq!(handle.get_status().state, ControlState::Stopped);

        shutdown.cancel();
        task.await.unwrap();
        assert!(!handle.get_status().service_available);
        assert!(matches!(
            handle.start().await.unwrap_err(),
            FanControlError::ServiceUnavailable(_)
        ));
        assert_eq!(f.connector.open.load(Ordering::SeqCst), 0);
    }

    async fn running_loop(handle: &ControlHandle) -> watch::Receiver<Arc<ServiceStatus>> {
        handle.start().await.unwrap();
        let mut rx = handle.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| s.state == ControlState::Running),
        )
        .await
        .unwrap()
        .unwrap();
        rx
    }

    fn fan_writes(ec: &MemoryEc, register: u8) -> Vec<u8> {
        ec.writes()
            .into_iter()
            .filter(|(r, _)| *r == register)
            .map(|(_, v)| v)
            .collect()
    }

    #[tokio::test]
    async fn stop_interrupts_stalled_tick_and_resets_last() {
        const POLL: Duration = Duration::from_millis(200);
        const STALL: Duration = Duration::from_millis(800);

        let f = fixture_with_timeout(Duration::from_secs(5));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.control.run(shutdown.clone()));
        running_loop(&f.handle).await;

        f.ec.stall_next_write(CPU_FAN, STALL);
        // A tick starts within one period and hangs on the fan write.
        tokio::time::sleep(POLL + Duration::from_millis(200)).await;

        let begun = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(5), f.handle.stop())
            .await
            .unwrap()
            .unwrap();
        let elapsed = begun.elapsed();

        // Only the stalled write is waited for, not the rest of the tick.
        assert!(elapsed < STALL, "stop took {elapsed:?}");
        assert_eq!(f.handle.get_status().state, ControlState::Stopped);
        assert_eq!(f.connector.open.load(Ordering::SeqCst), 0);

        tokio::time::sleep(STALL).await;
        assert_eq!(f.ec.get(CPU_FAN), 255);
        assert_eq!(fan_writes(&f.ec, CPU_FAN).last(), Some(&255));

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn repeated_commands_do_not_speed_up_ticks() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(f.control.run(shutdown.clone()));
        running_loop(&f.handle).await;

        let before = fan_writes(&f.ec, CPU_FAN).len();
        for _ in 0..10 {
            f.handle.start().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let ticks = fan_writes(&f.ec, CPU_FAN).len() - before;
        assert!(ticks <= 2, "{ticks} ticks during 10 no-op starts");

        f.handle.stop().await.unwrap();
        shutdown.cancel();
        task.await.unwrap();
    }
}
