//! Per-battery poll loop.
//!
//! Each discovered battery gets its own [`Poller`] running at the driver's interval. A
//! failing battery is marked offline after a while (unless its last known cells still
//! look safe) and dropped entirely once it has been silent for too long. Batteries never
//! share a poller, so one bad link cannot stall the others.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::battery_state::Battery;
use crate::bms::{Bms, Probed};
use crate::charge_limits::{ChargeController, ChargeLimits};
use crate::config::{BatteryConfig, Config, PollConfig};
use crate::error::{Error, Result};
use crate::settings::SettingsStore;

/// Where a poll result goes: a bus, a file, a dashboard.
pub trait PublishSink: Send {
    fn publish(&mut self, battery: &Battery, limits: Option<&ChargeLimits>);
}

/// Logs a JSON snapshot of every successful poll.
#[derive(Debug, Default)]
pub struct LogSink;

impl PublishSink for LogSink {
    fn publish(&mut self, battery: &Battery, limits: Option<&ChargeLimits>) {
        if !battery.online {
            warn!("{} offline", battery.address);
            return;
        }
        let summary = serde_json::json!({
            "address": battery.address,
            "soc": battery.soc,
            "voltage": battery.voltage,
            "current": battery.current,
            "min_cell": battery.min_cell_desc(),
            "min_cell_voltage": battery.min_cell_voltage(),
            "max_cell": battery.max_cell_desc(),
            "max_cell_voltage": battery.max_cell_voltage(),
            "temperature": battery.temperature(),
            "remaining_ah": battery.remaining_capacity(),
            "alarm": battery.protection.worst(),
            "limits": limits,
        });
        info!("{summary}");
        if let Ok(full) = serde_json::to_string(battery) {
            debug!("{full}");
        }
    }
}

pub struct Poller {
    bms: Box<dyn Bms>,
    battery: Battery,
    controller: ChargeController,
    store: Box<dyn SettingsStore>,
    sink: Box<dyn PublishSink>,
    poll: PollConfig,
    limits_config: BatteryConfig,
    limits: Option<ChargeLimits>,
    last_success: Instant,
    failures: u32,
}

impl Poller {
    /// Take over a probed battery. The charge hysteresis persisted for it is loaded from
    /// `store`.
    pub fn new(
        probed: Probed,
        config: &Config,
        store: Box<dyn SettingsStore>,
        sink: Box<dyn PublishSink>,
    ) -> Result<Self> {
        let Probed { bms, battery } = probed;
        let controller = ChargeController::load(config, store.as_ref(), battery.settings_id())?;
        Ok(Self {
            bms,
            battery,
            controller,
            store,
            sink,
            poll: config.poll.clone(),
            limits_config: config.battery.clone(),
            limits: None,
            last_success: Instant::now(),
            failures: 0,
        })
    }

    pub fn battery(&self) -> &Battery {
        &self.battery
    }

    pub fn limits(&self) -> Option<ChargeLimits> {
        self.limits
    }

    pub fn controller(&self) -> &ChargeController {
        &self.controller
    }

    pub fn poll_interval(&self) -> Duration {
        self.bms.poll_interval()
    }

    /// One refresh. Recoverable errors are returned as they are; [`Error::GaveUp`] once
    /// the battery has been failing for longer than the give-up time.
    pub async fn poll_once(&mut self) -> Result<()> {
        match self.bms.refresh(&mut self.battery).await {
            Ok(()) => {
                if !self.battery.online {
                    info!("{} back online after {} failed polls", self.battery.address, self.failures);
                }
                self.last_success = Instant::now();
                self.failures = 0;
                self.battery.online = true;
                self.battery.record_current_sample();

                self.limits = self.controller.update(&self.battery, Utc::now());
                if let Err(err) = self.controller.save(self.store.as_mut()) {
                    warn!("{}: saving charge state failed: {err}", self.battery.address);
                }
                self.sink.publish(&self.battery, self.limits.as_ref());
                Ok(())
            }
            Err(err) => {
                self.failures += 1;
                let silent_for = self.last_success.elapsed();
                warn!(
                    "{}: poll failed ({} in a row, {:?} since last success): {err}",
                    self.battery.address, self.failures, silent_for
                );
                if silent_for >= self.poll.give_up_after() {
                    return Err(Error::GaveUp(silent_for));
                }
                let safe = self
                    .battery
                    .cells_look_safe(self.limits_config.min_cell_voltage, self.limits_config.max_cell_voltage);
                if silent_for >= self.poll.offline_after() && self.battery.online && !safe {
                    warn!("{}: marking offline", self.battery.address);
                    self.battery.online = false;
                    self.sink.publish(&self.battery, None);
                }
                Err(err)
            }
        }
    }

    /// Poll at the driver's interval until cancelled or given up on.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.bms.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("{}: polling {} every {:?}", self.battery.address, self.bms.kind(), self.bms.poll_interval());

        let result = loop {
            tokio::select! {
                _ = token.cancelled() => break Ok(()),
                _ = interval.tick() => {}
            }
            match self.poll_once().await {
                Err(err @ Error::GaveUp(_)) => break Err(err),
                Err(err) if !err.is_recoverable() => break Err(err),
                _ => {}
            }
        };

        if let Err(err) = self.bms.close().await {
            debug!("{}: close failed: {err}", self.battery.address);
        }
        info!("{}: poller stopped", self.battery.address);
        result
    }
}

/// Run every poller concurrently until all have stopped. Returns each battery's address
/// with the reason its poller ended.
pub async fn run_all(pollers: Vec<Poller>, token: CancellationToken) -> Vec<(String, Result<()>)> {
    let mut tasks = JoinSet::new();
    for poller in pollers {
        let address = poller.battery.address.clone();
        let token = token.clone();
        tasks.spawn(async move { (address, poller.run(token).await) });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((address, result)) => {
                if let Err(err) = &result {
                    warn!("{address}: {err}");
                }
                outcomes.push((address, result));
            }
            Err(err) => warn!("poller task failed: {err}"),
        }
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::settings::MemoryStore;

    /// A driver whose refresh succeeds while `healthy` is set.
    struct ScriptedBms {
        healthy: Arc<AtomicBool>,
        refreshes: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Bms for ScriptedBms {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        fn poll_interval(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn test_connection(&mut self, _battery: &mut Battery) -> Result<()> {
            Ok(())
        }

        async fn get_settings(&mut self, _battery: &mut Battery) -> Result<()> {
            Ok(())
        }

        async fn refresh(&mut self, battery: &mut Battery) -> Result<()> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(Error::TransportTimeout(Duration::from_millis(500)));
            }
            battery.soc = Some(99.0);
            battery.current = Some(4.0);
            battery.mark_settled();
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<(bool, Option<ChargeLimits>)>>>);

    impl PublishSink for RecordingSink {
        fn publish(&mut self, battery: &Battery, limits: Option<&ChargeLimits>) {
            if let Ok(mut seen) = self.0.lock() {
                seen.push((battery.online, limits.copied()));
            }
        }
    }

    struct Rig {
        poller: Poller,
        healthy: Arc<AtomicBool>,
        refreshes: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        sink: RecordingSink,
    }

    fn rig(cells: &[f64]) -> Rig {
        let healthy = Arc::new(AtomicBool::new(true));
        let refreshes = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let bms = ScriptedBms { healthy: healthy.clone(), refreshes: refreshes.clone(), closed: closed.clone() };

        let mut battery = Battery::new("scripted:0");
        battery.set_cell_count(cells.len());
        for (cell, v) in battery.cells.iter_mut().zip(cells) {
            cell.voltage = Some(*v);
        }
        battery.voltage = Some(cells.iter().sum());

        let sink = RecordingSink::default();
        let poller = Poller::new(
            Probed { bms: Box::new(bms), battery },
            &Config::default(),
            Box::new(MemoryStore::new()),
            Box::new(sink.clone()),
        )
        .unwrap();
        Rig { poller, healthy, refreshes, closed, sink }
    }

    #[tokio::test(start_paused = true)]
    async fn successful_poll_publishes_limits() {
        let mut rig = rig(&[3.3; 4]);
        rig.poller.poll_once().await.unwrap();

        let limits = rig.poller.limits().unwrap();
        assert_eq!(limits.control_charge_current, 5.0);
        assert_eq!(rig.poller.battery().current_average(), Some(4.0));
        let seen = rig.sink.0.lock().unwrap().clone();
        assert_eq!(seen, vec![(true, Some(limits))]);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_after_sustained_failure() {
        let mut rig = rig(&[3.0, 3.0, 3.0, 2.5]);
        rig.poller.poll_once().await.unwrap();
        rig.healthy.store(false, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(rig.poller.poll_once().await.unwrap_err().is_timeout());
        assert!(rig.poller.battery().online);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(rig.poller.poll_once().await.is_err());
        assert!(!rig.poller.battery().online);

        rig.healthy.store(true, Ordering::SeqCst);
        rig.poller.poll_once().await.unwrap();
        assert!(rig.poller.battery().online);
    }

    #[tokio::test(start_paused = true)]
    async fn safe_cells_stay_online() {
        let mut rig = rig(&[3.3; 4]);
        rig.poller.poll_once().await.unwrap();
        rig.healthy.store(false, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(rig.poller.poll_once().await.is_err());
        assert!(rig.poller.battery().online);
    }

    #[tokio::test(start_paused = true)]
    async fn run_gives_up_and_closes() {
        let rig = rig(&[3.3; 4]);
        rig.healthy.store(false, Ordering::SeqCst);
        let err = rig.poller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::GaveUp(d) if d >= Duration::from_secs(60)));
        assert!(rig.closed.load(Ordering::SeqCst));
        // one poll per second until the minute is up
        assert!(rig.refreshes.load(Ordering::SeqCst) >= 60);
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_stops_on_cancel() {
        let first = rig(&[3.3; 4]);
        let second = rig(&[3.3; 4]);
        let (closed_a, closed_b) = (first.closed.clone(), second.closed.clone());
        let refreshes = first.refreshes.clone();
        let token = CancellationToken::new();

        let running = tokio::spawn(run_all(vec![first.poller, second.poller], token.clone()));
        tokio::time::sleep(Duration::from_millis(3500)).await;
        token.cancel();
        let outcomes = running.await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, result)| result.is_ok()));
        assert!(closed_a.load(Ordering::SeqCst) && closed_b.load(Ordering::SeqCst));
        assert_eq!(refreshes.load(Ordering::SeqCst), 4);
    }
}
