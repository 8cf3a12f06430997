use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "defmt")]
use defmt::{debug, error, info};
use embassy_time::Instant;
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info};

use crate::error::Error;

/// Constant-current charging bits of the charger status register.
pub const CHARGER_STATUS_CC_MASK: u32 = 0b111;

static VBUS_CONNECTED: AtomicBool = AtomicBool::new(false);

/// Records a cable insertion/removal edge.
///
/// The single writer of the VBUS flag; meant to be called from the charger
/// event callback context.
pub fn vbus_event(connected: bool) {
    VBUS_CONNECTED.store(connected, Ordering::Release);
    debug!("Vbus connected: {}", connected);
}

/// Latest known cable state.
pub fn vbus_connected() -> bool {
    VBUS_CONNECTED.load(Ordering::Acquire)
}

/// One fetched set of charger sensor readings.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChargerSample {
    pub voltage: f32,
    pub current: f32,
    pub temperature: f32,
    /// Raw charger status register.
    pub status: u32,
}

/// Battery state snapshot, overwritten on every sample tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryState {
    pub voltage: f32,
    pub current: f32,
    pub temperature: f32,
    pub charge_pct: f32,
    pub time_to_empty_s: f32,
    pub time_to_full_s: f32,
}

/// Charger sensor access, typically backed by the PMIC driver.
pub trait Charger {
    /// Fetches a fresh set of sensor samples.
    fn sample(&mut self) -> impl Future<Output = crate::Result<ChargerSample>>;
    /// Charge current the charger is configured to aim for.
    fn desired_charge_current(&mut self) -> impl Future<Output = crate::Result<f32>>;
    /// Cable state as reported by the charger, read once at init.
    fn vbus_present(&mut self) -> impl Future<Output = crate::Result<bool>>;
}

/// The external charge-estimation primitives, treated as a black box.
pub trait ChargeEstimator {
    /// Primes the estimator with initial voltage, current and temperature.
    fn init(&mut self, voltage: f32, current: f32, temperature: f32);
    /// Feeds one sample into the estimator, returning the charge percentage.
    fn process(
        &mut self,
        voltage: f32,
        current: f32,
        temperature: f32,
        delta_s: f32,
        vbus_connected: bool,
    ) -> f32;
    fn time_to_empty(&mut self) -> f32;
    fn time_to_full(&mut self, cc_charging: bool, term_current: f32) -> f32;
}

/// Battery state estimator on top of the charger sensor and the external
/// charge-estimation function.
///
/// Owns the elapsed-time bookkeeping and the charge-current thresholds; the
/// charger and estimator are passed in per call.
pub struct FuelGauge {
    max_charge_current: f32,
    term_charge_current: f32,
    reference_time: Instant,
}

impl FuelGauge {
    /// Initializes the estimator from one sensor fetch.
    ///
    /// Reads the priors and the desired charge current, derives the
    /// termination current and seeds the VBUS flag with the current cable
    /// state.
    pub async fn init(
        charger: &mut impl Charger,
        estimator: &mut impl ChargeEstimator,
    ) -> crate::Result<Self> {
        let sample = charger.sample().await.map_err(|_| Error::DeviceNotReady)?;
        let max_charge_current = charger
            .desired_charge_current()
            .await
            .map_err(|_| Error::DeviceNotReady)?;
        estimator.init(sample.voltage, sample.current, sample.temperature);

        let vbus = charger.vbus_present().await.map_err(|_| Error::DeviceNotReady)?;
        VBUS_CONNECTED.store(vbus, Ordering::Release);
        info!("Fuel gauge initialized, Vbus connected: {}", vbus);

        Ok(Self {
            max_charge_current,
            term_charge_current: max_charge_current / 10.0,
            reference_time: Instant::now(),
        })
    }

    /// Charge current the battery is charged with at full rate.
    pub fn max_charge_current(&self) -> f32 {
        self.max_charge_current
    }

    /// Charge current below which charging terminates.
    pub fn term_charge_current(&self) -> f32 {
        self.term_charge_current
    }

    /// Monotonic reference used for Δt bookkeeping, advanced on every update.
    pub fn reference_time(&self) -> Instant {
        self.reference_time
    }

    /// Produces a fresh battery state snapshot.
    pub async fn update(
        &mut self,
        charger: &mut impl Charger,
        estimator: &mut impl ChargeEstimator,
    ) -> crate::Result<BatteryState> {
        self.update_at(charger, estimator, Instant::now()).await
    }

    /// Like [`Self::update`], with an explicit sample time.
    pub async fn update_at(
        &mut self,
        charger: &mut impl Charger,
        estimator: &mut impl ChargeEstimator,
        now: Instant,
    ) -> crate::Result<BatteryState> {
        let sample = charger.sample().await.map_err(|_| {
            error!("Could not fetch charger samples");
            Error::SensorFault
        })?;

        let delta_ms = now.as_millis().saturating_sub(self.reference_time.as_millis());
        let delta = delta_ms as f32 / 1000.0;
        self.reference_time = now;

        let cc_charging = (sample.status & CHARGER_STATUS_CC_MASK) != 0;
        let charge_pct = estimator.process(
            sample.voltage,
            sample.current,
            sample.temperature,
            delta,
            vbus_connected(),
        );
        let state = BatteryState {
            voltage: sample.voltage,
            current: sample.current,
            temperature: sample.temperature,
            charge_pct,
            time_to_empty_s: estimator.time_to_empty(),
            time_to_full_s: estimator.time_to_full(cc_charging, -self.term_charge_current),
        };
        debug!(
            "V: {}, I: {}, SoC: {}, TTE: {}, TTF: {}",
            state.voltage, state.current, state.charge_pct, state.time_to_empty_s,
            state.time_to_full_s
        );
        Ok(state)
    }
}

/// Charger double driven by fixed readings.
pub struct FakeCharger {
    pub next_sample: ChargerSample,
    pub desired_current: f32,
    pub vbus: bool,
    pub failing: bool,
}

impl FakeCharger {
    pub fn new(next_sample: ChargerSample, desired_current: f32) -> Self {
        Self {
            next_sample,
            desired_current,
            vbus: false,
            failing: false,
        }
    }
}

impl Charger for FakeCharger {
    async fn sample(&mut self) -> crate::Result<ChargerSample> {
        if self.failing {
            return Err(Error::SensorFault);
        }
        Ok(self.next_sample)
    }

    async fn desired_charge_current(&mut self) -> crate::Result<f32> {
        Ok(self.desired_current)
    }

    async fn vbus_present(&mut self) -> crate::Result<bool> {
        Ok(self.vbus)
    }
}

/// Estimator double recording the arguments of the last calls.
#[derive(Default)]
pub struct RecordingEstimator {
    pub init_args: Option<(f32, f32, f32)>,
    pub process_args: Option<(f32, f32, f32, f32, bool)>,
    pub ttf_args: Option<(bool, f32)>,
    pub charge_pct: f32,
    pub tte: f32,
    pub ttf: f32,
}

impl ChargeEstimator for RecordingEstimator {
    fn init(&mut self, voltage: f32, current: f32, temperature: f32) {
        self.init_args = Some((voltage, current, temperature));
    }

    fn process(
        &mut self,
        voltage: f32,
        current: f32,
        temperature: f32,
        delta_s: f32,
        vbus_connected: bool,
    ) -> f32 {
        self.process_args = Some((voltage, current, temperature, delta_s, vbus_connected));
        self.charge_pct
    }

    fn time_to_empty(&mut self) -> f32 {
        self.tte
    }

    fn time_to_full(&mut self, cc_charging: bool, term_current: f32) -> f32 {
        self.ttf_args = Some((cc_charging, term_current));
        self.ttf
    }
}
