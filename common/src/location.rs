#[cfg(feature = "defmt")]
use defmt::{error, info, warn};
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;
#[cfg(not(feature = "defmt"))]
use log::{error, info, warn};

use crate::error::Error;

/// Upper bound on cellular observations per location request.
pub const MAX_CELL_OBSERVATIONS: usize = 4;

/// Radio access technology of an observed cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellRat {
    LteCatM,
    NbIot,
}

/// One observed cellular network cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CellObservation {
    pub rat: CellRat,
    pub mcc: u16,
    pub mnc: u16,
    pub cell_id: u32,
}

/// Accumulator of cellular observations for one resolution request.
///
/// Built fresh every sample tick and either finalized into a resolvable
/// request or discarded.
#[derive(Default)]
pub struct LocationRequest {
    observations: Vec<CellObservation, MAX_CELL_OBSERVATIONS>,
}

impl LocationRequest {
    pub fn new() -> Self {
        Self {
            observations: Vec::new(),
        }
    }

    /// Appends one observation; fails when the request is full.
    pub fn append(&mut self, observation: CellObservation) -> crate::Result<()> {
        self.observations
            .push(observation)
            .map_err(|_| Error::BufferExhausted)
    }

    /// Finalizes the request.
    ///
    /// An empty request yields [`Error::NoLocationData`]: a normal skip
    /// condition, not a failure.
    pub fn finish(&self) -> crate::Result<()> {
        if self.observations.is_empty() {
            return Err(Error::NoLocationData);
        }
        Ok(())
    }

    /// Observations in append order.
    pub fn observations(&self) -> &[CellObservation] {
        &self.observations
    }
}

/// Resolved coordinates in nanodegrees, accuracy in meters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LocationFix {
    pub latitude: i64,
    pub longitude: i64,
    pub accuracy: i64,
}

/// Source of cellular network observations, typically the modem.
pub trait CellScanner {
    /// Returns the currently visible cells, best first.
    fn scan(
        &mut self,
    ) -> impl Future<Output = crate::Result<Vec<CellObservation, MAX_CELL_OBSERVATIONS>>>;
}

/// Remote service resolving cellular observations into coordinates.
pub trait LocationResolver {
    /// Resolves `request`, waiting at most `timeout` for the response.
    fn resolve(
        &mut self,
        request: &LocationRequest,
        timeout: Duration,
    ) -> impl Future<Output = crate::Result<LocationFix>>;
}

impl<R: LocationResolver> LocationResolver for &mut R {
    async fn resolve(
        &mut self,
        request: &LocationRequest,
        timeout: Duration,
    ) -> crate::Result<LocationFix> {
        (**self).resolve(request, timeout).await
    }
}

/// Configuration of the location sampling task.
#[derive(Clone, Debug)]
pub struct LocationConfig {
    /// Delay before the first sample after boot.
    pub start_delay: Duration,
    /// Fixed period between two sample ticks.
    pub sample_interval: Duration,
    /// Upper bound on one resolution round trip.
    pub resolve_timeout: Duration,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(30),
            sample_interval: Duration::from_secs(60),
            resolve_timeout: Duration::from_secs(10),
        }
    }
}

/// Periodic sampler feeding cellular observations to the resolution service.
///
/// Runs decoupled from the telemetry cycle on its own fixed interval.
pub struct LocationSampler<S: CellScanner, R: LocationResolver> {
    scanner: S,
    resolver: R,
    config: LocationConfig,
}

impl<S: CellScanner, R: LocationResolver> LocationSampler<S, R> {
    pub fn new(scanner: S, resolver: R, config: LocationConfig) -> Self {
        Self {
            scanner,
            resolver,
            config,
        }
    }

    /// Gathers observations and submits them for resolution.
    ///
    /// A resolution timeout or failure is logged and absorbed; a failed scan
    /// or an empty result aborts the tick with the corresponding error.
    pub async fn sample_once(&mut self) -> crate::Result<()> {
        let mut request = LocationRequest::new();
        let observations = self
            .scanner
            .scan()
            .await
            .inspect_err(|err| error!("Failed to get cellular network info: {}", err))?;
        for observation in observations {
            request.append(observation)?;
        }
        request.finish()?;

        match self
            .resolver
            .resolve(&request, self.config.resolve_timeout)
            .await
        {
            Ok(fix) => info!(
                "Location: {}, {} (accuracy {} m)",
                fix.latitude as f64 / 1e9,
                fix.longitude as f64 / 1e9,
                fix.accuracy,
            ),
            Err(err) => warn!("Location resolution failed: {}", err),
        }
        Ok(())
    }

    /// Runs the sampler forever on its fixed interval.
    ///
    /// A tick takes exactly `sample_interval` when the work finishes early; an
    /// overrunning tick is followed immediately by the next one. No tick
    /// outcome terminates the loop.
    pub async fn run(&mut self) {
        info!("Location tracking module has started");
        Timer::after(self.config.start_delay).await;
        loop {
            let deadline = Instant::now() + self.config.sample_interval;
            if let Err(err) = self.sample_once().await {
                match err {
                    Error::NoLocationData => warn!("No location data available"),
                    err => error!("Location sampling failed: {}", err),
                }
            }
            // Wait out any remaining time on the sample interval.
            Timer::at(deadline).await;
        }
    }
}

/// Scanner double returning a fixed set of observations.
pub struct FakeScanner {
    pub observations: Vec<CellObservation, MAX_CELL_OBSERVATIONS>,
    pub failing: bool,
}

impl FakeScanner {
    pub fn new(observations: &[CellObservation]) -> Self {
        Self {
            observations: Vec::from_slice(observations).unwrap(),
            failing: false,
        }
    }
}

impl CellScanner for FakeScanner {
    async fn scan(&mut self) -> crate::Result<Vec<CellObservation, MAX_CELL_OBSERVATIONS>> {
        if self.failing {
            return Err(Error::SensorFault);
        }
        Ok(self.observations.clone())
    }
}

/// Resolver double recording each request it receives.
pub struct FakeResolver {
    pub fix: LocationFix,
    pub succeed: bool,
    pub requests: Vec<Vec<CellObservation, MAX_CELL_OBSERVATIONS>, 4>,
    pub last_timeout: Option<Duration>,
}

impl FakeResolver {
    pub fn new(fix: LocationFix) -> Self {
        Self {
            fix,
            succeed: true,
            requests: Vec::new(),
            last_timeout: None,
        }
    }
}

impl LocationResolver for FakeResolver {
    async fn resolve(
        &mut self,
        request: &LocationRequest,
        timeout: Duration,
    ) -> crate::Result<LocationFix> {
        let _ = self
            .requests
            .push(Vec::from_slice(request.observations()).unwrap());
        self.last_timeout = Some(timeout);
        if self.succeed {
            Ok(self.fix)
        } else {
            Err(Error::Timeout)
        }
    }
}
