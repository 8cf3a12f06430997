#[cfg(feature = "defmt")]
use defmt::{debug, error, info, warn};
use embassy_futures::select::{Either, select};
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
#[cfg(not(feature = "defmt"))]
use log::{debug, error, info, warn};

use crate::RawMutex;
use crate::cbor::Encoder;
use crate::fuel_gauge::{BatteryState, ChargeEstimator, Charger, FuelGauge};
use crate::status::{ModemInfo, ModemReadout, reset_reason_string, startup_report};
use crate::uplink::{CONNECTION_EVENTS, ContentType, TxCounters, Uplink};

/// Logical path periodic sensor frames are streamed to.
pub const SENSOR_PATH: &str = "sensor";
/// Logical path for the one-shot device state report.
pub const DEVICE_STATE_PATH: &str = "device/state";

/// Capacity of one encoded telemetry frame.
pub const FRAME_CAPACITY: usize = 256;

const TOP_MAP_ENTRIES: u64 = 2;
const MODEM_MAP_ENTRIES: u64 = 4;
const BATTERY_MAP_ENTRIES: u64 = 5;

/// Encodes one telemetry frame into `buf`, returning the payload length.
///
/// The layout is part of the wire contract: a two-entry top-level map holding
/// the modem and battery sub-maps, keys in exactly this order. A sub-step that
/// does not fit fails the whole frame and nothing is transmitted for the cycle.
pub fn encode_frame(
    modem: &ModemReadout,
    counters: (u32, u32),
    battery: &BatteryState,
    buf: &mut [u8],
) -> crate::Result<usize> {
    let (success, failure) = counters;
    let mut enc = Encoder::new(buf);

    enc.map(TOP_MAP_ENTRIES)?;

    enc.text("modem")?;
    enc.map(MODEM_MAP_ENTRIES)?;
    enc.text("vbat")?;
    enc.int(modem.vbat_mv.into())?;
    enc.text("temp")?;
    enc.int(modem.temp_c.into())?;
    enc.text("success")?;
    enc.uint(success.into())?;
    enc.text("fail")?;
    enc.uint(failure.into())?;

    enc.text("battery")?;
    enc.map(BATTERY_MAP_ENTRIES)?;
    enc.text("V")?;
    enc.float64(battery.voltage.into())?;
    enc.text("I")?;
    enc.float64(battery.current.into())?;
    enc.text("SoC")?;
    enc.float64(battery.charge_pct.into())?;
    enc.text("tte")?;
    enc.float64(battery.time_to_empty_s.into())?;
    enc.text("ttf")?;
    enc.float64(battery.time_to_full_s.into())?;

    Ok(enc.finish())
}

/// Configuration of the periodic telemetry cycle.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Pause between two acquisition cycles.
    pub loop_delay: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            loop_delay: Duration::from_secs(60),
        }
    }
}

/// Commands accepted by the telemetry loop between cycles.
pub enum TelemetryCommand {
    /// Replaces the inter-cycle delay; wakes the loop if it is sleeping.
    SetLoopDelay(Duration),
}

/// Channel feeding [`TelemetryCommand`]s to the running loop.
pub static COMMAND_CHANNEL: Channel<RawMutex, TelemetryCommand, 4> = Channel::new();

/// Telemetry acquisition and upload pipeline.
///
/// Owns the sensor collaborators and the uplink; one instance drives the whole
/// periodic cycle. The counter pair lives for the process lifetime and is
/// shared with the completion handler.
pub struct Telemetry<C: Charger, E: ChargeEstimator, M: ModemInfo, U: Uplink> {
    gauge: FuelGauge,
    charger: C,
    estimator: E,
    modem: M,
    uplink: U,
    counters: &'static TxCounters,
    config: TelemetryConfig,
}

impl<C: Charger, E: ChargeEstimator, M: ModemInfo, U: Uplink> Telemetry<C, E, M, U> {
    pub fn new(
        gauge: FuelGauge,
        charger: C,
        estimator: E,
        modem: M,
        uplink: U,
        counters: &'static TxCounters,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            gauge,
            charger,
            estimator,
            modem,
            uplink,
            counters,
            config,
        }
    }

    async fn read_modem(&mut self) -> crate::Result<ModemReadout> {
        let vbat_mv = self
            .modem
            .battery_voltage()
            .await
            .inspect_err(|err| error!("Modem voltage read failed: {}", err))?;
        info!("Modem voltage: {} mV", vbat_mv);

        let temp_c = self
            .modem
            .temperature()
            .await
            .inspect_err(|err| error!("Modem temperature read failed: {}", err))?;
        info!("Modem temperature: {} degC", temp_c);

        Ok(ModemReadout { vbat_mv, temp_c })
    }

    /// Runs one acquisition cycle: read, encode and, when a session is up,
    /// stream the frame.
    ///
    /// A failed upload is not resent; the next cycle builds a fresh frame
    /// carrying the updated counters.
    pub async fn read_and_stream(&mut self) -> crate::Result<()> {
        let modem = self.read_modem().await?;
        let battery = self
            .gauge
            .update(&mut self.charger, &mut self.estimator)
            .await?;

        let mut buf = [0u8; FRAME_CAPACITY];
        let len = encode_frame(&modem, self.counters.snapshot(), &battery, &mut buf)
            .inspect_err(|_| error!("Failed to encode telemetry frame"))?;

        if self.uplink.is_connected() {
            self.uplink
                .publish(SENSOR_PATH, ContentType::Cbor, &buf[..len])
                .await
                .inspect_err(|err| error!("Failed to send sensor data: {}", err))?;
        } else {
            debug!("No connection available, skipping sending sensor data");
        }
        Ok(())
    }

    /// Sends the one-shot startup report with the raw reset reason.
    pub async fn report_startup(&mut self, reset_reason: u32) -> crate::Result<()> {
        let reason = reset_reason_string(reset_reason);
        info!("Reset reason: {} (0x{:x})", reason.as_str(), reset_reason);

        let report = startup_report(reset_reason)?;
        self.uplink
            .publish(DEVICE_STATE_PATH, ContentType::Json, report.as_bytes())
            .await
            .inspect(|_| info!("Sent device state report"))
            .inspect_err(|err| error!("Failed to send device state report: {}", err))
    }

    async fn wait_connected(&mut self) {
        while !self.uplink.is_connected() {
            if let Err(err) = self.uplink.reconnect().await {
                error!("Reconnect request failed: {}", err);
            }
            while !CONNECTION_EVENTS.wait().await {}
        }
    }

    /// Drives the acquire → encode → publish cycle forever.
    ///
    /// Blocks until the uplink session is up, sends the one-shot startup
    /// report, then runs one cycle per `loop_delay`, re-establishing
    /// connectivity whenever it drops. Cycle failures are logged and skipped;
    /// nothing terminates the loop.
    pub async fn run(&mut self, reset_reason: u32) {
        match self.modem.firmware_version().await {
            Ok(version) => info!("Modem firmware version: {}", version.as_str()),
            Err(err) => warn!("Could not read modem firmware version: {}", err),
        }

        self.wait_connected().await;
        if let Err(err) = self.report_startup(reset_reason).await {
            error!("Startup report failed: {}", err);
        }

        loop {
            if !self.uplink.is_connected() {
                debug!("Connection lost, reconnecting...");
                self.wait_connected().await;
            }

            if let Err(err) = self.read_and_stream().await {
                error!("Telemetry cycle failed: {}", err);
            }

            match select(
                Timer::after(self.config.loop_delay),
                COMMAND_CHANNEL.receive(),
            )
            .await
            {
                Either::First(()) => {}
                Either::Second(TelemetryCommand::SetLoopDelay(delay)) => {
                    info!("Loop delay set to {} s", delay.as_secs());
                    self.config.loop_delay = delay;
                }
            }
        }
    }
}

#[cfg(feature = "std")]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cbor::Reader;
    use crate::error::Error;
    use crate::fuel_gauge::{ChargerSample, FakeCharger, RecordingEstimator};
    use crate::status::FakeModemInfo;
    use crate::uplink::{FakeUplink, PUBLISH_REPORTS, PublishStatus};
    use embassy_futures::block_on;

    fn expect_key(reader: &mut Reader<'_>, key: &str) -> crate::Result<()> {
        if reader.text()? != key {
            return Err(Error::ParseError);
        }
        Ok(())
    }

    fn decode_frame(buf: &[u8]) -> crate::Result<(ModemReadout, (u32, u32), BatteryState)> {
        let mut reader = Reader::new(buf);

        if reader.map()? != TOP_MAP_ENTRIES {
            return Err(Error::ParseError);
        }

        expect_key(&mut reader, "modem")?;
        if reader.map()? != MODEM_MAP_ENTRIES {
            return Err(Error::ParseError);
        }
        expect_key(&mut reader, "vbat")?;
        let vbat_mv = reader.int()? as i32;
        expect_key(&mut reader, "temp")?;
        let temp_c = reader.int()? as i32;
        expect_key(&mut reader, "success")?;
        let success = u32::try_from(reader.int()?).map_err(|_| Error::ParseError)?;
        expect_key(&mut reader, "fail")?;
        let failure = u32::try_from(reader.int()?).map_err(|_| Error::ParseError)?;

        expect_key(&mut reader, "battery")?;
        if reader.map()? != BATTERY_MAP_ENTRIES {
            return Err(Error::ParseError);
        }
        expect_key(&mut reader, "V")?;
        let voltage = reader.float64()? as f32;
        expect_key(&mut reader, "I")?;
        let current = reader.float64()? as f32;
        expect_key(&mut reader, "SoC")?;
        let charge_pct = reader.float64()? as f32;
        expect_key(&mut reader, "tte")?;
        let time_to_empty_s = reader.float64()? as f32;
        expect_key(&mut reader, "ttf")?;
        let time_to_full_s = reader.float64()? as f32;

        if reader.remaining() != 0 {
            return Err(Error::ParseError);
        }
        Ok((
            ModemReadout { vbat_mv, temp_c },
            (success, failure),
            BatteryState {
                voltage,
                current,
                temperature: 0.0,
                charge_pct,
                time_to_empty_s,
                time_to_full_s,
            },
        ))
    }

    fn battery() -> BatteryState {
        BatteryState {
            voltage: 3.7,
            current: -0.5,
            temperature: 25.0,
            charge_pct: 87.5,
            time_to_empty_s: 3600.0,
            time_to_full_s: 0.0,
        }
    }

    fn telemetry<'a>(
        uplink: &'a mut FakeUplink,
        modem: FakeModemInfo,
        counters: &'static TxCounters,
    ) -> Telemetry<FakeCharger, RecordingEstimator, FakeModemInfo, &'a mut FakeUplink> {
        let sample = ChargerSample {
            voltage: 3.7,
            current: -0.5,
            temperature: 25.0,
            status: 0,
        };
        let mut charger = FakeCharger::new(sample, 0.8);
        let mut estimator = RecordingEstimator {
            charge_pct: 87.5,
            tte: 3600.0,
            ..Default::default()
        };
        let gauge = block_on(FuelGauge::init(&mut charger, &mut estimator)).unwrap();
        Telemetry::new(
            gauge,
            charger,
            estimator,
            modem,
            uplink,
            counters,
            TelemetryConfig::default(),
        )
    }

    #[test]
    fn frame_round_trip() {
        let modem = ModemReadout {
            vbat_mv: 3600,
            temp_c: -4,
        };
        let mut buf = [0u8; FRAME_CAPACITY];
        let len = encode_frame(&modem, (5, 2), &battery(), &mut buf).unwrap();

        let (decoded_modem, counters, decoded_battery) = decode_frame(&buf[..len]).unwrap();
        assert_eq!(decoded_modem, modem);
        assert_eq!(counters, (5, 2));
        assert_eq!(decoded_battery.voltage, 3.7);
        assert_eq!(decoded_battery.current, -0.5);
        assert_eq!(decoded_battery.charge_pct, 87.5);
        assert_eq!(decoded_battery.time_to_empty_s, 3600.0);
        assert_eq!(decoded_battery.time_to_full_s, 0.0);
    }

    #[test]
    fn frame_fails_atomically_when_buffer_is_too_small() {
        let modem = ModemReadout {
            vbat_mv: 3600,
            temp_c: 23,
        };
        let mut buf = [0u8; 24];
        let res = encode_frame(&modem, (0, 0), &battery(), &mut buf);
        assert_eq!(res, Err(Error::BufferExhausted));
        // Whatever landed in the buffer must not pass for a frame.
        assert!(decode_frame(&buf).is_err());
    }

    #[test]
    fn cycle_is_skipped_without_a_connection() {
        static COUNTERS: TxCounters = TxCounters::new();
        let mut uplink = FakeUplink::new(false);
        let mut telemetry = telemetry(&mut uplink, FakeModemInfo::new(3600, 23), &COUNTERS);
        block_on(telemetry.read_and_stream()).unwrap();
        drop(telemetry);

        assert!(uplink.published.is_empty());
        assert_eq!(COUNTERS.snapshot(), (0, 0));
    }

    #[test]
    fn sensor_fault_aborts_the_cycle_before_publishing() {
        static COUNTERS: TxCounters = TxCounters::new();
        let mut uplink = FakeUplink::new(true);
        let mut modem = FakeModemInfo::new(3600, 23);
        modem.failing = true;
        let mut telemetry = telemetry(&mut uplink, modem, &COUNTERS);
        let res = block_on(telemetry.read_and_stream());
        drop(telemetry);

        assert_eq!(res, Err(Error::SensorFault));
        assert!(uplink.published.is_empty());
    }

    #[test]
    fn cycle_streams_one_frame_with_current_counters() {
        static COUNTERS: TxCounters = TxCounters::new();
        let mut uplink = FakeUplink::new(true);
        let mut telemetry = telemetry(&mut uplink, FakeModemInfo::new(3600, 23), &COUNTERS);
        COUNTERS.record(PublishStatus::Published);
        COUNTERS.record(PublishStatus::Published);
        COUNTERS.record(PublishStatus::Timeout);
        block_on(telemetry.read_and_stream()).unwrap();
        drop(telemetry);

        assert_eq!(uplink.published.len(), 1);
        let record = &uplink.published[0];
        assert_eq!(record.path.as_str(), SENSOR_PATH);
        assert_eq!(record.content_type, ContentType::Cbor);
        let (modem, counters, _) = decode_frame(&record.payload).unwrap();
        assert_eq!(modem.vbat_mv, 3600);
        assert_eq!(counters, (2, 1));

        // The fake completed the submission; drain its report.
        assert_eq!(
            block_on(PUBLISH_REPORTS.receive()),
            PublishStatus::Published
        );
    }

    #[test]
    fn startup_report_is_json_to_the_device_state_path() {
        static COUNTERS: TxCounters = TxCounters::new();
        let mut uplink = FakeUplink::new(true);
        let mut telemetry = telemetry(&mut uplink, FakeModemInfo::new(3600, 23), &COUNTERS);
        block_on(telemetry.report_startup(0x4)).unwrap();
        drop(telemetry);

        assert_eq!(uplink.published.len(), 1);
        let record = &uplink.published[0];
        assert_eq!(record.path.as_str(), DEVICE_STATE_PATH);
        assert_eq!(record.content_type, ContentType::Json);
        assert_eq!(record.payload.as_slice(), b"{\"rst_reason\":4}");

        assert_eq!(
            block_on(PUBLISH_REPORTS.receive()),
            PublishStatus::Published
        );
    }
}
