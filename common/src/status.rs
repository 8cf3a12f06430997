use core::str::FromStr;

use heapless::{String, format};

use crate::error::Error;

/// Modem-side diagnostics included in every telemetry frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModemReadout {
    /// Battery voltage at the modem supply, in millivolts.
    pub vbat_mv: i32,
    /// Modem temperature in degrees Celsius.
    pub temp_c: i32,
}

/// Modem diagnostics accessors, backed by the modem information service.
pub trait ModemInfo {
    fn battery_voltage(&mut self) -> impl Future<Output = crate::Result<i32>>;
    fn temperature(&mut self) -> impl Future<Output = crate::Result<i32>>;
    fn firmware_version(&mut self) -> impl Future<Output = crate::Result<String<32>>>;
}

/// Reset-reason register bits, nRF91 RESETREAS layout.
pub const RESET_REASON_PIN: u32 = 1 << 0;
pub const RESET_REASON_WATCHDOG: u32 = 1 << 1;
pub const RESET_REASON_SOFTWARE: u32 = 1 << 2;
pub const RESET_REASON_LOCKUP: u32 = 1 << 3;
pub const RESET_REASON_CTRLAP: u32 = 1 << 4;
pub const RESET_REASON_OFF_WAKEUP: u32 = 1 << 16;
pub const RESET_REASON_DIF_WAKEUP: u32 = 1 << 18;

/// Causes in reporting order, one per register bit.
const RESET_CAUSES: [(u32, &str); 7] = [
    (RESET_REASON_PIN, "PIN reset"),
    (RESET_REASON_WATCHDOG, "watchdog"),
    (RESET_REASON_OFF_WAKEUP, "wakeup from power-off"),
    (RESET_REASON_DIF_WAKEUP, "debug interface wakeup"),
    (RESET_REASON_SOFTWARE, "software"),
    (RESET_REASON_LOCKUP, "CPU lockup"),
    (RESET_REASON_CTRLAP, "control access port"),
];

/// Decodes the reset-reason bitmask into a human-readable cause list.
///
/// Every set bit is reported, in a fixed order, joined with `" | "`. A zero
/// mask means the device went through a regular power-on reset.
pub fn reset_reason_string(reason: u32) -> String<128> {
    let mut out = String::new();
    for (mask, cause) in RESET_CAUSES {
        if reason & mask != 0 {
            if !out.is_empty() {
                let _ = out.push_str(" | ");
            }
            let _ = out.push_str(cause);
        }
    }
    if out.is_empty() {
        let _ = out.push_str("power-on reset");
    }
    out
}

/// Builds the one-shot startup report published to the device-state path.
pub fn startup_report(reason: u32) -> crate::Result<String<128>> {
    format!(128; "{{\"rst_reason\":{}}}", reason).map_err(|_| Error::FormatError)
}

/// Modem info double with fixed readings.
pub struct FakeModemInfo {
    pub vbat_mv: i32,
    pub temp_c: i32,
    pub version: String<32>,
    pub failing: bool,
}

impl FakeModemInfo {
    pub fn new(vbat_mv: i32, temp_c: i32) -> Self {
        Self {
            vbat_mv,
            temp_c,
            version: String::from_str("mfw_nrf91x1_2.0.2").unwrap(),
            failing: false,
        }
    }
}

impl ModemInfo for FakeModemInfo {
    async fn battery_voltage(&mut self) -> crate::Result<i32> {
        if self.failing {
            return Err(Error::SensorFault);
        }
        Ok(self.vbat_mv)
    }

    async fn temperature(&mut self) -> crate::Result<i32> {
        if self.failing {
            return Err(Error::SensorFault);
        }
        Ok(self.temp_c)
    }

    async fn firmware_version(&mut self) -> crate::Result<String<32>> {
        Ok(self.version.clone())
    }
}
