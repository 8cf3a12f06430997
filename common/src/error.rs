use thiserror::Error;

#[derive(Debug, Error, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("Sensor fetch failed")]
    SensorFault,
    #[error("Peripheral not ready")]
    DeviceNotReady,
    #[error("Encode buffer exhausted")]
    BufferExhausted,
    #[error("Publish rejected by transport")]
    TransportFailure,
    #[error("Operation timed out")]
    Timeout,
    #[error("No location data available")]
    NoLocationData,
    #[error("Malformed CBOR item")]
    ParseError,
    #[error("String formatting failed")]
    FormatError,
}
