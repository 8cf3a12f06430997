use core::str::FromStr;
use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(feature = "defmt")]
use defmt::error;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use heapless::{String, Vec};
#[cfg(not(feature = "defmt"))]
use log::error;

use crate::RawMutex;
use crate::error::Error;

/// Content type tag handed to the transport alongside the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContentType {
    Cbor,
    Json,
}

/// Terminal status of one publish attempt, delivered by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishStatus {
    Published,
    Timeout,
    TransportError,
}

impl core::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            PublishStatus::Published => "published",
            PublishStatus::Timeout => "timed out",
            PublishStatus::TransportError => "transport error",
        };
        f.write_str(text)
    }
}

/// Queue of publish completion reports.
///
/// The transport delivers exactly one report per accepted submission;
/// [`publish_report_loop`] drains it and keeps the counters.
pub static PUBLISH_REPORTS: Channel<RawMutex, PublishStatus, 8> = Channel::new();

/// Connectivity edges raised by the transport's event context.
pub static CONNECTION_EVENTS: Signal<RawMutex, bool> = Signal::new();

/// Remote telemetry client.
pub trait Uplink {
    /// Whether a session to the remote endpoint is currently established.
    fn is_connected(&self) -> bool;
    /// Submits `payload` for asynchronous delivery to `path`.
    ///
    /// Returns as soon as the transport has accepted the submission; the
    /// outcome arrives later as a single report on [`PUBLISH_REPORTS`].
    fn publish(
        &mut self,
        path: &str,
        content_type: ContentType,
        payload: &[u8],
    ) -> impl Future<Output = crate::Result<()>>;
    /// Kicks off re-establishing the session; completion is signalled on
    /// [`CONNECTION_EVENTS`].
    fn reconnect(&mut self) -> impl Future<Output = crate::Result<()>>;
}

impl<U: Uplink> Uplink for &mut U {
    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    async fn publish(
        &mut self,
        path: &str,
        content_type: ContentType,
        payload: &[u8],
    ) -> crate::Result<()> {
        (**self).publish(path, content_type, payload).await
    }

    async fn reconnect(&mut self) -> crate::Result<()> {
        (**self).reconnect().await
    }
}

/// Transmission counters for the process lifetime.
///
/// Written only by the completion context, read by the frame encoder. The
/// counters saturate instead of wrapping so a long-lived device cannot
/// silently restart its totals.
#[derive(Default)]
pub struct TxCounters {
    success: AtomicU32,
    failure: AtomicU32,
}

impl TxCounters {
    pub const fn new() -> Self {
        Self {
            success: AtomicU32::new(0),
            failure: AtomicU32::new(0),
        }
    }

    /// Applies one completion report.
    pub fn record(&self, status: PublishStatus) {
        let counter = if status == PublishStatus::Published {
            &self.success
        } else {
            &self.failure
        };
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
            Some(count.saturating_add(1))
        });
    }

    /// Current `(success, failure)` totals.
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.success.load(Ordering::Acquire),
            self.failure.load(Ordering::Acquire),
        )
    }
}

/// Completion-handler context: applies every report to the counters and logs
/// failed uploads. Upload failures never propagate further.
pub async fn publish_report_loop(counters: &'static TxCounters) {
    loop {
        let status = PUBLISH_REPORTS.receive().await;
        counters.record(status);
        if status != PublishStatus::Published {
            error!("Async publish failed: {}", status);
        }
    }
}

/// One submission recorded by [`FakeUplink`].
pub struct PublishedRecord {
    pub path: String<32>,
    pub content_type: ContentType,
    pub payload: Vec<u8, 256>,
}

/// Uplink double that records submissions and completes them immediately.
pub struct FakeUplink {
    pub connected: bool,
    /// Status the transport reports for each accepted submission.
    pub outcome: PublishStatus,
    pub published: Vec<PublishedRecord, 4>,
}

impl FakeUplink {
    pub fn new(connected: bool) -> Self {
        Self {
            connected,
            outcome: PublishStatus::Published,
            published: Vec::new(),
        }
    }
}

impl Uplink for FakeUplink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn publish(
        &mut self,
        path: &str,
        content_type: ContentType,
        payload: &[u8],
    ) -> crate::Result<()> {
        let record = PublishedRecord {
            path: String::from_str(path).unwrap(),
            content_type,
            payload: Vec::from_slice(payload).map_err(|_| Error::BufferExhausted)?,
        };
        self.published
            .push(record)
            .map_err(|_| Error::TransportFailure)?;
        PUBLISH_REPORTS.send(self.outcome).await;
        Ok(())
    }

    async fn reconnect(&mut self) -> crate::Result<()> {
        self.connected = true;
        CONNECTION_EVENTS.signal(true);
        Ok(())
    }
}
