//! Delivery pipeline for outbound mail
//!
//! Sends compose a message, transmit it through the mailbox client and
//! record every transition on a SendStatus audit row. Failures are
//! classified into bounce kinds and retried on a fixed backoff schedule
//! by a periodic scanner; deferred sends are durable rows driven by the
//! same scanner pattern.

mod bounce;
mod mime;
mod pipeline;
mod retry;
mod schedule;
mod tracking;

pub use bounce::{classify_bounce, next_retry_at};
pub use mime::compose_outbound;
pub use pipeline::{SendOutcome, SendPipeline};
pub use retry::{RetryScanner, RetryStats};
pub use schedule::{ScheduleStats, ScheduledSendRunner};
pub use tracking::{
    TRACKING_PIXEL_GIF, inject_tracking_pixel, new_tracking_id, record_open, serve_open_pixel,
};
