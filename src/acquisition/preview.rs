//! Rate-limited live preview.
//!
//! The preview path is lossy by design: it republishes at most one frame per
//! `1/fps` of capture time and never queues stale frames ("latest wins").
//! Rendering maps 16-bit samples to an 8-bit [`GrayImage`] with the rig's
//! brightness/contrast controls and min–max normalisation.

use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::acquisition::camera_source::FrameSubscription;
use crate::data::Frame;
use crate::error::{DaqError, DaqResult};

/// Selectable preview refresh rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreviewRate {
    /// 5 fps
    Fps5,
    /// 10 fps
    Fps10,
    /// 15 fps
    Fps15,
    /// 30 fps
    #[default]
    Fps30,
    /// 60 fps
    Fps60,
}

impl PreviewRate {
    /// Every selectable rate, slowest first.
    pub const ALL: [PreviewRate; 5] = [
        PreviewRate::Fps5,
        PreviewRate::Fps10,
        PreviewRate::Fps15,
        PreviewRate::Fps30,
        PreviewRate::Fps60,
    ];

    /// Frames per second.
    pub fn fps(self) -> u32 {
        match self {
            PreviewRate::Fps5 => 5,
            PreviewRate::Fps10 => 10,
            PreviewRate::Fps15 => 15,
            PreviewRate::Fps30 => 30,
            PreviewRate::Fps60 => 60,
        }
    }

    /// Minimum capture-time spacing between published frames.
    pub fn period(self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps()))
    }

    /// Look up a selectable rate.
    pub fn from_fps(fps: u32) -> DaqResult<Self> {
        Self::ALL
            .into_iter()
            .find(|rate| rate.fps() == fps)
            .ok_or_else(|| {
                DaqError::Config(format!(
                    "Preview rate {} fps not supported (choose 5, 10, 15, 30 or 60)",
                    fps
                ))
            })
    }
}

/// Publish decision for a stream of timestamps.
#[derive(Debug, Clone)]
pub struct PreviewThrottle {
    period: Duration,
    last: Option<Duration>,
}

impl PreviewThrottle {
    /// Throttle at `rate`.
    pub fn new(rate: PreviewRate) -> Self {
        Self {
            period: rate.period(),
            last: None,
        }
    }

    /// Change the rate; the next offer is judged against the new period.
    pub fn set_rate(&mut self, rate: PreviewRate) {
        self.period = rate.period();
    }

    /// Whether a frame at `now` should be published. The first always is.
    pub fn offer(&mut self, now: Duration) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.period,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

/// Brightness, contrast, and zoom applied when rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayAdjust {
    /// Added to every sample after contrast scaling
    pub brightness: f64,
    /// Multiplies every sample
    pub contrast: f64,
    /// Output scale for `render_scaled`
    pub zoom: f64,
}

impl Default for DisplayAdjust {
    fn default() -> Self {
        Self::identity()
    }
}

impl DisplayAdjust {
    /// No brightness offset, unit contrast, no zoom.
    pub fn identity() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            zoom: 1.0,
        }
    }

    /// From the rig's slider positions: brightness in -100..=100 (one step is
    /// 256 counts) and contrast in 10..=300 percent. Out-of-range positions
    /// are clamped.
    pub fn from_sliders(brightness: i32, contrast_percent: i32) -> Self {
        Self {
            brightness: f64::from(brightness.clamp(-100, 100)) * 256.0,
            contrast: f64::from(contrast_percent.clamp(10, 300)) / 100.0,
            zoom: 1.0,
        }
    }

    /// Same adjustment with a zoom factor (clamped to 0.1..=8).
    pub fn with_zoom(mut self, zoom: f64) -> Self {
        self.zoom = if zoom.is_finite() { zoom.clamp(0.1, 8.0) } else { 1.0 };
        self
    }
}

/// Map a frame to 8 bits.
///
/// `adj = clamp(v * contrast + brightness, 0, 65535)`, then
/// `(adj - min) / (max - min + 1e-6) * 255`, rounded to the nearest level
/// rather than truncated so the brightest sample reaches 255. A flat frame
/// renders black.
pub fn render(frame: &Frame, adjust: &DisplayAdjust) -> GrayImage {
    let adjusted: Vec<f64> = frame
        .pixels()
        .iter()
        .map(|&v| (f64::from(v) * adjust.contrast + adjust.brightness).clamp(0.0, 65535.0))
        .collect();

    let (lo, hi) = adjusted
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let scale = 255.0 / ((hi - lo) + 1e-6);

    let mut image = GrayImage::new(frame.width(), frame.height());
    for (dst, v) in image.iter_mut().zip(adjusted) {
        *dst = ((v - lo) * scale).round().clamp(0.0, 255.0) as u8;
    }
    image
}

/// [`render`] followed by resizing by `adjust.zoom`.
pub fn render_scaled(frame: &Frame, adjust: &DisplayAdjust) -> GrayImage {
    let image = render(frame, adjust);
    if (adjust.zoom - 1.0).abs() < f64::EPSILON {
        return image;
    }
    let width = ((f64::from(frame.width()) * adjust.zoom).round() as u32).max(1);
    let height = ((f64::from(frame.height()) * adjust.zoom).round() as u32).max(1);
    imageops::resize(&image, width, height, FilterType::Triangle)
}

/// Background consumer that keeps the newest frame worth displaying.
pub struct PreviewSink {
    latest: watch::Receiver<Option<Arc<Frame>>>,
    rate: watch::Sender<PreviewRate>,
    published: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl PreviewSink {
    /// Start consuming `subscription` at `rate`.
    pub fn spawn(mut subscription: FrameSubscription, rate: PreviewRate) -> Self {
        let (latest_tx, latest) = watch::channel(None);
        let (rate_tx, rate_rx) = watch::channel(rate);
        let published = Arc::new(AtomicU64::new(0));
        let counter = published.clone();

        let task = tokio::spawn(async move {
            let mut throttle = PreviewThrottle::new(*rate_rx.borrow());
            while let Some(frame) = subscription.recv().await {
                throttle.set_rate(*rate_rx.borrow());
                if throttle.offer(frame.captured_at()) {
                    latest_tx.send_replace(Some(frame));
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            }
            debug!(
                "Preview ended ({} frames dropped upstream)",
                subscription.dropped()
            );
        });

        Self {
            latest,
            rate: rate_tx,
            published,
            task,
        }
    }

    /// Newest published frame.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.latest.borrow().clone()
    }

    /// Receiver that changes on every publish, for front ends.
    pub fn watch(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.latest.clone()
    }

    /// Newest published frame rendered for display.
    pub fn render_latest(&self, adjust: &DisplayAdjust) -> Option<GrayImage> {
        self.latest().map(|frame| render_scaled(&frame, adjust))
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Change the refresh rate.
    pub fn set_rate(&self, rate: PreviewRate) {
        self.rate.send_replace(rate);
    }

    /// Wait for the upstream subscription to end; returns frames published.
    pub async fn join(self) -> DaqResult<u64> {
        let Self { task, published, .. } = self;
        task.await?;
        Ok(published.load(Ordering::Relaxed))
    }

    /// Stop consuming now; returns frames published.
    pub async fn shutdown(self) -> u64 {
        let Self { task, published, .. } = self;
        task.abort();
        let _ = task.await;
        published.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::camera_source::{FrameProducer, ManualSource};

    #[test]
    fn throttle_first_frame_always_publishes() {
        let mut throttle = PreviewThrottle::new(PreviewRate::Fps10);
        assert!(throttle.offer(Duration::from_millis(500)));
        assert!(!throttle.offer(Duration::from_millis(550)));
        assert!(throttle.offer(Duration::from_millis(600)));
    }

    #[test]
    fn rate_lookup() {
        assert_eq!(PreviewRate::default().fps(), 30);
        assert_eq!(PreviewRate::from_fps(15).unwrap(), PreviewRate::Fps15);
        assert!(PreviewRate::from_fps(24).is_err());
    }

    #[tokio::test]
    async fn thousand_fps_source_is_throttled_to_preview_rate() {
        let source = ManualSource::new();
        let preview = PreviewSink::spawn(source.subscribe("preview", 1024), PreviewRate::Fps30);

        for i in 0..1000u64 {
            source.push(4, 4, i as u16, Duration::from_millis(i));
        }
        drop(source);

        let published = preview.join().await.unwrap();
        assert!(published >= 29, "published {}", published);
        assert!(published <= 31, "published {}", published);
    }

    #[test]
    fn identity_adjust_is_plain_min_max() {
        let frame = Frame::from_pixels(3, 1, 0, vec![100, 200, 300]);
        let image = render(&frame, &DisplayAdjust::identity());
        assert_eq!(image.as_raw(), &vec![0, 127, 255]);
    }

    #[test]
    fn flat_frame_renders_black() {
        let frame = Frame::from_pixels(2, 2, 0, vec![4000; 4]);
        let image = render(&frame, &DisplayAdjust::from_sliders(50, 200));
        assert!(image.as_raw().iter().all(|&v| v == 0));
    }

    #[test]
    fn brightness_clamps_before_normalising() {
        // Everything saturates at 65535 once brightness pushes it over.
        let frame = Frame::from_pixels(2, 1, 0, vec![65000, 65400]);
        let image = render(&frame, &DisplayAdjust::from_sliders(100, 100));
        assert_eq!(image.as_raw(), &vec![0, 0]);
    }

    #[test]
    fn sliders_scale_and_clamp() {
        let adjust = DisplayAdjust::from_sliders(-150, 5);
        assert_eq!(adjust.brightness, -25_600.0);
        assert_eq!(adjust.contrast, 0.1);
    }

    #[test]
    fn zoom_resizes_output() {
        let frame = Frame::from_pixels(10, 6, 0, (0..60).collect());
        let image = render_scaled(&frame, &DisplayAdjust::identity().with_zoom(2.0));
        assert_eq!(image.dimensions(), (20, 12));
    }
}
