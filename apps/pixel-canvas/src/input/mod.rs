//! Turns pointer drags into a bounded-rate stream of `sendPixel` requests.
//!
//! Nothing is drawn locally: a stroke becomes visible only once the store
//! echoes the committed rows back through the subscription.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::model::{Color, Identity, ModelError, NewPixel, Palette, SharedSelection};
use crate::protocol::RequestId;
use crate::transport::TransportError;

/// 60 Hz.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_nanos(16_666_666);

#[derive(Debug, Error)]
pub enum InputError {
    #[error("invalid color: {0}")]
    InvalidColor(#[from] ModelError),
    #[error("color {0} is not in the palette")]
    NotInPalette(Color),
}

/// Where mutation requests go. Implemented by the live connection handle.
pub trait MutationSink: Send + Sync {
    fn identity(&self) -> Option<Identity>;
    fn send_pixel(&self, pixel: NewPixel) -> Result<RequestId, TransportError>;
}

/// Pointer position in surface coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Integer cell under the pointer.
    pub fn cell(self) -> (i64, i64) {
        (self.x.floor() as i64, self.y.floor() as i64)
    }
}

#[derive(Clone, Debug)]
pub struct InputConfig {
    pub min_interval: Duration,
    /// Only palette colors may be selected when set.
    pub palette_only: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_INTERVAL,
            palette_only: false,
        }
    }
}

/// Admits at most one event per `min_interval`. Samples arriving faster are
/// dropped by the caller, never queued.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn is_open(&self, now: Instant) -> bool {
        match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
            None => true,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputOutcome {
    Sent(RequestId),
    /// Dropped by the rate limiter.
    Throttled,
    /// `extend` without a preceding `begin`.
    Inactive,
    /// No connection or identity; nothing is buffered.
    NoSession,
    /// The transport refused the request; logged and dropped.
    Failed,
}

pub struct InputController {
    sink: Arc<dyn MutationSink>,
    selection: SharedSelection,
    palette: Palette,
    config: InputConfig,
    limiter: RateLimiter,
    active: bool,
}

impl InputController {
    pub fn new(sink: Arc<dyn MutationSink>, selection: SharedSelection, config: InputConfig) -> Self {
        Self {
            sink,
            selection,
            palette: Palette::default(),
            limiter: RateLimiter::new(config.min_interval),
            config,
            active: false,
        }
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    pub fn selected(&self) -> Color {
        self.selection.get()
    }

    /// Parses `#RRGGBB` and makes it the color of subsequent requests.
    pub fn select_color(&self, raw: &str) -> Result<Color, InputError> {
        let color = Color::parse(raw)?;
        if self.config.palette_only && !self.palette.contains(color) {
            return Err(InputError::NotInPalette(color));
        }
        self.selection.set(color);
        debug!(target = "pixel_canvas::input", color = %color, "color selected");
        Ok(color)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn begin(&mut self, point: Point) -> InputOutcome {
        self.begin_at(point, Instant::now())
    }

    pub fn begin_at(&mut self, point: Point, now: Instant) -> InputOutcome {
        self.active = true;
        self.limiter.reset();
        self.emit(point, now)
    }

    pub fn extend(&mut self, point: Point) -> InputOutcome {
        self.extend_at(point, Instant::now())
    }

    pub fn extend_at(&mut self, point: Point, now: Instant) -> InputOutcome {
        if !self.active {
            return InputOutcome::Inactive;
        }
        self.emit(point, now)
    }

    pub fn end(&mut self) {
        self.active = false;
    }

    fn emit(&mut self, point: Point, now: Instant) -> InputOutcome {
        if !self.limiter.is_open(now) {
            return InputOutcome::Throttled;
        }
        let Some(sender) = self.sink.identity() else {
            trace!(target = "pixel_canvas::input", "no session; dropping input");
            return InputOutcome::NoSession;
        };
        let (x, y) = point.cell();
        let pixel = NewPixel {
            x,
            y,
            color: self.selection.get(),
            sender,
        };
        match self.sink.send_pixel(pixel) {
            Ok(request_id) => {
                self.limiter.mark(now);
                trace!(target = "pixel_canvas::input", x, y, %request_id, "pixel requested");
                InputOutcome::Sent(request_id)
            }
            Err(TransportError::NotConnected) => InputOutcome::NoSession,
            Err(err) => {
                warn!(target = "pixel_canvas::input", x, y, error = %err, "failed to send pixel");
                InputOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        identity: Mutex<Option<Identity>>,
        sent: Mutex<Vec<NewPixel>>,
        next: AtomicU32,
    }

    impl RecordingSink {
        fn with_identity(identity: Identity) -> Arc<Self> {
            let sink = Self::default();
            *sink.identity.lock() = Some(identity);
            Arc::new(sink)
        }
    }

    impl MutationSink for RecordingSink {
        fn identity(&self) -> Option<Identity> {
            *self.identity.lock()
        }

        fn send_pixel(&self, pixel: NewPixel) -> Result<RequestId, TransportError> {
            self.sent.lock().push(pixel);
            Ok(RequestId(self.next.fetch_add(1, Ordering::Relaxed)))
        }
    }

    fn controller(sink: Arc<RecordingSink>) -> InputController {
        InputController::new(sink, SharedSelection::default(), InputConfig::default())
    }

    #[test]
    fn press_sends_selected_color_at_floored_cell() {
        let me = Identity::from_bytes([9; 32]);
        let sink = RecordingSink::with_identity(me);
        let mut input = controller(sink.clone());
        input.select_color("#ff0000").unwrap();
        let outcome = input.begin(Point::new(100.7, 150.2));
        assert!(matches!(outcome, InputOutcome::Sent(_)));
        assert_eq!(
            sink.sent.lock().as_slice(),
            &[NewPixel {
                x: 100,
                y: 150,
                color: Color::rgb(0xFF, 0, 0),
                sender: me,
            }]
        );
    }

    #[test]
    fn thousand_extends_within_a_frame_send_at_most_one_request() {
        let sink = RecordingSink::with_identity(Identity::from_bytes([1; 32]));
        let mut input = controller(sink.clone());
        let start = Instant::now();
        input.begin_at(Point::new(0.0, 0.0), start);
        for i in 0..1000u64 {
            let at = start + Duration::from_micros(i * 16);
            input.extend_at(Point::new(i as f64, 0.0), at);
        }
        assert_eq!(sink.sent.lock().len(), 1);

        let later = start + DEFAULT_MIN_INTERVAL;
        assert!(matches!(
            input.extend_at(Point::new(5.0, 5.0), later),
            InputOutcome::Sent(_)
        ));
        assert_eq!(sink.sent.lock().len(), 2);
    }

    #[test]
    fn no_identity_is_a_silent_no_op() {
        let sink = Arc::new(RecordingSink::default());
        let mut input = controller(sink.clone());
        assert_eq!(input.begin(Point::new(1.0, 1.0)), InputOutcome::NoSession);
        assert_eq!(input.extend(Point::new(2.0, 2.0)), InputOutcome::NoSession);
        assert!(sink.sent.lock().is_empty());

        // Nothing was buffered while disconnected.
        *sink.identity.lock() = Some(Identity::from_bytes([2; 32]));
        input.end();
        assert!(sink.sent.lock().is_empty());
    }

    #[test]
    fn extend_without_begin_is_ignored() {
        let sink = RecordingSink::with_identity(Identity::from_bytes([3; 32]));
        let mut input = controller(sink.clone());
        assert_eq!(input.extend(Point::new(4.0, 4.0)), InputOutcome::Inactive);
        input.begin(Point::new(4.0, 4.0));
        input.end();
        assert_eq!(input.extend(Point::new(8.0, 8.0)), InputOutcome::Inactive);
        assert_eq!(sink.sent.lock().len(), 1);
    }

    #[test]
    fn selection_validates_hex_and_palette() {
        let sink = RecordingSink::with_identity(Identity::from_bytes([4; 32]));
        let mut strict = InputController::new(
            sink,
            SharedSelection::default(),
            InputConfig {
                palette_only: true,
                ..InputConfig::default()
            },
        );
        assert_eq!(strict.selected(), Color::BLACK);
        assert!(matches!(
            strict.select_color("red"),
            Err(InputError::InvalidColor(_))
        ));
        assert!(matches!(
            strict.select_color("#123456"),
            Err(InputError::NotInPalette(_))
        ));
        assert_eq!(strict.select_color("#ffa500").unwrap(), Color::rgb(0xFF, 0xA5, 0));
        assert_eq!(strict.selected(), Color::rgb(0xFF, 0xA5, 0));
        strict.end();
    }
}
