//! Per-step log capture
//!
//! The harness logs through `tracing`. While a [`LogCapture`] is active every
//! INFO, WARN and ERROR event is also appended to it as a prefixed line, so a
//! step's output can be attached to its report. Normal console output is never
//! suppressed.
//!
//! At most one capture is active per [`CaptureHub`]. Starting a capture
//! silently supersedes the previous one; stopping a superseded capture leaves
//! the newer one alone.

use std::fmt;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{debug, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used for console output when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,kuack_e2e=debug,kube=warn";

#[derive(Default)]
struct CaptureBuffer {
    lines: Mutex<Vec<String>>,
}

/// Routes captured events to whichever capture is currently active
#[derive(Clone, Default)]
pub struct CaptureHub {
    active: Arc<Mutex<Option<Arc<CaptureBuffer>>>>,
}

impl CaptureHub {
    /// Create a hub with no active capture
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any capture is currently receiving lines
    pub fn is_capturing(&self) -> bool {
        self.active.lock().is_some()
    }

    fn push(&self, line: String) {
        let active = self.active.lock().clone();
        if let Some(buffer) = active {
            buffer.lines.lock().push(line);
        }
    }

    /// Layer feeding this hub; add it to a subscriber
    pub fn layer(&self) -> CaptureLayer {
        CaptureLayer { hub: self.clone() }
    }
}

/// Buffer of lines captured during one step
pub struct LogCapture {
    hub: CaptureHub,
    buffer: Arc<CaptureBuffer>,
}

impl LogCapture {
    /// Create an inactive capture bound to `hub`
    pub fn new(hub: &CaptureHub) -> Self {
        Self {
            hub: hub.clone(),
            buffer: Arc::new(CaptureBuffer::default()),
        }
    }

    /// Become the hub's active capture, discarding lines from any earlier step
    pub fn start(&self) {
        self.buffer.lines.lock().clear();
        *self.hub.active.lock() = Some(self.buffer.clone());
    }

    /// Deactivate (only if still active) and return everything captured
    pub fn stop(&self) -> Vec<String> {
        {
            let mut active = self.hub.active.lock();
            if active
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &self.buffer))
            {
                *active = None;
            }
        }
        self.lines()
    }

    /// Whether this capture is the hub's active one
    pub fn is_active(&self) -> bool {
        self.hub
            .active
            .lock()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &self.buffer))
    }

    /// Lines captured so far
    pub fn lines(&self) -> Vec<String> {
        self.buffer.lines.lock().clone()
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// `tracing` layer that copies events into the active capture
pub struct CaptureLayer {
    hub: CaptureHub,
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let prefix = match *event.metadata().level() {
            Level::ERROR => "[ERROR]",
            Level::WARN => "[WARN]",
            Level::INFO => "[LOG]",
            _ => return,
        };
        if !self.hub.is_capturing() {
            return;
        }

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let mut line = format!("{} {}", prefix, visitor.message);
        for field in &visitor.fields {
            line.push(' ');
            line.push_str(field);
        }
        self.hub.push(line);
    }
}

/// Filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

static GLOBAL_HUB: OnceLock<CaptureHub> = OnceLock::new();

/// Install the process-wide subscriber (console output plus capture) once.
///
/// Returns the hub captures must bind to. Later calls return the same hub.
/// If another global subscriber was already installed, console output stays
/// with it and captures receive nothing.
pub fn install_global_hooks() -> CaptureHub {
    GLOBAL_HUB
        .get_or_init(|| {
            let hub = CaptureHub::new();

            // Captures see what the console prints; the layer itself drops DEBUG and TRACE
            let installed = tracing_subscriber::registry()
                .with(tracing_subscriber::fmt::layer().with_filter(env_filter()))
                .with(hub.layer().with_filter(env_filter()))
                .try_init();
            if let Err(e) = installed {
                debug!(error = %e, "Global subscriber already set, log capture disabled");
            }
            hub
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tracing::{error, info, warn};

    #[derive(Clone, Default)]
    struct Console(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Console {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Console {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).to_string()
        }
    }

    fn subscriber(hub: &CaptureHub, console: &Console) -> impl Subscriber + Send + Sync {
        let console = console.clone();
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(move || console.clone()),
            )
            .with(hub.layer())
    }

    // ==========================================================================
    // Story: A step's output is captured and still printed
    // ==========================================================================

    #[test]
    fn story_three_lines_are_captured_with_passthrough() {
        let hub = CaptureHub::new();
        let console = Console::default();

        let lines = tracing::subscriber::with_default(subscriber(&hub, &console), || {
            let capture = LogCapture::new(&hub);
            capture.start();
            info!("Installing release");
            warn!(port = 8080, "Tunnel slow");
            error!("Install failed");
            tracing::debug!("not captured");
            capture.stop()
        });

        assert_eq!(
            lines,
            vec![
                "[LOG] Installing release".to_string(),
                "[WARN] Tunnel slow port=8080".to_string(),
                "[ERROR] Install failed".to_string(),
            ]
        );
        let printed = console.text();
        assert!(printed.contains("Installing release"));
        assert!(printed.contains("Tunnel slow"));
        assert!(printed.contains("Install failed"));
        assert!(!hub.is_capturing());
    }

    #[test]
    fn story_nothing_is_captured_outside_a_step() {
        let hub = CaptureHub::new();
        let console = Console::default();

        let capture = LogCapture::new(&hub);
        tracing::subscriber::with_default(subscriber(&hub, &console), || {
            info!("before");
            capture.start();
            info!("during");
            capture.stop();
            info!("after");
        });

        assert_eq!(capture.lines(), vec!["[LOG] during".to_string()]);
    }

    #[test]
    fn story_restarted_capture_starts_empty() {
        let hub = CaptureHub::new();
        let console = Console::default();

        let lines = tracing::subscriber::with_default(subscriber(&hub, &console), || {
            let capture = LogCapture::new(&hub);
            capture.start();
            info!("step one a");
            info!("step one b");
            assert_eq!(capture.stop().len(), 2);

            capture.start();
            info!("x");
            info!("y");
            info!("z");
            capture.stop()
        });

        assert_eq!(
            lines,
            vec![
                "[LOG] x".to_string(),
                "[LOG] y".to_string(),
                "[LOG] z".to_string(),
            ]
        );
    }

    // ==========================================================================
    // Story: A new capture supersedes the old one
    // ==========================================================================

    #[test]
    fn story_stopping_superseded_capture_keeps_newer_active() {
        let hub = CaptureHub::new();
        let console = Console::default();

        tracing::subscriber::with_default(subscriber(&hub, &console), || {
            let first = LogCapture::new(&hub);
            let second = LogCapture::new(&hub);

            first.start();
            info!("one");
            second.start();
            info!("two");

            assert_eq!(first.stop(), vec!["[LOG] one".to_string()]);
            assert!(second.is_active());
            info!("three");
            assert_eq!(
                second.stop(),
                vec!["[LOG] two".to_string(), "[LOG] three".to_string()]
            );
        });
    }

    #[test]
    fn story_capture_follows_console_directives() {
        let hub = CaptureHub::new();
        let subscriber =
            tracing_subscriber::registry().with(hub.layer().with_filter(EnvFilter::new(DEFAULT_FILTER)));

        let lines = tracing::subscriber::with_default(subscriber, || {
            let capture = LogCapture::new(&hub);
            capture.start();
            info!(target: "kube::client", "Sending request");
            warn!(target: "kube::client", "Watch restarted");
            info!("Release installed");
            tracing::debug!("Probe attempt");
            capture.stop()
        });

        assert_eq!(
            lines,
            vec![
                "[WARN] Watch restarted".to_string(),
                "[LOG] Release installed".to_string(),
            ]
        );
    }

    #[test]
    fn global_hooks_return_the_same_hub() {
        let a = install_global_hooks();
        let b = install_global_hooks();
        let capture = LogCapture::new(&a);
        capture.start();
        assert!(b.is_capturing());
        capture.stop();
    }
}
