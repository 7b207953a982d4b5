use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use peerdrop_core::offer::RegistryEntry;
use peerdrop_engine::registry::OfferLog;

/// Number of log lines kept for the status display.
pub const STATUS_LINES: usize = 10;

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const CLEAR_SCREEN: &str = "\x1B[2J\x1B[H";

/// The most recent status lines, appended to from any task.
pub struct StatusLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StatusLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for StatusLog {
    fn default() -> Self {
        Self::new(STATUS_LINES)
    }
}

/// Renders one frame of the status display.
///
/// `offers` is `None` on the sharing side, which has no registry.
#[must_use]
pub fn render(title: &str, recent: &[String], offers: Option<&[RegistryEntry]>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "  {title}");
    let _ = writeln!(out, "  {}", "─".repeat(title.chars().count().max(20)));
    for line in recent {
        let _ = writeln!(out, "  {line}");
    }

    if let Some(offers) = offers {
        out.push('\n');
        if offers.is_empty() {
            let _ = writeln!(out, "  Waiting for offers...");
        }
        for entry in offers {
            let _ = writeln!(out, "  {entry}");
        }
        out.push('\n');
        out.push_str("Select file by number: ");
    }
    out
}

/// Spawns the task that redraws the status display once per second.
pub fn spawn_status_display<R: OfferLog>(
    title: String,
    log: Arc<StatusLog>,
    registry: Option<Arc<R>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            ticker.tick().await;
            let offers = registry.as_ref().map(|r| r.snapshot());
            let frame = render(&title, &log.recent(), offers.as_deref());
            let mut stdout = std::io::stdout().lock();
            let _ = write!(stdout, "{CLEAR_SCREEN}{frame}");
            let _ = stdout.flush();
        }
    })
}
