//! Leveled, nested diagnostic output.
//!
//! The engine only produces diagnostics; formatting and destination are the
//! business of a [`DiagnosticSink`].  Nesting is expressed with [`Cluster`]
//! guards bracketing a unit of work: the cluster title is emitted lazily
//! (when something inside it is reported), and a progress cluster reports
//! `done.` or `failed.` when it closes.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Level {
    /// Single-letter marker used as a line prefix.
    pub fn marker(self) -> char {
        match self {
            Level::Debug => 'D',
            Level::Info => 'I',
            Level::Warning => 'W',
            Level::Error => 'E',
            Level::Critical => 'C',
        }
    }
}

/// Diagnostic level per message category, carried in the root context's
/// configuration instead of process-wide globals.
#[derive(Debug, Clone, Copy)]
pub struct LevelConfig {
    pub run_preparation: Level,
    pub run_serialization: Level,
    pub redo_necessity_check: Level,
    pub redo_reason: Level,
    pub redo_suspicious_reason: Level,
    pub redo_preparation: Level,
    pub redo_start: Level,
    pub redo_aftermath: Level,
    pub helper_execution: Level,
    pub output_replacement: Level,
    pub run_summary: Level,
}

impl Default for LevelConfig {
    fn default() -> Self {
        LevelConfig {
            run_preparation: Level::Debug,
            run_serialization: Level::Info,
            redo_necessity_check: Level::Debug,
            redo_reason: Level::Info,
            redo_suspicious_reason: Level::Warning,
            redo_preparation: Level::Debug,
            redo_start: Level::Info,
            redo_aftermath: Level::Debug,
            helper_execution: Level::Debug,
            output_replacement: Level::Debug,
            run_summary: Level::Info,
        }
    }
}

/// Destination for diagnostic messages.  `nesting` is the cluster depth;
/// `elapsed_ns` accompanies the closing message of a timed cluster.
pub trait DiagnosticSink {
    fn emit(&mut self, level: Level, nesting: usize, text: &str, elapsed_ns: Option<u64>);
}

/// Sink writing indented lines to stderr, one level letter per message.
#[derive(Default)]
pub struct ConsoleSink {}

impl DiagnosticSink for ConsoleSink {
    fn emit(&mut self, level: Level, nesting: usize, text: &str, elapsed_ns: Option<u64>) {
        let indent = "  ".repeat(nesting);
        let mut out = std::io::stderr().lock();
        for (i, line) in text.lines().enumerate() {
            let r = if i == 0 {
                if let Some(ns) = elapsed_ns {
                    writeln!(
                        out,
                        "{}{} {} (took {} s)",
                        indent,
                        level.marker(),
                        line,
                        format_time_ns(ns, 3)
                    )
                } else {
                    writeln!(out, "{}{} {}", indent, level.marker(), line)
                }
            } else {
                writeln!(out, "{}  {}", indent, line)
            };
            let _ = r;
        }
    }
}

struct ClusterState {
    title: String,
    level: Level,
    informed: bool,
    with_time: bool,
    is_progress: bool,
    started: Instant,
}

struct DiagState {
    sink: Option<Rc<RefCell<dyn DiagnosticSink>>>,
    min_level: Level,
    clusters: Vec<ClusterState>,
}

thread_local! {
    static STATE: RefCell<DiagState> = RefCell::new(DiagState {
        sink: None,
        min_level: Level::Info,
        clusters: Vec::new(),
    });
}

/// Install a sink and suppression threshold; done by the root context.
pub(crate) fn install(sink: Rc<RefCell<dyn DiagnosticSink>>, min_level: Level) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.sink = Some(sink);
        s.min_level = min_level;
    });
}

pub(crate) fn uninstall() {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        s.sink = None;
        s.clusters.clear();
    });
}

fn emit(level: Level, nesting: usize, text: &str, elapsed_ns: Option<u64>) {
    let sink = STATE.with(|s| s.borrow().sink.clone());
    if let Some(sink) = sink {
        sink.borrow_mut().emit(level, nesting, text, elapsed_ns);
    }
}

/// Emit the titles of all not-yet-reported clusters, outermost first.
fn inform_pending_titles(state: &mut DiagState) {
    for i in 0..state.clusters.len() {
        if !state.clusters[i].informed {
            state.clusters[i].informed = true;
            let suffix = if state.clusters[i].is_progress { "..." } else { "" };
            let text = format!("{}{}", state.clusters[i].title, suffix);
            let (level, nesting) = (state.clusters[i].level, i);
            if let Some(sink) = state.sink.clone() {
                sink.borrow_mut().emit(level, nesting, &text, None);
            }
        }
    }
}

/// Report a message at the current nesting depth.  Suppressed messages are
/// dropped; an unsuppressed message first forces pending cluster titles out.
pub fn inform(text: &str, level: Level) {
    STATE.with(|s| {
        let mut s = s.borrow_mut();
        if level < s.min_level {
            return;
        }
        inform_pending_titles(&mut s);
        let nesting = s.clusters.len();
        if let Some(sink) = s.sink.clone() {
            sink.borrow_mut().emit(level, nesting, text, None);
        }
    });
}

/// RAII guard for one nesting level of diagnostic output.
///
/// Call [`Cluster::close`] on the success path; a guard dropped without
/// `close` reports the cluster as failed (matching error propagation
/// through `?`).
pub struct Cluster {
    closed: bool,
}

impl Cluster {
    pub fn new(title: &str, level: Level, with_time: bool, is_progress: bool) -> Cluster {
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            let unsuppressed = level >= s.min_level;
            s.clusters.push(ClusterState {
                title: title.to_string(),
                level,
                informed: false,
                with_time,
                is_progress,
                started: Instant::now(),
            });
            if unsuppressed {
                inform_pending_titles(&mut s);
            }
        });
        Cluster { closed: false }
    }

    pub fn close(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, success: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        STATE.with(|s| {
            let mut s = s.borrow_mut();
            let cluster = match s.clusters.pop() {
                Some(c) => c,
                None => return,
            };
            if cluster.informed && cluster.is_progress {
                let text = if success { "done." } else { "failed." };
                let elapsed = cluster
                    .with_time
                    .then(|| cluster.started.elapsed().as_nanos() as u64);
                let level = if success {
                    cluster.level.min(Level::Info)
                } else {
                    Level::Error
                };
                let nesting = s.clusters.len() + 1;
                if let Some(sink) = s.sink.clone() {
                    sink.borrow_mut().emit(level, nesting, text, elapsed);
                }
            }
        });
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Format a duration in nanoseconds as decimal seconds with the given number
/// of decimal places (rounded towards zero below 9).
pub fn format_time_ns(time_ns: u64, decimal_places: usize) -> String {
    let s = format!("{:010}", time_ns);
    let i = s.len() - 9;
    let s = format!("{}.{}", &s[..i], &s[i..]);
    let decimal_places = decimal_places.max(1);
    if decimal_places >= 9 {
        format!("{}{}", s, "0".repeat(decimal_places - 9))
    } else {
        s[..s.len() - (9 - decimal_places)].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink capturing emitted lines for assertions.
    pub struct MemorySink(pub Vec<(Level, usize, String)>);

    impl DiagnosticSink for MemorySink {
        fn emit(&mut self, level: Level, nesting: usize, text: &str, _elapsed_ns: Option<u64>) {
            self.0.push((level, nesting, text.to_string()));
        }
    }

    fn with_memory_sink(f: impl FnOnce()) -> Vec<(Level, usize, String)> {
        let sink = Rc::new(RefCell::new(MemorySink(Vec::new())));
        install(sink.clone(), Level::Debug);
        f();
        uninstall();
        let lines = sink.borrow().0.clone();
        lines
    }

    #[test]
    fn format_seconds() {
        assert_eq!(format_time_ns(0, 9), "0.000000000");
        assert_eq!(format_time_ns(1_500_000_000, 3), "1.500");
        assert_eq!(format_time_ns(12_345, 3), "0.000");
        assert_eq!(format_time_ns(1_000_000_000, 1), "1.0");
    }

    #[test]
    fn lazy_cluster_titles() {
        let lines = with_memory_sink(|| {
            let c = Cluster::new("outer", Level::Debug, false, true);
            inform("hello", Level::Info);
            c.close();
        });
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], (Level::Debug, 0, "outer...".to_string()));
        assert_eq!(lines[1], (Level::Info, 1, "hello".to_string()));
        assert_eq!(lines[2], (Level::Debug, 1, "done.".to_string()));
    }

    #[test]
    fn suppressed_messages_keep_titles_unreported() {
        let sink = Rc::new(RefCell::new(MemorySink(Vec::new())));
        install(sink.clone(), Level::Warning);
        {
            let c = Cluster::new("quiet", Level::Info, false, true);
            inform("detail", Level::Debug);
            c.close();
        }
        uninstall();
        assert!(sink.borrow().0.is_empty());
    }

    #[test]
    fn failed_cluster_reports_failure() {
        let lines = with_memory_sink(|| {
            let _c = Cluster::new("work", Level::Info, false, true);
            inform("step", Level::Info);
            // dropped without close
        });
        assert_eq!(lines[2], (Level::Error, 1, "failed.".to_string()));
    }
}
