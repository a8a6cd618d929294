//! Verdict recording
//!
//! Channels report through [`ResultSink`]. The file sink keeps three files
//! per run under the result directory: one line per finished dialog, the
//! call flow of every dialog that did not pass, and a statistics summary
//! written when the run closes.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ivr::{wash_prompt, IvrEvent, IvrEventKind, Judgment, PromptBook};
use crate::Result;

/// Outcome of one replayed dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Pass,
    PassUncompleted,
    PassDefectiveCase,
    Fail,
    FailSipError,
    Ignore,
    Interrupted,
}

impl Verdict {
    pub const ALL: [Verdict; 7] = [
        Verdict::Pass,
        Verdict::PassUncompleted,
        Verdict::PassDefectiveCase,
        Verdict::Fail,
        Verdict::FailSipError,
        Verdict::Ignore,
        Verdict::Interrupted,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::PassUncompleted => "pass-uncompleted",
            Self::PassDefectiveCase => "pass-defective-case",
            Self::Fail => "fail",
            Self::FailSipError => "fail-sip-error",
            Self::Ignore => "ignore",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::PassUncompleted | Self::PassDefectiveCase)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowDirection {
    Sent,
    Received,
}

/// One arrow of a call flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub direction: FlowDirection,
    pub description: String,
    pub event: Option<IvrEvent>,
    /// What the template expected in place of a received event
    pub expected: Option<String>,
    pub judgment: Option<Judgment>,
}

impl FlowStep {
    pub fn sent<S: Into<String>>(description: S) -> Self {
        Self {
            direction: FlowDirection::Sent,
            description: description.into(),
            event: None,
            expected: None,
            judgment: None,
        }
    }

    pub fn received<S: Into<String>>(description: S) -> Self {
        Self {
            direction: FlowDirection::Received,
            ..Self::sent(description)
        }
    }

    pub fn judged(actual: &IvrEvent, expected: Option<&IvrEvent>, judgment: Judgment) -> Self {
        Self {
            direction: FlowDirection::Received,
            description: format!("{} {}", actual.kind.label(), actual.content),
            event: Some(actual.clone()),
            expected: Some(expected.map_or_else(|| "(N/A)".to_string(), |e| e.to_string())),
            judgment: Some(judgment),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogReport {
    pub channel: usize,
    pub case_index: usize,
    pub case_name: String,
    pub dialog_index: usize,
    pub called: String,
    pub calling: String,
    pub verdict: Verdict,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub flow: Vec<FlowStep>,
}

impl DialogReport {
    pub fn result_line(&self) -> String {
        format!(
            "{} ch={} case={} ({}) dialog={} called={} calling={} {}",
            self.finished.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.channel,
            self.case_index,
            self.case_name,
            self.dialog_index,
            self.called,
            self.calling,
            self.verdict
        )
    }
}

/// Where channels send what happened.
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn dialog_started(&self, channel: usize, case_name: &str, dialog_index: usize);
    async fn record_verdict(&self, report: DialogReport) -> Result<()>;
    async fn diagnostic(&self, channel: usize, message: &str);
}

/// Counters kept over a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStatistics {
    pub started: u64,
    pub ended: u64,
    pub verdicts: BTreeMap<Verdict, u64>,
    pub first_start: Option<DateTime<Local>>,
    pub last_end: Option<DateTime<Local>>,
}

impl RunStatistics {
    pub fn count(&self, verdict: Verdict) -> u64 {
        self.verdicts.get(&verdict).copied().unwrap_or(0)
    }

    pub fn calls_per_second(&self) -> f64 {
        match (self.first_start, self.last_end) {
            (Some(start), Some(end)) => {
                let elapsed = (end - start).num_milliseconds() as f64 / 1000.0;
                if elapsed > 0.0 {
                    self.ended as f64 / elapsed
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    fn on_start(&mut self) {
        self.started += 1;
        self.first_start.get_or_insert_with(Local::now);
    }

    fn on_verdict(&mut self, report: &DialogReport) {
        self.ended += 1;
        *self.verdicts.entry(report.verdict).or_insert(0) += 1;
        self.last_end = Some(report.finished);
    }

    pub fn summary(&self, run_id: &Uuid) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Run {}", run_id);
        if let (Some(start), Some(end)) = (self.first_start, self.last_end) {
            let _ = writeln!(
                out,
                "From {} to {}",
                start.format("%Y-%m-%d %H:%M:%S"),
                end.format("%Y-%m-%d %H:%M:%S")
            );
        }
        let _ = writeln!(out, "Dialogs started: {}", self.started);
        let _ = writeln!(out, "Dialogs ended:   {}", self.ended);
        for verdict in Verdict::ALL {
            let count = self.count(verdict);
            let share = if self.ended > 0 {
                count as f64 * 100.0 / self.ended as f64
            } else {
                0.0
            };
            let _ = writeln!(out, "  {:<20} {:>8} {:>6.2}%", verdict.label(), count, share);
        }
        let _ = writeln!(out, "Calls per second: {:.2}", self.calls_per_second());
        out
    }
}

/// Draws a dialog as two columns, tester on the left and the IVR on the right.
pub fn render_call_flow(report: &DialogReport, book: Option<&PromptBook>) -> String {
    const WIDTH: usize = 44;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "== {} dialog {} on channel {}: {}",
        report.case_name, report.dialog_index, report.channel, report.verdict
    );
    let _ = writeln!(out, "tester{:>width$}", "ivr", width = WIDTH + 1);

    for step in &report.flow {
        let label = flow_label(step, book);
        let line = match step.direction {
            FlowDirection::Sent => {
                let body = format!("-- {} ", label);
                format!("|{:-<width$}>|", body, width = WIDTH - 2)
            }
            FlowDirection::Received => {
                let body = format!(" {} --", label);
                format!("|<{:->width$}|", body, width = WIDTH - 2)
            }
        };
        match (&step.judgment, &step.expected) {
            (Some(judgment), Some(expected)) => {
                let _ = writeln!(out, "{}  {} (expected {})", line, judgment.label(), expected);
            }
            _ => {
                let _ = writeln!(out, "{}", line);
            }
        }
    }
    out
}

fn flow_label(step: &FlowStep, book: Option<&PromptBook>) -> String {
    let Some(event) = &step.event else {
        return step.description.clone();
    };
    let (kind, name) = wash_prompt(event);
    let spoken = match (kind, book) {
        (IvrEventKind::Speak, Some(book)) => book.lookup(&name),
        _ => None,
    };
    match spoken {
        Some(text) => format!("{} {} \"{}\"", kind.label(), name, text),
        None => format!("{} {}", kind.label(), name),
    }
}

struct ResultFiles {
    results: File,
    unpassed: File,
    statistics_path: PathBuf,
}

/// Results, unpassed call flows and statistics under one directory.
///
/// Every dialog that neither passed nor was ignored lands in the unpassed
/// file. `draw_call_flow` additionally puts its call flow on screen.
pub struct FileResultSink {
    run_id: Uuid,
    draw_call_flow: bool,
    echo: bool,
    prompt_book: Option<Arc<PromptBook>>,
    files: Mutex<ResultFiles>,
    statistics: Mutex<RunStatistics>,
}

impl FileResultSink {
    pub fn create<P: AsRef<Path>>(
        result_dir: P,
        draw_call_flow: bool,
        prompt_book: Option<Arc<PromptBook>>,
    ) -> Result<Self> {
        let result_dir = result_dir.as_ref();
        fs::create_dir_all(result_dir)?;

        let run_id = Uuid::new_v4();
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let open = |suffix: &str| -> Result<File> {
            let path = result_dir.join(format!("{}-{}", stamp, suffix));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(File::from_std(file))
        };

        let files = ResultFiles {
            results: open("results.txt")?,
            unpassed: open("unpassed.txt")?,
            statistics_path: result_dir.join(format!("{}-statistics.txt", stamp)),
        };
        info!("Run {} writes results to {}", run_id, result_dir.display());

        Ok(Self {
            run_id,
            draw_call_flow,
            echo: true,
            prompt_book,
            files: Mutex::new(files),
            statistics: Mutex::new(RunStatistics::default()),
        })
    }

    /// Turns off the colored per-dialog screen line.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub async fn statistics(&self) -> RunStatistics {
        self.statistics.lock().await.clone()
    }

    /// Writes the statistics summary; the sink stays usable afterwards.
    pub async fn close(&self) -> Result<RunStatistics> {
        let statistics = self.statistics.lock().await.clone();
        let summary = statistics.summary(&self.run_id);
        let files = self.files.lock().await;
        tokio::fs::write(&files.statistics_path, summary.as_bytes()).await?;
        info!("Statistics written to {}", files.statistics_path.display());
        Ok(statistics)
    }

    fn echo_line(&self, report: &DialogReport) {
        let verdict = match report.verdict {
            Verdict::Pass => report.verdict.label().green(),
            verdict if verdict.is_pass() => verdict.label().yellow(),
            Verdict::Ignore | Verdict::Interrupted => report.verdict.label().dimmed(),
            verdict => verdict.label().red().bold(),
        };
        println!(
            "[ch {:>3}] {} dialog {} -> {}",
            report.channel, report.case_name, report.dialog_index, verdict
        );
    }
}

#[async_trait::async_trait]
impl ResultSink for FileResultSink {
    async fn dialog_started(&self, channel: usize, case_name: &str, dialog_index: usize) {
        debug!("Channel {} started {} dialog {}", channel, case_name, dialog_index);
        self.statistics.lock().await.on_start();
    }

    async fn record_verdict(&self, report: DialogReport) -> Result<()> {
        self.statistics.lock().await.on_verdict(&report);
        if report.verdict == Verdict::Interrupted {
            debug!("Channel {} interrupted, not written", report.channel);
            return Ok(());
        }

        let unpassed = report.verdict != Verdict::Pass && report.verdict != Verdict::Ignore;
        let flow = unpassed.then(|| render_call_flow(&report, self.prompt_book.as_deref()));

        if self.echo {
            self.echo_line(&report);
            if let (true, Some(flow)) = (self.draw_call_flow, &flow) {
                println!("{}", flow);
            }
        }

        let mut files = self.files.lock().await;
        let line = format!("{}\n", report.result_line());
        files.results.write_all(line.as_bytes()).await?;
        files.results.flush().await?;

        if let Some(flow) = flow {
            files.unpassed.write_all(format!("{}\n", flow).as_bytes()).await?;
            files.unpassed.flush().await?;
        }
        Ok(())
    }

    async fn diagnostic(&self, channel: usize, message: &str) {
        warn!("Channel {}: {}", channel, message);
    }
}

/// Keeps everything in memory.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<DialogReport>>,
    diagnostics: Mutex<Vec<(usize, String)>>,
    statistics: Mutex<RunStatistics>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<DialogReport> {
        self.reports.lock().await.clone()
    }

    pub async fn verdicts(&self) -> Vec<Verdict> {
        self.reports.lock().await.iter().map(|r| r.verdict).collect()
    }

    pub async fn diagnostics(&self) -> Vec<(usize, String)> {
        self.diagnostics.lock().await.clone()
    }

    pub async fn statistics(&self) -> RunStatistics {
        self.statistics.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ResultSink for MemorySink {
    async fn dialog_started(&self, _channel: usize, _case_name: &str, _dialog_index: usize) {
        self.statistics.lock().await.on_start();
    }

    async fn record_verdict(&self, report: DialogReport) -> Result<()> {
        self.statistics.lock().await.on_verdict(&report);
        self.reports.lock().await.push(report);
        Ok(())
    }

    async fn diagnostic(&self, channel: usize, message: &str) {
        self.diagnostics.lock().await.push((channel, message.to_string()));
    }
}
