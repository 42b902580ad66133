//! Console output of utilization records.

use std::io::{self, Write};

use chrono::{DateTime, Local, SecondsFormat};

use crate::config::OutputFormat;
use crate::handoff::Consumer;
use crate::stage::{Consumed, StageContext, WorkerExit};
use crate::usage::CpuUsage;

const CLEAR_SCREEN: &str = "\x1b[2J\x1b[H";

/// Displays utilization records. Errors are reported back to the stage,
/// which logs them; nothing flows back into the pipeline.
pub trait UsageRenderer: Send {
    fn render(&mut self, usage: &CpuUsage) -> io::Result<()>;
}

/// Writes records as text frames or JSON lines.
#[derive(Debug)]
pub struct ConsoleRenderer<W> {
    out: W,
    format: OutputFormat,
    clear_screen: bool,
}

impl ConsoleRenderer<io::Stdout> {
    pub fn stdout(format: OutputFormat, clear_screen: bool) -> Self {
        Self::new(io::stdout(), format, clear_screen)
    }
}

impl<W: Write + Send> ConsoleRenderer<W> {
    pub fn new(out: W, format: OutputFormat, clear_screen: bool) -> Self {
        Self {
            out,
            format,
            clear_screen,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> UsageRenderer for ConsoleRenderer<W> {
    fn render(&mut self, usage: &CpuUsage) -> io::Result<()> {
        let now = Local::now();
        let frame = match self.format {
            OutputFormat::Text => {
                let mut frame = String::new();
                if self.clear_screen {
                    frame.push_str(CLEAR_SCREEN);
                }
                frame.push_str(&format_text(usage, &now));
                frame
            }
            OutputFormat::Json => format_json(usage, &now)?,
        };
        self.out.write_all(frame.as_bytes())?;
        self.out.flush()
    }
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2} %"))
}

/// Text frame: header line, aggregate line, one line per processor.
#[must_use]
pub fn format_text(usage: &CpuUsage, at: &DateTime<Local>) -> String {
    let mut text = format!("cpuwatch  {}\n", at.format("%Y-%m-%d %H:%M:%S"));
    text.push_str(&format!("CPU:\t{}\n", percent(usage.total)));
    for (i, cpu) in usage.cpus.iter().enumerate() {
        text.push_str(&format!("CPU{i}:\t{}\n", percent(*cpu)));
    }
    text
}

/// One JSON object terminated by a newline.
pub fn format_json(usage: &CpuUsage, at: &DateTime<Local>) -> io::Result<String> {
    let value = serde_json::json!({
        "timestamp": at.to_rfc3339_opts(SecondsFormat::Millis, false),
        "total": usage.total,
        "cpus": usage.cpus,
    });
    let mut line = serde_json::to_string(&value).map_err(io::Error::other)?;
    line.push('\n');
    Ok(line)
}

/// Renderer loop. A failed render is logged and the next record is tried.
pub fn run_renderer<R>(
    mut ctx: StageContext,
    input: &Consumer<CpuUsage>,
    renderer: &mut R,
) -> WorkerExit
where
    R: UsageRenderer + ?Sized,
{
    let worker = ctx.worker();
    while ctx.begin_iteration() {
        let usage = match ctx.consume(input) {
            Consumed::Item(usage) => usage,
            Consumed::NoData => continue,
            Consumed::Cancelled => break,
        };
        if let Err(err) = renderer.render(&usage) {
            ctx.stats_mut().errors += 1;
            tracing::error!(worker = %worker, error = %err, "Render failed");
        }
    }
    input.wake();
    ctx.finish()
}
