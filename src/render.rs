use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;

use chrono::{Local, TimeZone};
use thiserror::Error;

use crate::report::{Report, Signal};

#[cfg(test)]
use crate::report::{Addr, BinaryImage, MachException, StackTrace, StackTraceFrame, VersionPair};

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";
const LABEL_WIDTH: usize = 23;
const MODULE_WIDTH: usize = 32;
const IMAGE_ADDR_WIDTH: usize = 18;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("report contains no binary images")]
    MissingPrimaryImage,
}

/// Styling applied to a range of the rendered text.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Style {
    /// The range covers the identifier of a binary image that failed to
    /// symbolicate at least one frame.
    SymbolicationFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Byte range into the rendered text.
    pub range: Range<usize>,
    pub style: Style,
}

/// The rendered crash report text together with styling annotations.
/// Plain-text consumers can ignore the annotations; the text is the same
/// either way.
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub text: String,
    pub annotations: Vec<Annotation>,
}

struct CrashText {
    text: String,
    annotations: Vec<Annotation>,
}

impl CrashText {
    fn new() -> CrashText {
        CrashText {
            text: String::new(),
            annotations: vec![],
        }
    }

    fn push(&mut self, value: &str) {
        self.text.push_str(value);
    }

    fn line(&mut self, value: &str) {
        self.text.push_str(value);
        self.text.push('\n');
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }

    fn field(&mut self, label: &str, value: impl fmt::Display) {
        self.text
            .push_str(&format!("{:<width$}{}", label, value, width = LABEL_WIDTH));
        self.text.push('\n');
    }

    fn styled(&mut self, value: &str, style: Style) {
        let start = self.text.len();
        self.text.push_str(value);
        self.annotations.push(Annotation {
            range: start..self.text.len(),
            style,
        });
    }

    fn finish(self) -> RenderedReport {
        RenderedReport {
            text: self.text,
            annotations: self.annotations,
        }
    }
}

/// Pads `value` with trailing spaces to exactly `width` characters,
/// truncating when it is longer.
fn pad_to_width(value: &str, width: usize) -> String {
    let mut out: String = value.chars().take(width).collect();
    for _ in out.chars().count()..width {
        out.push(' ');
    }
    out
}

impl Report {
    /// The value of the `Exception Type` field: the mach exception name,
    /// qualified by its equivalent signal when one exists.
    fn mach_exception_display_type(&self) -> String {
        let exc = match &self.mach_exception {
            Some(exc) => exc,
            None => return String::new(),
        };

        match exc.equivalent_signal() {
            Some(signal) => format!("{} ({})", exc.name(), signal.name()),
            None => exc.name().to_string(),
        }
    }

    /// The explicitly reported signal, else the one derived from the mach
    /// exception.
    fn effective_signal(&self) -> Option<Signal> {
        self.signal
            .or_else(|| self.mach_exception.and_then(|exc| exc.equivalent_signal()))
    }

    fn termination_signal(&self) -> Option<&'static str> {
        self.effective_signal()?.display_name()
    }

    /// The explicitly reported termination reason, else one synthesized
    /// from the effective signal, else nothing.
    fn termination_reason_display(&self) -> Option<String> {
        if let Some(reason) = &self.termination_reason {
            return Some(reason.clone());
        }

        let signal = self.effective_signal()?;
        Some(format!("Namespace SIGNAL, Code 0x{:x}", signal.number))
    }

    /// Renders the report as apple crash report text, formatting the
    /// Date/Time field in the system local timezone.
    pub fn render_crash(&self) -> Result<RenderedReport, RenderError> {
        self.render_crash_with_timezone(&Local)
    }

    /// Renders the report with the Date/Time field in the given timezone.
    pub fn render_crash_with_timezone<Tz>(
        &self,
        timezone: &Tz,
    ) -> Result<RenderedReport, RenderError>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let first_image = self
            .binary_images
            .first()
            .ok_or(RenderError::MissingPrimaryImage)?;

        // The true pid is not part of the wire format.
        let pid = 0;

        let mut out = CrashText::new();

        out.field(
            "Process:",
            format_args!("{} [{}]", first_image.last_path_component(), pid),
        );
        out.field("Path:", &first_image.path);
        out.field("Identifier:", &self.host_executable);
        out.field("Version:", &self.host_version);
        out.line("Code Type:");
        out.field("Parent Process:", "??? [1]");
        out.field(
            "Responsible:",
            format_args!("{} [{}]", first_image.last_path_component(), pid),
        );
        out.field("User ID:", pid);
        out.blank();

        let date = self.date().with_timezone(timezone);
        out.field("Date/Time:", date.format(DATE_FORMAT));
        out.field(
            "OS Version:",
            format_args!("{} {}", self.platform, self.os_version),
        );
        out.field("Report Version:", 12);
        out.blank();

        let thread_index = self.crashed_thread_index().unwrap_or(0);

        out.field("Crashed Thread:", thread_index);
        out.blank();

        out.field("Exception Type:", self.mach_exception_display_type());
        out.line("Exception Codes:");
        out.line("Exception Note:");
        out.blank();

        if let Some(value) = self.termination_signal() {
            out.field("Termination Signal:", value);
        }
        if let Some(value) = self.termination_reason_display() {
            out.field("Termination Reason:", value);
        }
        out.line("Terminating Process:");
        out.blank();

        out.line("Application Specific Information:");
        out.blank();

        let mut failed_addresses = BTreeSet::new();

        for (i, trace) in self.traces.iter().enumerate() {
            let state = if trace.crashed { " Crashed" } else { "" };

            out.blank();
            out.line(&format!("Thread {}{}:", i, state));

            for (j, frame) in trace.frames.iter().enumerate() {
                if frame.symbolication_error.is_some() {
                    failed_addresses.insert(frame.address);
                }

                let mut line = format!(
                    "{:<3} {} 0x{:016x}",
                    j,
                    pad_to_width(&frame.module, MODULE_WIDTH),
                    frame.address
                );

                if frame.has_symbol() {
                    if let Some(symbol) = &frame.symbol {
                        line.push(' ');
                        line.push_str(symbol);
                    }
                }

                if frame.offset > 0 {
                    line.push_str(&format!(" + {}", frame.offset));
                }

                if let Some(location) = frame.location() {
                    line.push(' ');
                    line.push_str(&location);
                }

                out.line(&line);
            }
        }

        let arch_name = if self.architecture.as_deref() == Some("X86_64") {
            "x86"
        } else {
            "ARM"
        };

        out.blank();
        out.line(&format!(
            "Thread {} crashed with {} Thread State (64-bit):",
            thread_index, arch_name
        ));
        out.blank();

        out.line("Binary Images:");

        for image in &self.binary_images {
            let start = pad_to_width(&format!("0x{:x}", image.load_address), IMAGE_ADDR_WIDTH);
            let end = pad_to_width(&format!("0x{:x}", image.end_address()), IMAGE_ADDR_WIDTH);
            let identifier = image.formatted_identifier();

            let failed = failed_addresses.iter().any(|addr| image.contains(*addr));

            out.push(&format!(
                "{} - {} {} () <",
                start,
                end,
                image.last_path_component()
            ));

            if failed {
                out.styled(&identifier, Style::SymbolicationFailure);
            } else {
                out.push(&identifier);
            }

            out.push(&format!("> {}\n", image.path));
        }

        Ok(out.finish())
    }
}

#[cfg(test)]
fn test_frame(address: u64, module: &str) -> StackTraceFrame {
    StackTraceFrame {
        address: Addr(address),
        symbol: None,
        offset: 0,
        file: None,
        line: None,
        module: module.to_string(),
        symbolication_error: None,
    }
}

#[cfg(test)]
fn test_report() -> Report {
    Report {
        id: "report-1".to_string(),
        platform: "macOS".to_string(),
        os_version: VersionPair {
            build: "20D91".to_string(),
            version: "11.2.3".to_string(),
        },
        host_executable: "com.mycompany.PhonyApp".to_string(),
        host_version: VersionPair {
            build: "1".to_string(),
            version: "2.0".to_string(),
        },
        date_millis: 1_616_620_415_500,
        binary_images: vec![BinaryImage {
            id: "08a3eb98c83a4ab9b9cc7a890967b4a8".to_string(),
            load_address: Addr(0x1000),
            size: 0x1000,
            path: "/Applications/PhonyApp.app/Contents/MacOS/PhonyApp".to_string(),
        }],
        traces: vec![StackTrace {
            crashed: true,
            frames: vec![test_frame(0x1500, "PhonyApp")],
        }],
        event_ids: Default::default(),
        relationships: vec![],
        kind: "mach_exception".to_string(),
        mach_exception: None,
        signal: None,
        termination_reason: None,
        architecture: None,
    }
}

#[test]
fn test_render_requires_primary_image() {
    let mut report = test_report();
    report.binary_images.clear();

    assert!(matches!(
        report.render_crash_with_timezone(&chrono::Utc),
        Err(RenderError::MissingPrimaryImage)
    ));
}

#[test]
fn test_render_starts_with_process() {
    let report = test_report();
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();

    assert!(rendered.text.starts_with("Process:               PhonyApp [0]\n"));
    assert!(rendered
        .text
        .contains("Date/Time:             2021-03-24 21:13:35.000 +0000\n"));
}

#[test]
fn test_exception_type_field() {
    let mut report = test_report();
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();

    // No mach exception leaves the value empty but keeps the padding.
    assert!(rendered.text.contains("Exception Type:        \n"));

    report.mach_exception = Some(MachException { number: 3, code: 0 });
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("Exception Type:        EXC_ARITHMETIC\n"));

    report.mach_exception = Some(MachException { number: 1, code: 0 });
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("Exception Type:        EXC_BAD_ACCESS (SIGSEGV)\n"));
}

#[test]
fn test_termination_fields() {
    let mut report = test_report();
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();

    assert!(!rendered.text.contains("Termination Signal:"));
    assert!(!rendered.text.contains("Termination Reason:"));

    // A derived signal without a display name synthesizes only the reason.
    report.mach_exception = Some(MachException { number: 1, code: 0 });
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(!rendered.text.contains("Termination Signal:"));
    assert!(rendered
        .text
        .contains("Termination Reason:    Namespace SIGNAL, Code 0xb\n"));

    // SIGTRAP is the one signal with a display name.
    report.signal = Some(Signal { number: 5 });
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("Termination Signal:    Trace/BPT trap: 5\n"));
    assert!(rendered
        .text
        .contains("Termination Reason:    Namespace SIGNAL, Code 0x5\n"));

    // An explicit reason wins over synthesis.
    report.termination_reason = Some("Namespace WATCHDOG, Code 0x1".to_string());
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("Termination Reason:    Namespace WATCHDOG, Code 0x1\n"));
}

#[test]
fn test_frame_offset_rendering() {
    let mut report = test_report();
    let mut frame = test_frame(0x1500, "PhonyApp");
    frame.symbol = Some("crashingFunction".to_string());
    report.traces[0].frames = vec![frame];

    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("0   PhonyApp                         0x0000000000001500 crashingFunction\n"));

    report.traces[0].frames[0].offset = 24;
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered.text.contains(
        "0   PhonyApp                         0x0000000000001500 crashingFunction + 24\n"
    ));
}

#[test]
fn test_frame_location_rendering() {
    let mut report = test_report();
    let mut frame = test_frame(0x1500, "PhonyApp");
    frame.symbol = Some("crashingFunction".to_string());
    frame.file = Some("/Users/dev/PhonyApp/Crash.swift".to_string());
    frame.line = Some(12);
    report.traces[0].frames = vec![frame];

    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered.text.contains(
        "0   PhonyApp                         0x0000000000001500 crashingFunction Crash.swift:12\n"
    ));
}

#[test]
fn test_long_module_name_is_truncated() {
    let mut report = test_report();
    report.traces[0].frames =
        vec![test_frame(0x1500, "AModuleNameLongerThanThirtyTwoCharacters")];

    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("0   AModuleNameLongerThanThirtyTwoCh 0x0000000000001500\n"));
}

#[test]
fn test_symbolication_failure_annotations() {
    let mut report = test_report();
    report.binary_images.push(BinaryImage {
        id: "1611528d2aaf3a8ebdb3490b511a357c".to_string(),
        load_address: Addr(0x3000),
        size: 0x1000,
        path: "/usr/lib/system/libsystem_kernel.dylib".to_string(),
    });
    report.traces[0].frames[0].symbolication_error = Some("missing symbol data".to_string());

    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();

    // 0x1500 falls inside the first image only.
    assert_eq!(rendered.annotations.len(), 1);
    let annotation = &rendered.annotations[0];
    assert_eq!(annotation.style, Style::SymbolicationFailure);
    assert_eq!(
        &rendered.text[annotation.range.clone()],
        "08A3EB98-C83A-4AB9-B9CC-7A890967B4A8"
    );
}

#[test]
fn test_no_annotations_without_symbolication_errors() {
    let report = test_report();
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered.annotations.is_empty());
}

#[test]
fn test_thread_state_architecture() {
    let mut report = test_report();
    report.architecture = Some("X86_64".to_string());
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("\nThread 0 crashed with x86 Thread State (64-bit):\n"));

    report.architecture = None;
    let rendered = report.render_crash_with_timezone(&chrono::Utc).unwrap();
    assert!(rendered
        .text
        .contains("\nThread 0 crashed with ARM Thread State (64-bit):\n"));
}
