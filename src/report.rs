use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// An absolute address, either an instruction pointer or an image load
/// address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub struct Addr(pub u64);

impl fmt::LowerHex for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

fn last_path_component(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// A loaded executable or library covered by the report.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryImage {
    #[serde(rename = "identifier")]
    pub id: String,
    pub load_address: Addr,
    pub size: u64,
    pub path: String,
}

impl BinaryImage {
    pub fn last_path_component(&self) -> &str {
        last_path_component(&self.path)
    }

    pub fn end_address(&self) -> Addr {
        Addr(self.load_address.0 + self.size)
    }

    /// The image identifier uppercased and dashed into the standard
    /// 8-4-4-4-12 UUID grouping. Identifiers that are not exactly 32
    /// UTF-16 code units long are returned uppercased but otherwise
    /// untouched.
    pub fn formatted_identifier(&self) -> String {
        let upper = self.id.to_uppercase();
        if upper.encode_utf16().count() != 32 {
            return upper;
        }

        let mut formatted = String::with_capacity(36);
        for (i, c) in upper.chars().enumerate() {
            if let 8 | 12 | 16 | 20 = i {
                formatted.push('-');
            }
            formatted.push(c);
        }
        formatted
    }

    pub fn contains(&self, address: Addr) -> bool {
        self.load_address <= address && address < self.end_address()
    }
}

/// A version/build string pair, displayed as `version (build)`.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionPair {
    pub build: String,
    pub version: String,
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version, self.build)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackTraceFrame {
    pub address: Addr,
    pub symbol: Option<String>,
    #[serde(default)]
    pub offset: u64,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub module: String,
    pub symbolication_error: Option<String>,
}

impl StackTraceFrame {
    pub fn has_symbol(&self) -> bool {
        self.symbol.as_deref().map_or(false, |s| !s.is_empty())
    }

    pub fn file_basename(&self) -> Option<&str> {
        self.file.as_deref().map(last_path_component)
    }

    /// The source location as `file:line`, or the file alone when no
    /// line is known.
    pub fn location(&self) -> Option<String> {
        let base = self.file_basename()?;
        match self.line {
            Some(line) => Some(format!("{}:{}", base, line)),
            None => Some(base.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StackTrace {
    pub crashed: bool,
    pub frames: Vec<StackTraceFrame>,
}

/// A POSIX signal number.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct Signal {
    pub number: i32,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self.number {
            4 => "SIGILL",
            5 => "SIGTRAP",
            6 => "SIGABRT",
            9 => "SIGKILL",
            10 => "SIGBUS",
            11 => "SIGSEGV",
            _ => "SIGUNKNOWN",
        }
    }

    pub fn display_name(&self) -> Option<&'static str> {
        match self.number {
            5 => Some("Trace/BPT trap: 5"),
            _ => None,
        }
    }
}

/// A mach kernel exception classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct MachException {
    pub number: i32,
    pub code: i64,
}

impl MachException {
    pub fn name(&self) -> &'static str {
        match self.number {
            1 => "EXC_BAD_ACCESS",
            2 => "EXC_BAD_INSTRUCTION",
            3 => "EXC_ARITHMETIC",
            5 => "EXC_SOFTWARE",
            6 => "EXC_BREAKPOINT",
            10 => "EXC_CRASH",
            11 => "EXC_RESOURCE",
            12 => "EXC_GUARD",
            13 => "EXC_CORPSE_NOTIFY",
            _ => "UNKNOWN",
        }
    }

    /// The signal this exception is reported as. The mapping is
    /// architecture-dependent; this covers the common cases.
    pub fn equivalent_signal(&self) -> Option<Signal> {
        match self.number {
            1 => Some(Signal { number: 11 }),
            2 => Some(Signal { number: 5 }),
            6 => Some(Signal { number: 6 }),
            10 => Some(Signal { number: 9 }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventMetrics {
    #[serde(default)]
    pub occurrences: u64,
    #[serde(default)]
    pub users: u64,
    #[serde(default)]
    pub host_apps: u64,
    #[serde(default)]
    pub relationships: u64,
}

/// An analytics event related to a report. Events are carried through
/// decoding for display purposes and do not affect rendering.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub module: String,
    pub title: String,
    pub subtitle: String,
    pub report_id: String,
    #[serde(default)]
    pub metrics: EventMetrics,
}

/// A decoded crash report.
#[derive(Debug, Clone, Deserialize)]
pub struct Report {
    #[serde(rename = "identifier")]
    pub id: String,
    pub platform: String,
    pub os_version: VersionPair,
    pub host_executable: String,
    pub host_version: VersionPair,
    #[serde(rename = "date")]
    pub date_millis: i64,
    pub binary_images: Vec<BinaryImage>,
    pub traces: Vec<StackTrace>,
    #[serde(default)]
    pub event_ids: BTreeSet<String>,
    #[serde(default)]
    pub relationships: Vec<Event>,
    #[serde(rename = "type")]
    pub kind: String,
    pub mach_exception: Option<MachException>,
    pub signal: Option<Signal>,
    pub termination_reason: Option<String>,
    pub architecture: Option<String>,
}

impl Report {
    /// The report timestamp truncated to whole seconds.
    pub fn date(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.date_millis / 1000, 0).unwrap_or_default()
    }

    pub fn crashed_thread_index(&self) -> Option<usize> {
        self.traces.iter().position(|t| t.crashed)
    }

    /// The trace considered responsible for the crash: the first crashed
    /// trace, falling back to the first trace overall.
    pub fn blamed_trace(&self) -> Option<&StackTrace> {
        self.traces
            .iter()
            .find(|t| t.crashed)
            .or_else(|| self.traces.first())
    }

    /// Relationship events attached to a specific frame's symbol.
    pub fn events_for_frame(&self, frame: &StackTraceFrame) -> Vec<&Event> {
        self.relationships
            .iter()
            .filter(|e| e.kind.starts_with("frame"))
            .filter(|e| Some(e.title.as_str()) == frame.symbol.as_deref())
            .collect()
    }

    /// Relationship events that apply to the whole trace rather than a
    /// single frame.
    pub fn trace_events(&self) -> Vec<&Event> {
        self.relationships
            .iter()
            .filter(|e| !e.kind.starts_with("frame"))
            .collect()
    }
}

#[cfg(test)]
fn test_image(id: &str) -> BinaryImage {
    BinaryImage {
        id: id.to_string(),
        load_address: Addr(0x1000),
        size: 0x1000,
        path: "/usr/lib/libfoo.dylib".to_string(),
    }
}

#[test]
fn test_formatted_identifier() {
    let image = test_image("08a3eb98c83a4ab9b9cc7a890967b4a8");
    assert_eq!(
        image.formatted_identifier(),
        "08A3EB98-C83A-4AB9-B9CC-7A890967B4A8"
    );

    let formatted = image.formatted_identifier();
    for idx in &[8, 13, 18, 23] {
        assert_eq!(formatted.as_bytes()[*idx], b'-');
    }
    assert_eq!(formatted.len(), 36);

    let image = test_image("deadbeef");
    assert_eq!(image.formatted_identifier(), "DEADBEEF");

    // Length is measured in UTF-16 code units: 31 ASCII chars plus one
    // astral char is 33 units, so no dashes are inserted.
    let image = test_image("0123456789abcdef0123456789abcde\u{1d54f}");
    assert_eq!(
        image.formatted_identifier(),
        "0123456789ABCDEF0123456789ABCDE\u{1d54f}"
    );
}

#[test]
fn test_image_address_range() {
    let image = test_image("deadbeef");
    assert!(!image.contains(Addr(0xfff)));
    assert!(image.contains(Addr(0x1000)));
    assert!(image.contains(Addr(0x1fff)));
    assert!(!image.contains(Addr(0x2000)));
    assert_eq!(image.end_address(), Addr(0x2000));
}

#[test]
fn test_last_path_component() {
    assert_eq!(last_path_component("/usr/lib/libfoo.dylib"), "libfoo.dylib");
    assert_eq!(last_path_component("PhonyApp"), "PhonyApp");
    assert_eq!(last_path_component(""), "");
}

#[cfg(test)]
fn test_trace(crashed: bool) -> StackTrace {
    StackTrace {
        crashed,
        frames: vec![],
    }
}

#[cfg(test)]
fn test_report(traces: Vec<StackTrace>) -> Report {
    Report {
        id: "report-1".to_string(),
        platform: "macOS".to_string(),
        os_version: VersionPair {
            build: "123".to_string(),
            version: "1.0".to_string(),
        },
        host_executable: "com.mycompany.PhonyApp".to_string(),
        host_version: VersionPair {
            build: "1".to_string(),
            version: "2.0".to_string(),
        },
        date_millis: 1_616_620_415_500,
        binary_images: vec![],
        traces,
        event_ids: BTreeSet::new(),
        relationships: vec![],
        kind: "mach_exception".to_string(),
        mach_exception: None,
        signal: None,
        termination_reason: None,
        architecture: None,
    }
}

#[test]
fn test_blamed_trace() {
    let report = test_report(vec![test_trace(false), test_trace(true), test_trace(false)]);
    assert!(report.blamed_trace().unwrap().crashed);
    assert_eq!(report.crashed_thread_index(), Some(1));

    let report = test_report(vec![test_trace(false), test_trace(false)]);
    assert!(!report.blamed_trace().unwrap().crashed);
    assert_eq!(report.crashed_thread_index(), None);

    let report = test_report(vec![]);
    assert!(report.blamed_trace().is_none());
}

#[cfg(test)]
fn test_event(kind: &str, title: &str) -> Event {
    Event {
        id: "evt-1".to_string(),
        kind: kind.to_string(),
        module: "no module".to_string(),
        title: title.to_string(),
        subtitle: "none".to_string(),
        report_id: "report-1".to_string(),
        metrics: EventMetrics::default(),
    }
}

#[test]
fn test_relationship_event_filtering() {
    let mut report = test_report(vec![]);
    report.relationships = vec![
        test_event("frame.deepest-interesting", "crashingFunction"),
        test_event("frame.deepest-interesting", "otherFunction"),
        test_event("exception", "crashingFunction"),
        test_event("note.mach_msg_trap", "mach_msg_trap"),
    ];

    let frame = StackTraceFrame {
        address: Addr(0x1500),
        symbol: Some("crashingFunction".to_string()),
        offset: 0,
        file: None,
        line: None,
        module: "PhonyApp".to_string(),
        symbolication_error: None,
    };

    // Only frame events whose title matches the frame symbol.
    let events = report.events_for_frame(&frame);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, "frame.deepest-interesting");
    assert_eq!(events[0].title, "crashingFunction");

    // A frame without a symbol matches nothing.
    let unsymbolicated = StackTraceFrame {
        symbol: None,
        ..frame.clone()
    };
    assert!(report.events_for_frame(&unsymbolicated).is_empty());

    // Trace events are the non-frame complement.
    let events = report.trace_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, "exception");
    assert_eq!(events[1].kind, "note.mach_msg_trap");
}

#[test]
fn test_date_truncation() {
    let mut report = test_report(vec![]);
    report.date_millis = 1_616_620_415_500;
    let a = report.date();
    report.date_millis = 1_616_620_415_999;
    let b = report.date();
    assert_eq!(a, b);
    assert_eq!(a.timestamp(), 1_616_620_415);
}

#[test]
fn test_mach_exception_signal_mapping() {
    let exc = MachException { number: 1, code: 0 };
    assert_eq!(exc.name(), "EXC_BAD_ACCESS");
    assert_eq!(exc.equivalent_signal(), Some(Signal { number: 11 }));

    let exc = MachException { number: 3, code: 0 };
    assert_eq!(exc.name(), "EXC_ARITHMETIC");
    assert_eq!(exc.equivalent_signal(), None);

    let exc = MachException { number: 99, code: 0 };
    assert_eq!(exc.name(), "UNKNOWN");

    assert_eq!(Signal { number: 5 }.display_name(), Some("Trace/BPT trap: 5"));
    assert_eq!(Signal { number: 11 }.display_name(), None);
    assert_eq!(Signal { number: 77 }.name(), "SIGUNKNOWN");
}
