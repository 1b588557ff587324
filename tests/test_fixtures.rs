use std::fs;

use apple_crash_report_renderer::Report;
use chrono::Utc;

fn load_fixture(name: &str, extension: &str) -> String {
    fs::read_to_string(format!("tests/fixtures/{}.{}", name, extension)).unwrap()
}

#[test]
fn test_render_matches_golden_file() {
    let data = load_fixture("08a3eb98c83a4ab9b9cc7a890967b4a8", "report");
    let report: Report = serde_json::from_str(&data).unwrap();

    let expected = load_fixture("08a3eb98c83a4ab9b9cc7a890967b4a8", "crash");
    let rendered = report.render_crash_with_timezone(&Utc).unwrap();

    assert_eq!(rendered.text, expected);
}

#[test]
fn test_golden_report_annotations() {
    let data = load_fixture("08a3eb98c83a4ab9b9cc7a890967b4a8", "report");
    let report: Report = serde_json::from_str(&data).unwrap();

    let rendered = report.render_crash_with_timezone(&Utc).unwrap();

    // The fixture carries one frame with a symbolication error, inside
    // the main image.
    assert_eq!(rendered.annotations.len(), 1);
    assert_eq!(
        &rendered.text[rendered.annotations[0].range.clone()],
        "08A3EB98-C83A-4AB9-B9CC-7A890967B4A8"
    );
}

#[test]
fn test_rendering_is_deterministic() {
    let data = load_fixture("08a3eb98c83a4ab9b9cc7a890967b4a8", "report");
    let report: Report = serde_json::from_str(&data).unwrap();

    let first = report.render_crash_with_timezone(&Utc).unwrap();
    let second = report.render_crash_with_timezone(&Utc).unwrap();

    assert_eq!(first.text, second.text);
    assert_eq!(first.annotations, second.annotations);
}
