//! Tests for the serial line scanner.

mod common;

use access_terminal::scanner::{LineScanner, MAX_SYMBOL_LEN};
use access_terminal::CodeScanner;
use common::FakeSerial;

fn scanner() -> (FakeSerial, LineScanner<FakeSerial>) {
    let port = FakeSerial::new();
    (port.clone(), LineScanner::new(port))
}

// ============================================================================
// Tests for scan_frame
// ============================================================================

#[test]
fn test_nothing_buffered() {
    let (_, mut scanner) = scanner();
    assert_eq!(scanner.scan_frame(), None);
}

#[test]
fn test_single_line() {
    let (port, mut scanner) = scanner();
    port.feed(b"q83vEjRWeJA=\r\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("q83vEjRWeJA="));
    assert_eq!(scanner.scan_frame(), None);
}

#[test]
fn test_line_split_across_reads() {
    let (port, mut scanner) = scanner();
    port.feed(b"ABC");
    assert_eq!(scanner.scan_frame(), None);
    port.feed(b"DEF\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("ABCDEF"));
}

#[test]
fn test_two_lines_in_one_read() {
    let (port, mut scanner) = scanner();
    port.feed(b"first\rsecond\r");
    assert_eq!(scanner.scan_frame().as_deref(), Some("first"));
    assert_eq!(scanner.scan_frame().as_deref(), Some("second"));
    assert_eq!(scanner.scan_frame(), None);
}

#[test]
fn test_empty_lines_skipped() {
    let (port, mut scanner) = scanner();
    port.feed(b"\r\n\r\nXYZ\r\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("XYZ"));
}

#[test]
fn test_overlong_line_dropped() {
    let (port, mut scanner) = scanner();
    port.feed(&vec![b'A'; MAX_SYMBOL_LEN + 10]);
    port.feed(b"\nok\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("ok"));
}

#[test]
fn test_max_length_line_kept() {
    let (port, mut scanner) = scanner();
    port.feed(&vec![b'B'; MAX_SYMBOL_LEN]);
    port.feed(b"\n");
    assert_eq!(scanner.scan_frame().map(|s| s.len()), Some(MAX_SYMBOL_LEN));
}

#[test]
fn test_non_utf8_line_dropped() {
    let (port, mut scanner) = scanner();
    port.feed(&[0xFF, 0xFE, b'\n']);
    port.feed(b"good\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("good"));
}

// ============================================================================
// Tests for reset
// ============================================================================

#[test]
fn test_reset_discards_partial_and_buffered() {
    let (port, mut scanner) = scanner();
    port.feed(b"stale");
    assert_eq!(scanner.scan_frame(), None);
    port.feed(b"-more\n");
    scanner.reset();
    assert_eq!(scanner.scan_frame(), None);

    port.feed(b"fresh\n");
    assert_eq!(scanner.scan_frame().as_deref(), Some("fresh"));
}
