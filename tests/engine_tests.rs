use indoc::indoc;
use linepatch::{
    apply_ops, find_all_anchors, find_anchor, patch_file, read_document, rewrite_document,
    rewrite_file, rewrite_text, write_document, AnchorPattern, ApplyOptions, Document, Encoding,
    EncodingError, LineEnding, PatchOp, RangeError, RewriteRule, TransformError,
};
use std::fs;
use tempfile::tempdir;

// --- Document: reading, splitting, round-trips ---

#[test]
fn test_read_lf_document() {
    let doc = Document::from_bytes(b"line 1\nline 2\nline 3\n", Encoding::Utf8).unwrap();
    assert_eq!(doc.lines(), ["line 1", "line 2", "line 3"]);
    assert_eq!(doc.line_ending(), LineEnding::Lf);
    assert!(doc.has_trailing_newline());
    assert_eq!(doc.encoding(), Encoding::Utf8);
}

#[test]
fn test_read_crlf_document() {
    let doc = Document::from_bytes(b"alpha\r\nbeta\r\n", Encoding::Utf8).unwrap();
    assert_eq!(doc.lines(), ["alpha", "beta"]);
    assert_eq!(doc.line_ending(), LineEnding::Crlf);
    assert!(doc.has_trailing_newline());
}

#[test]
fn test_round_trip_is_bit_for_bit() {
    let sources: &[&[u8]] = &[
        b"line 1\nline 2\n",
        b"no trailing newline",
        b"crlf\r\nlines\r\nhere\r\n",
        b"crlf no trailing\r\nsecond",
        b"\n",
        b"",
        b"\xef\xbb\xbfbom\nand body\n",
    ];
    for &source in sources {
        let doc = Document::from_bytes(source, Encoding::Utf8).unwrap();
        assert_eq!(
            doc.to_bytes().unwrap(),
            source,
            "round-trip failed for {:?}",
            String::from_utf8_lossy(source)
        );
    }
}

#[test]
fn test_round_trip_latin1() {
    let source: &[u8] = b"caf\xe9\ncr\xeape\n";
    let doc = Document::from_bytes(source, Encoding::Latin1).unwrap();
    assert_eq!(doc.lines(), ["café", "crêpe"]);
    assert_eq!(doc.to_bytes().unwrap(), source);
}

#[test]
fn test_mixed_line_endings_normalize_to_first_seen() {
    // The convention is taken from the first terminator; stray endings are
    // normalized on write.
    let doc = Document::from_bytes(b"a\r\nb\nc\r\n", Encoding::Utf8).unwrap();
    assert_eq!(doc.line_ending(), LineEnding::Crlf);
    assert_eq!(doc.lines(), ["a", "b", "c"]);
    assert_eq!(doc.to_bytes().unwrap(), b"a\r\nb\r\nc\r\n");
}

#[test]
fn test_decode_error_reports_byte_position() {
    let err = Document::from_bytes(b"abc\xff", Encoding::Utf8).unwrap_err();
    assert_eq!(
        err,
        EncodingError::Decode {
            encoding: Encoding::Utf8,
            position: 3,
        }
    );
}

#[test]
fn test_encode_error_reports_character_position() {
    let mut doc = Document::from_bytes(b"abc", Encoding::Latin1).unwrap();
    apply_ops(&mut doc, &[PatchOp::insert_after(1, ["snow: \u{2603}"])]).unwrap();
    let err = doc.to_bytes().unwrap_err();
    match err {
        EncodingError::Encode { position, ch, .. } => {
            // "abc\nsnow: ☃" -> the snowman is the 11th character (0-based 10).
            assert_eq!(ch, '\u{2603}');
            assert_eq!(position, 10);
        }
        other => panic!("expected encode error, got {:?}", other),
    }
}

#[test]
fn test_empty_document() {
    let doc = Document::from_bytes(b"", Encoding::Utf8).unwrap();
    assert!(doc.is_empty());
    assert_eq!(doc.len(), 0);
    assert!(!doc.has_trailing_newline());
    assert_eq!(doc.to_bytes().unwrap(), b"");
}

// --- Anchor Locator ---

#[test]
fn test_find_first_and_all_anchors() {
    let doc = Document::from_lines(["a", "MARKER", "b", "MARKER"]);
    let pattern = AnchorPattern::literal("MARKER");

    assert_eq!(find_anchor(&doc, &pattern).unwrap(), Some(1));
    assert_eq!(find_all_anchors(&doc, &pattern).unwrap(), vec![1, 3]);
    assert_eq!(
        find_anchor(&doc, &AnchorPattern::literal("NOPE")).unwrap(),
        None
    );
    assert!(find_all_anchors(&doc, &AnchorPattern::literal("NOPE"))
        .unwrap()
        .is_empty());
}

#[test]
fn test_literal_anchor_is_a_substring_test() {
    let doc = Document::from_lines(["  const LIFF_ID = '2007705394';", "other"]);
    let hit = find_anchor(&doc, &AnchorPattern::literal("const LIFF_ID")).unwrap();
    assert_eq!(hit, Some(0));
}

#[test]
fn test_regex_anchor_is_unanchored_unless_pattern_anchors_it() {
    let doc = Document::from_lines(["prefix value=42 suffix", "value=7"]);
    let free = AnchorPattern::regex(r"value=\d+").unwrap();
    assert_eq!(find_all_anchors(&doc, &free).unwrap(), vec![0, 1]);

    let pinned = AnchorPattern::regex(r"^value=\d+$").unwrap();
    assert_eq!(find_all_anchors(&doc, &pinned).unwrap(), vec![1]);
}

#[test]
fn test_scoped_search_only_sees_the_scope() {
    let doc = Document::from_lines(["x", "x", "x", "x"]);
    let pattern = AnchorPattern::literal("x").scoped(1, 3);
    assert_eq!(find_anchor(&doc, &pattern).unwrap(), Some(1));
    assert_eq!(find_all_anchors(&doc, &pattern).unwrap(), vec![1, 2]);
}

#[test]
fn test_invalid_scope_is_a_range_error() {
    let doc = Document::from_lines(["a", "b"]);
    let too_long = AnchorPattern::literal("a").scoped(0, 3);
    assert_eq!(
        find_anchor(&doc, &too_long).unwrap_err(),
        RangeError::InvalidScope {
            start: 0,
            end: 3,
            len: 2,
        }
    );

    let inverted = AnchorPattern::literal("a").scoped(2, 1);
    assert!(matches!(
        find_all_anchors(&doc, &inverted).unwrap_err(),
        RangeError::InvalidScope { .. }
    ));
}

#[test]
fn test_empty_scope_finds_nothing() {
    let doc = Document::from_lines(["a", "b"]);
    let pattern = AnchorPattern::literal("a").scoped(1, 1);
    assert_eq!(find_anchor(&doc, &pattern).unwrap(), None);
}

#[test]
fn test_malformed_anchor_pattern_fails_at_construction() {
    let err = AnchorPattern::regex("(unclosed").unwrap_err();
    assert!(err.to_string().contains("(unclosed"));
}

// --- Rewrite Rule Engine ---

#[test]
fn test_guard_accepts_every_match() {
    let rules = vec![RewriteRule::new(r"(\d+) widgets", "{N} widgets")
        .unwrap()
        .with_guard(|caps| &caps[1] == "8")];
    assert_eq!(
        rewrite_text("Ship 8 widgets now, 8 widgets later", &rules),
        "Ship {N} widgets now, {N} widgets later"
    );
}

#[test]
fn test_guard_rejects_some_matches() {
    let rules = vec![RewriteRule::new(r"(\d+) widgets", "{N} widgets")
        .unwrap()
        .with_guard(|caps| &caps[1] == "8")];
    assert_eq!(
        rewrite_text("Ship 8 widgets, 9 widgets", &rules),
        "Ship {N} widgets, 9 widgets"
    );
}

#[test]
fn test_rewrite_is_idempotent_with_marker_guards() {
    let rules = vec![RewriteRule::new(r"(\d+) widgets", "{N} widgets")
        .unwrap()
        .with_guard(|caps| &caps[1] == "8")];
    let input = "Ship 8 widgets now, 8 widgets later, 12 widgets never";
    let once = rewrite_text(input, &rules);
    let twice = rewrite_text(&once, &rules);
    assert_eq!(once, twice);
}

#[test]
fn test_rules_run_in_declared_order() {
    // The first rule rewrites the specific form; the second, broader rule
    // sees the first rule's output and must not re-match it.
    let rules = vec![
        RewriteRule::new(r"version = 1 \(legacy\)", "version = 2").unwrap(),
        RewriteRule::new(r"version = (\d+)", "version = ${1}.0")
            .unwrap()
            .with_guard(|caps| &caps[1] != "2"),
    ];
    assert_eq!(
        rewrite_text("version = 1 (legacy)\nversion = 3", &rules),
        "version = 2\nversion = 3.0"
    );
}

#[test]
fn test_template_expands_captures() {
    let rules = vec![RewriteRule::new(r"(\w+)=(\d+)", "${2}:${1}").unwrap()];
    assert_eq!(rewrite_text("a=1 b=2", &rules), "1:a 2:b");
}

#[test]
fn test_computed_replacement() {
    let rules = vec![RewriteRule::computed(r"\d+", |caps| {
        let n: u64 = caps[0].parse().unwrap();
        (n * 2).to_string()
    })
    .unwrap()];
    assert_eq!(rewrite_text("1 and 21", &rules), "2 and 42");
}

#[test]
fn test_unguarded_rule_rewrites_every_match() {
    let rules = vec![RewriteRule::new(r"- วิดีโอ \d+ วินาที", "- วิดีโอ {{videoLength}} วินาที")
        .unwrap()];
    assert_eq!(
        rewrite_text("- วิดีโอ 8 วินาที\n- วิดีโอ 16 วินาที", &rules),
        "- วิดีโอ {{videoLength}} วินาที\n- วิดีโอ {{videoLength}} วินาที"
    );
}

#[test]
fn test_rules_are_text_level_not_line_scoped() {
    // With (?s), a single rule can span line boundaries.
    let rules = vec![RewriteRule::new(r"(?s)<!-- begin -->.*?<!-- end -->", "<!-- gone -->")
        .unwrap()];
    assert_eq!(
        rewrite_text("keep\n<!-- begin -->\nold\nbody\n<!-- end -->\nkeep", &rules),
        "keep\n<!-- gone -->\nkeep"
    );
}

#[test]
fn test_guarded_rule_spanning_lines() {
    let rules = vec![RewriteRule::new(r"(?s)(prompt:.*?)(\d+) sec", "${1}{{len}} sec")
        .unwrap()
        .with_guard(|caps| &caps[2] == "8")];
    assert_eq!(
        rewrite_text("prompt:\n  speak for 8 sec", &rules),
        "prompt:\n  speak for {{len}} sec"
    );
    assert_eq!(
        rewrite_text("prompt:\n  speak for 16 sec", &rules),
        "prompt:\n  speak for 16 sec"
    );
}

#[test]
fn test_malformed_rewrite_pattern_fails_at_construction() {
    assert!(RewriteRule::new("[", "x").is_err());
    assert!(RewriteRule::computed("(?P<", |_| String::new()).is_err());
}

#[test]
fn test_rewrite_document_updates_lines_and_reports_change() {
    let mut doc = Document::from_bytes(b"count: 8\r\ncount: 9\r\n", Encoding::Utf8).unwrap();
    let rules = vec![RewriteRule::new(r"count: (\d+)", "count: {n}")
        .unwrap()
        .with_guard(|caps| &caps[1] == "8")];

    assert!(rewrite_document(&mut doc, &rules));
    assert_eq!(doc.lines(), ["count: {n}", "count: 9"]);
    // Encoding, line-ending style, and the trailing newline are untouched.
    assert_eq!(doc.to_bytes().unwrap(), b"count: {n}\r\ncount: 9\r\n");

    // A second pass changes nothing.
    assert!(!rewrite_document(&mut doc, &rules));
}

#[test]
fn test_rewrite_document_no_match_reports_unchanged() {
    let mut doc = Document::from_lines(["hello"]);
    let rules = vec![RewriteRule::new("absent", "x").unwrap()];
    assert!(!rewrite_document(&mut doc, &rules));
    assert_eq!(doc.lines(), ["hello"]);
}

// --- Patch Operation Sequencer ---

#[test]
fn test_drift_worked_example() {
    // Both operations are authored against the original 4-line document. The
    // second op's index 3 (originally "D") must resolve to effective index 4
    // after the first op added one net line.
    let mut doc = Document::from_lines(["A", "B", "C", "D"]);
    let ops = vec![
        PatchOp::replace_range(1, 1, ["X", "Y"]),
        PatchOp::insert_after(3, ["Z"]),
    ];
    let report = apply_ops(&mut doc, &ops).unwrap();
    assert_eq!(doc.lines(), ["A", "X", "Y", "C", "Z", "D"]);
    assert_eq!(report.net_drift(), 2);
    assert_eq!(report.applied[1].effective_start, 4);
}

#[test]
fn test_drift_with_deletions_shifting_left() {
    let mut doc = Document::from_lines(["0", "1", "2", "3", "4", "5"]);
    let ops = vec![
        PatchOp::delete_range(1, 2),
        // Authored against the original: line 4 is "4". After the deletion
        // the effective index is 2.
        PatchOp::replace_range(4, 1, ["four"]),
    ];
    let report = apply_ops(&mut doc, &ops).unwrap();
    assert_eq!(doc.lines(), ["0", "3", "four", "5"]);
    assert_eq!(report.applied[1].effective_start, 2);
    assert_eq!(report.net_drift(), -2);
}

#[test]
fn test_drift_matches_manual_renumbering() {
    // The sequencer's result must equal applying manually renumbered ops
    // naively in order.
    let original = ["a", "b", "c", "d", "e", "f", "g"];
    let mut doc = Document::from_lines(original);
    let ops = vec![
        PatchOp::insert_after(0, ["top"]),
        PatchOp::delete_range(2, 2),
        PatchOp::replace_range(5, 1, ["F1", "F2", "F3"]),
        PatchOp::insert_after(7, ["bottom"]),
    ];
    apply_ops(&mut doc, &ops).unwrap();

    // Hand-renumbered equivalent: +1 after the insert, -2 after the delete...
    let expected = ["top", "a", "b", "e", "F1", "F2", "F3", "g", "bottom"];
    assert_eq!(doc.lines(), expected);
}

#[test]
fn test_insert_at_top_and_end() {
    let mut doc = Document::from_lines(["mid"]);
    let ops = vec![
        PatchOp::insert_after(0, ["first"]),
        PatchOp::insert_after(1, ["last"]),
    ];
    apply_ops(&mut doc, &ops).unwrap();
    assert_eq!(doc.lines(), ["first", "mid", "last"]);
}

#[test]
fn test_delete_everything() {
    let mut doc = Document::from_lines(["a", "b"]);
    apply_ops(&mut doc, &[PatchOp::delete_range(0, 2)]).unwrap();
    assert!(doc.is_empty());
    assert_eq!(doc.to_bytes().unwrap(), b"");
}

#[test]
fn test_out_of_range_names_the_offending_operation() {
    let mut doc = Document::from_lines(["a", "b", "c"]);
    let ops = vec![
        PatchOp::delete_range(0, 1),
        PatchOp::replace_range(3, 1, ["x"]),
    ];
    // Authored index 3 shifts to effective index 2, but the replacement spans
    // through line 3 of a 2-line document.
    let err = apply_ops(&mut doc, &ops).unwrap_err();
    assert_eq!(
        err,
        RangeError::OutOfBounds {
            op_index: 1,
            effective_start: 2,
            span: 1,
            len: 2,
        }
    );
}

#[test]
fn test_negative_effective_index_is_out_of_range() {
    let mut doc = Document::from_lines(["a", "b", "c"]);
    let ops = vec![
        PatchOp::delete_range(0, 3),
        // Drift is now -3; authored index 0 resolves to -3.
        PatchOp::insert_after(0, ["x"]),
    ];
    let err = apply_ops(&mut doc, &ops).unwrap_err();
    assert!(matches!(
        err,
        RangeError::OutOfBounds {
            op_index: 1,
            effective_start: -3,
            ..
        }
    ));
}

#[test]
fn test_failed_batch_is_all_or_nothing() {
    let mut doc = Document::from_bytes(b"a\nb\nc\n", Encoding::Utf8).unwrap();
    let before = doc.to_bytes().unwrap();
    let ops = vec![
        PatchOp::insert_after(1, ["inserted"]),
        PatchOp::delete_range(10, 1),
    ];
    assert!(apply_ops(&mut doc, &ops).is_err());
    // The successful first op must not be observable.
    assert_eq!(doc.to_bytes().unwrap(), before);
}

#[test]
fn test_apply_is_deterministic() {
    let ops = vec![
        PatchOp::replace_range(0, 2, ["r"]),
        PatchOp::insert_after(3, ["i1", "i2"]),
        PatchOp::delete_range(4, 1),
    ];
    let mut first = Document::from_lines(["a", "b", "c", "d", "e"]);
    let mut second = first.clone();
    apply_ops(&mut first, &ops).unwrap();
    apply_ops(&mut second, &ops).unwrap();
    assert_eq!(first.to_bytes().unwrap(), second.to_bytes().unwrap());
}

#[test]
fn test_empty_batch_is_a_no_op() {
    let mut doc = Document::from_lines(["a"]);
    let report = apply_ops(&mut doc, &[]).unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(report.net_drift(), 0);
    assert_eq!(doc.lines(), ["a"]);
}

#[test]
fn test_anchored_migration_in_original_coordinates() {
    // The shape of a real migration: locate markers first, author all edits
    // against those original positions, then apply them as one batch.
    let doc_text = indoc! {"
        <!DOCTYPE html>
        <head>
        </head>
        <script>
            const LIFF_ID = 'old-id';
            const API_BASE = 'http://legacy';
            const RETRIES = 3;
            start();
        </script>
    "};
    let mut doc = Document::from_text(doc_text);

    let head_end = find_anchor(&doc, &AnchorPattern::literal("</head>"))
        .unwrap()
        .expect("head close tag");
    let consts = find_anchor(&doc, &AnchorPattern::literal("const LIFF_ID"))
        .unwrap()
        .expect("constants section");
    let start_call = find_anchor(&doc, &AnchorPattern::literal("start();"))
        .unwrap()
        .expect("start call");

    let ops = vec![
        PatchOp::insert_after(head_end + 1, ["<!-- sdk -->", "<script src=\"sdk.js\"></script>"]),
        PatchOp::replace_range(
            consts,
            3,
            [
                "    const LIFF_ID = 'new-id';",
                "    const CLIENT_URL = 'https://example.test';",
            ],
        ),
        PatchOp::insert_after(start_call + 1, ["    report();"]),
    ];
    apply_ops(&mut doc, &ops).unwrap();

    let expected = indoc! {"
        <!DOCTYPE html>
        <head>
        </head>
        <!-- sdk -->
        <script src=\"sdk.js\"></script>
        <script>
            const LIFF_ID = 'new-id';
            const CLIENT_URL = 'https://example.test';
            start();
            report();
        </script>
    "};
    assert_eq!(doc.text(), expected.trim_end_matches('\n'));
}

// --- File Pipeline ---

#[test]
fn test_patch_file_in_place() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    fs::write(&path, "one\ntwo\nthree\n").unwrap();

    let ops = vec![PatchOp::replace_range(1, 1, ["TWO"])];
    let outcome = patch_file(&path, Encoding::Utf8, &ops, ApplyOptions::default()).unwrap();

    assert!(outcome.diff.is_none());
    assert_eq!(outcome.report.applied.len(), 1);
    assert_eq!(fs::read_to_string(&path).unwrap(), "one\nTWO\nthree\n");
}

#[test]
fn test_patch_file_dry_run_leaves_file_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    fs::write(&path, "one\ntwo\n").unwrap();

    let ops = vec![PatchOp::replace_range(0, 1, ["ONE"])];
    let options = ApplyOptions::builder().dry_run(true).build();
    let outcome = patch_file(&path, Encoding::Utf8, &ops, options).unwrap();

    let diff = outcome.diff.expect("dry run produces a diff");
    assert!(diff.contains("-one"));
    assert!(diff.contains("+ONE"));
    assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
}

#[test]
fn test_patch_file_out_of_range_writes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("doc.txt");
    fs::write(&path, "only line\n").unwrap();

    let ops = vec![PatchOp::delete_range(5, 1)];
    let err = patch_file(&path, Encoding::Utf8, &ops, ApplyOptions::default()).unwrap_err();
    assert!(matches!(err, TransformError::Range(_)));
    assert_eq!(fs::read_to_string(&path).unwrap(), "only line\n");
}

#[test]
fn test_patch_file_missing_target() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("absent.txt");
    let err = patch_file(&path, Encoding::Utf8, &[], ApplyOptions::default()).unwrap_err();
    assert!(matches!(err, TransformError::TargetNotFound(_)));
}

#[test]
fn test_patch_file_preserves_crlf_and_missing_trailing_newline() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dos.txt");
    fs::write(&path, b"first\r\nlast").unwrap();

    let ops = vec![PatchOp::insert_after(1, ["middle"])];
    patch_file(&path, Encoding::Utf8, &ops, ApplyOptions::default()).unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"first\r\nmiddle\r\nlast");
}

#[test]
fn test_rewrite_file_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("template.js");
    fs::write(&path, "duration: 8 seconds\nduration: 16 seconds\n").unwrap();

    let rules = vec![RewriteRule::new(r"duration: (\d+) seconds", "duration: {{len}} seconds")
        .unwrap()
        .with_guard(|caps| &caps[1] == "8")];
    let outcome = rewrite_file(&path, Encoding::Utf8, &rules, ApplyOptions::default()).unwrap();

    assert!(outcome.changed);
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "duration: {{len}} seconds\nduration: 16 seconds\n"
    );

    // Reprocessing the migrated file is a no-op.
    let outcome = rewrite_file(&path, Encoding::Utf8, &rules, ApplyOptions::default()).unwrap();
    assert!(!outcome.changed);
}

#[test]
fn test_read_write_document_round_trip_on_disk() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("in.txt");
    let dest = dir.path().join("out.txt");
    let bytes: &[u8] = b"\xef\xbb\xbfkeep\r\nall of it\r\nno trailing";
    fs::write(&source, bytes).unwrap();

    let doc = read_document(&source, Encoding::Utf8).unwrap();
    write_document(&doc, &dest).unwrap();
    assert_eq!(fs::read(&dest).unwrap(), bytes);
}

#[test]
fn test_read_document_rejects_directory() {
    let dir = tempdir().unwrap();
    let err = read_document(dir.path(), Encoding::Utf8).unwrap_err();
    assert!(matches!(err, TransformError::TargetIsDirectory { .. }));
}
