//! Purpose: Render a database dump as pretty JSON with optional ANSI colorization.
//! Exports: colorize_dump.
//! Role: Small, pure formatter used when stdout is a terminal or color is forced.
//! Invariants: When color is disabled, output equals serde_json::to_string_pretty.
//! Invariants: ANSI escapes appear only when explicitly enabled.
use dockerdb_reader::dump::Dump;

const INDENT: &str = "  ";

// Conservative 8/16-color palette for broad terminal compatibility.
const COLOR_BUCKET: &str = "34";
const COLOR_KEY: &str = "36";
const COLOR_STRING: &str = "32";
const COLOR_PUNCT: &str = "39";

pub fn colorize_dump(dump: &Dump, use_color: bool) -> String {
    let mut out = String::new();
    let buckets = dump
        .buckets()
        .iter()
        .map(|(name, records)| (name.as_str(), records));
    write_object(buckets, 0, COLOR_BUCKET, use_color, &mut out, |records, out| {
        write_object(records.iter(), 1, COLOR_KEY, use_color, out, |value, out| {
            push_colored(&encode(value), COLOR_STRING, use_color, out);
        });
    });
    out
}

// Entries are written in the order given; repeated keys are kept.
fn write_object<'e, V>(
    entries: impl ExactSizeIterator<Item = (&'e str, V)>,
    indent: usize,
    key_color: &str,
    use_color: bool,
    out: &mut String,
    mut write_value: impl FnMut(V, &mut String),
) {
    let len = entries.len();
    if len == 0 {
        push_colored("{}", COLOR_PUNCT, use_color, out);
        return;
    }
    push_colored("{", COLOR_PUNCT, use_color, out);
    out.push('\n');
    for (idx, (key, value)) in entries.enumerate() {
        push_indent(indent + 1, out);
        push_colored(&encode(key), key_color, use_color, out);
        push_colored(":", COLOR_PUNCT, use_color, out);
        out.push(' ');
        write_value(value, out);
        if idx + 1 < len {
            push_colored(",", COLOR_PUNCT, use_color, out);
        }
        out.push('\n');
    }
    push_indent(indent, out);
    push_colored("}", COLOR_PUNCT, use_color, out);
}

fn encode(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn push_indent(level: usize, out: &mut String) {
    for _ in 0..level {
        out.push_str(INDENT);
    }
}

fn push_colored(text: &str, color: &str, use_color: bool, out: &mut String) {
    if !use_color {
        out.push_str(text);
        return;
    }
    out.push_str("\u{1b}[");
    out.push_str(color);
    out.push('m');
    out.push_str(text);
    out.push_str("\u{1b}[0m");
}
