//! Helpers for rendering metrics in the Prometheus exposition format.

use std::borrow::Cow;

use tracing::trace;

use crate::alternatives::ColumnKind;

/// Prefix carried by every exported metric name.
pub const METRIC_PREFIX: &str = "pgexporter_";

/// Writes the metric name `pgexporter_<tag>[_<name>]`.
pub fn write_metric_name(buffer: &mut String, tag: &str, name: &str) {
    buffer.push_str(METRIC_PREFIX);
    buffer.push_str(tag);
    if !name.is_empty() {
        buffer.push('_');
        buffer.push_str(name);
    }
}

/// Writes a `#HELP` line.
///
/// An empty description falls back to the metric name itself, so every family
/// carries a help line even when the author left it out.
pub fn write_help_line(buffer: &mut String, tag: &str, name: &str, description: &str) {
    buffer.push_str("#HELP ");
    write_metric_name(buffer, tag, name);
    buffer.push(' ');
    if description.is_empty() {
        write_metric_name(buffer, tag, name);
    } else {
        buffer.push_str(description);
    }
    buffer.push('\n');
}

/// Writes a `#TYPE` line.
pub fn write_type_line(buffer: &mut String, tag: &str, name: &str, kind: ColumnKind) {
    buffer.push_str("#TYPE ");
    write_metric_name(buffer, tag, name);
    buffer.push(' ');
    buffer.push_str(kind.type_keyword());
    buffer.push('\n');
}

/// Writes one `,key="value"` label pair.
pub fn write_label(buffer: &mut String, key: &str, value: &str) {
    buffer.push(',');
    buffer.push_str(key);
    buffer.push_str("=\"");
    buffer.push_str(value);
    buffer.push('"');
}

/// Maps a raw SQL string to a numeric-valid Prometheus value.
///
/// Empty and NULL cells, `off`, `f` and `(disabled)` map to `0`; `on` and `t`
/// map to `1`; `NaN` and anything parsing as an integer or float passes
/// through unchanged; everything else maps to `1` with a trace log.
pub fn render_value<'a>(tag: &str, name: &str, raw: &'a str) -> &'a str {
    match raw {
        "" => return "0",
        "off" | "f" | "(disabled)" => return "0",
        "on" | "t" => return "1",
        "NaN" => return "NaN",
        _ => {}
    }

    if raw.parse::<i64>().is_ok() || raw.parse::<f64>().is_ok() {
        return raw;
    }

    trace!(tag, name, value = raw, "mapping non-numeric value to 1");
    "1"
}

/// Makes a string safe for use as a Prometheus key: interior `.` becomes `_`
/// and a trailing `.` is dropped.
pub fn safe_key(raw: &str) -> Cow<'_, str> {
    if !raw.contains('.') {
        return Cow::Borrowed(raw);
    }

    let last = raw.len() - 1;
    let mut out = String::with_capacity(raw.len());
    for (index, c) in raw.char_indices() {
        if c == '.' {
            if index == last {
                break;
            }
            out.push('_');
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Splits a PostgreSQL array literal `{a,b,c}` into its elements.
///
/// Only the outer braces are stripped and elements are not trimmed; the
/// server emits these arrays without decoration.
pub fn parse_array(raw: &str) -> Vec<&str> {
    let inner = raw
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(raw);
    if inner.is_empty() {
        return Vec::new();
    }
    inner.split(',').collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn help_line_falls_back_to_metric_name() {
        let mut buffer = String::new();
        write_help_line(&mut buffer, "locks", "count", "Lock count by mode");
        write_help_line(&mut buffer, "locks", "count", "");
        assert_eq!(
            buffer,
            "#HELP pgexporter_locks_count Lock count by mode\n\
             #HELP pgexporter_locks_count pgexporter_locks_count\n"
        );
    }

    #[test]
    fn type_line_omits_empty_name() {
        let mut buffer = String::new();
        write_type_line(&mut buffer, "stat_io", "", ColumnKind::Histogram);
        assert_eq!(buffer, "#TYPE pgexporter_stat_io histogram\n");
    }

    #[test]
    fn render_value_known_cases() {
        let cases = &[
            ("", "0"),
            ("off", "0"),
            ("f", "0"),
            ("(disabled)", "0"),
            ("on", "1"),
            ("t", "1"),
            ("NaN", "NaN"),
            ("42", "42"),
            ("-17", "-17"),
            ("3.25", "3.25"),
            ("1e9", "1e9"),
            ("4MB", "1"),
            ("replica", "1"),
        ];

        for (input, expected) in cases {
            assert_eq!(render_value("tag", "name", input), *expected, "input {input:?}");
        }
    }

    #[test]
    fn safe_key_known_cases() {
        let cases = &[
            ("work_mem", "work_mem"),
            ("auto_explain.log_timing", "auto_explain_log_timing"),
            ("trailing.", "trailing"),
            ("a.b.", "a_b"),
            ("a..", "a_"),
            (".", ""),
        ];

        for (input, expected) in cases {
            assert_eq!(safe_key(input), *expected, "input {input:?}");
        }
    }

    #[test]
    fn parse_array_known_cases() {
        assert_eq!(parse_array("{10,100,1000}"), vec!["10", "100", "1000"]);
        assert_eq!(parse_array("{5}"), vec!["5"]);
        assert!(parse_array("{}").is_empty());
        assert_eq!(parse_array("{ 1,2}"), vec![" 1", "2"], "elements are not trimmed");
    }

    proptest! {
        #[test]
        fn safe_key_is_idempotent(input in "[a-z_.]{0,24}") {
            let once = safe_key(&input).into_owned();
            let twice = safe_key(&once).into_owned();
            prop_assert_eq!(&once, &twice);
            prop_assert!(!once.contains('.'), "dots survive in {:?}", once);
        }

        #[test]
        fn render_value_is_numeric_or_nan(input in ".{0,16}") {
            let rendered = render_value("tag", "name", &input);
            let numeric = rendered.parse::<f64>().is_ok();
            prop_assert!(numeric || rendered == "NaN", "non-numeric rendering {:?}", rendered);
        }
    }
}
