//! Subcommand implementations. Output goes to a caller-supplied writer.

use color_eyre::eyre::{Result, WrapErr};
use console::style;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use tidemark_core::{Direction, MethodIndex};
use tidemark_trace::{Event, TraceFile, TraceSummary, WireValue};
use tracing::{debug, info};

/// Read and parse a trace file
pub fn load(path: &Path) -> Result<TraceFile> {
    let bytes =
        std::fs::read(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "Trace loaded");
    TraceFile::parse(&bytes).wrap_err_with(|| format!("{} is not a valid trace", path.display()))
}

#[derive(Serialize)]
struct Inspection<'a> {
    version: u16,
    strings: Vec<&'a str>,
    calls: Vec<SignatureView>,
    callbacks: Vec<SignatureView>,
    summary: TraceSummary,
}

#[derive(Serialize)]
struct SignatureView {
    method: String,
    args: Vec<String>,
    ret: String,
    inferred: bool,
}

fn signatures(trace: &TraceFile, direction: Direction) -> Vec<SignatureView> {
    trace
        .types
        .map(direction)
        .iter()
        .map(|(method, signature)| SignatureView {
            method: method_label(trace, method),
            args: signature.args().iter().map(ToString::to_string).collect(),
            ret: signature.return_kind().to_string(),
            inferred: signature.is_inferred(),
        })
        .collect()
}

fn method_label(trace: &TraceFile, method: MethodIndex) -> String {
    trace
        .method_name(method)
        .map_or_else(|_| method.to_string(), str::to_string)
}

fn render_signature(view: &SignatureView) -> String {
    let mut line = format!("{}({}) -> {}", view.method, view.args.join(", "), view.ret);
    if view.inferred {
        line.push_str("  [inferred]");
    }
    line
}

/// Header, string table, type maps, and summary
pub fn inspect(trace: &TraceFile, json: bool, out: &mut impl Write) -> Result<()> {
    let inspection = Inspection {
        version: trace.version,
        strings: trace.strings.iter().collect(),
        calls: signatures(trace, Direction::Call),
        callbacks: signatures(trace, Direction::Callback),
        summary: TraceSummary::from_trace(trace),
    };
    if json {
        serde_json::to_writer_pretty(&mut *out, &inspection)?;
        writeln!(out)?;
        return Ok(());
    }

    writeln!(out, "{} v{}", style("TIDEMARK trace").bold(), inspection.version)?;
    writeln!(out, "{} ({})", style("strings").cyan(), inspection.strings.len())?;
    for (i, s) in inspection.strings.iter().enumerate() {
        writeln!(out, "  {i:>4}  {s:?}")?;
    }
    for (label, views) in [("calls", &inspection.calls), ("callbacks", &inspection.callbacks)] {
        writeln!(out, "{} ({})", style(label).cyan(), views.len())?;
        for view in views {
            writeln!(out, "  {}", render_signature(view))?;
        }
    }
    let s = &inspection.summary;
    writeln!(out, "{}", style("summary").cyan())?;
    writeln!(out, "  events          {}", s.events)?;
    writeln!(out, "  calls           {}", s.calls)?;
    writeln!(out, "  callbacks       {}", s.callbacks)?;
    writeln!(out, "  returns         {}", s.returns)?;
    writeln!(out, "  throws          {}", s.throws)?;
    writeln!(out, "  bulk writes     {} ({} bytes)", s.bulk_writes, s.bulk_bytes)?;
    writeln!(out, "  indexed writes  {}", s.indexed_writes)?;
    writeln!(out, "  max depth       {}", s.max_depth)?;
    for (method, count) in &s.methods {
        writeln!(out, "    {method:<24} {count}")?;
    }
    Ok(())
}

#[derive(Serialize)]
struct DumpLine<'a> {
    offset: usize,
    depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    event: &'a Event,
}

fn render_wire(trace: &TraceFile, value: &WireValue) -> String {
    match value {
        WireValue::Str(i) => trace
            .strings
            .get(*i)
            .map_or_else(|_| value.to_string(), |s| format!("{s:?}")),
        _ => value.to_string(),
    }
}

fn render_event(trace: &TraceFile, event: &Event) -> String {
    let mut line = String::new();
    match event {
        Event::Enter {
            direction,
            method,
            args,
        } => {
            let args: Vec<String> = args.iter().map(|a| render_wire(trace, a)).collect();
            let _ = write!(
                line,
                "{} {}({})",
                style(direction).green(),
                method_label(trace, *method),
                args.join(", ")
            );
        }
        Event::Return { value } => {
            let _ = write!(line, "{} {}", style("return").blue(), render_wire(trace, value));
        }
        Event::Throw => {
            let _ = write!(line, "{}", style("throw").red());
        }
        Event::BulkWrite { target, bytes } => {
            let _ = write!(
                line,
                "{} {target} [{}] {}",
                style(event.kind()).yellow(),
                bytes.len(),
                hex::encode(bytes)
            );
        }
        Event::IndexedWrite { target, value } => {
            let _ = write!(line, "{} {target} {value}", style(event.kind()).yellow());
        }
    }
    line
}

/// Event listing, indented by nesting depth
pub fn dump(trace: &TraceFile, json: bool, limit: Option<usize>, out: &mut impl Write) -> Result<()> {
    let mut depth = 0usize;
    let shown = limit.unwrap_or(usize::MAX);
    for traced in trace.events.iter().take(shown) {
        let event = &traced.event;
        if event.is_leave() {
            depth = depth.saturating_sub(1);
        }
        if json {
            let method = match event {
                Event::Enter { method, .. } => Some(method_label(trace, *method)),
                _ => None,
            };
            let line = DumpLine {
                offset: traced.offset,
                depth,
                method,
                event,
            };
            serde_json::to_writer(&mut *out, &line)?;
            writeln!(out)?;
        } else {
            writeln!(
                out,
                "{:>8}  {}{}",
                style(traced.offset).dim(),
                "  ".repeat(depth),
                render_event(trace, event)
            )?;
        }
        if event.is_enter() {
            depth += 1;
        }
    }
    if !json && trace.events.len() > shown {
        writeln!(out, "... {} more", trace.events.len() - shown)?;
    }
    Ok(())
}

/// Structural check. Errors when the file does not parse.
pub fn verify(path: &Path, out: &mut impl Write) -> Result<()> {
    let trace = load(path)?;
    let summary = TraceSummary::from_trace(&trace);
    info!(path = %path.display(), events = summary.events, "Trace verified");
    writeln!(
        out,
        "{} {}: format v{}, {} events, max depth {}",
        style("ok").green().bold(),
        path.display(),
        trace.version,
        summary.events,
        summary.max_depth
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidemark_trace::{
        encode_trace, AddressRef, ByteWriter, Scalar, StringInterner, TypeMapRegistry, ValueKind,
        WireEncode,
    };

    fn sample_bytes() -> Vec<u8> {
        let mut strings = StringInterner::new();
        let draw = MethodIndex::from_raw(strings.intern("draw").unwrap());
        let log = MethodIndex::from_raw(strings.intern("log").unwrap());
        let msg = strings.intern("hello").unwrap();
        let mut types = TypeMapRegistry::new();
        types.register(Direction::Call, draw, &[ValueKind::Uint32], ValueKind::Int32);
        types.register_inferred(Direction::Callback, log, &[ValueKind::String], ValueKind::Void);

        let events = [
            Event::Enter {
                direction: Direction::Call,
                method: draw,
                args: vec![WireValue::U32(3)],
            },
            Event::Enter {
                direction: Direction::Callback,
                method: log,
                args: vec![WireValue::Str(msg)],
            },
            Event::Return {
                value: WireValue::Void,
            },
            Event::BulkWrite {
                target: AddressRef::Static(64),
                bytes: vec![0xde, 0xad],
            },
            Event::IndexedWrite {
                target: AddressRef::Static(72),
                value: Scalar::U16(7),
            },
            Event::Return {
                value: WireValue::I32(-1),
            },
        ];
        let mut body = ByteWriter::new();
        for event in &events {
            event.encode(&mut body).unwrap();
        }
        encode_trace(&strings, &types, body.as_slice()).unwrap()
    }

    fn sample() -> TraceFile {
        TraceFile::parse(&sample_bytes()).unwrap()
    }

    fn text(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        console::strip_ansi_codes(&String::from_utf8(out).unwrap()).into_owned()
    }

    #[test]
    fn test_inspect_lists_tables_and_summary() {
        let trace = sample();
        let out = text(|o| inspect(&trace, false, o));
        assert!(out.contains("TIDEMARK trace v1"));
        assert!(out.contains("\"hello\""));
        assert!(out.contains("draw(u32) -> i32"));
        assert!(out.contains("[inferred]"));
        assert!(out.contains("max depth       2"));
    }

    #[test]
    fn test_inspect_json() {
        let trace = sample();
        let out = text(|o| inspect(&trace, true, o));
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["strings"][1], "log");
        assert_eq!(value["callbacks"][0]["inferred"], true);
        assert_eq!(value["summary"]["bulk_bytes"], 2);
    }

    #[test]
    fn test_dump_indents_and_hex_encodes() {
        let trace = sample();
        let out = text(|o| dump(&trace, false, None, o));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 6);
        assert!(lines[0].ends_with("call draw(3u32)"));
        assert!(lines[1].contains("    callback log(\"hello\")"));
        assert!(lines[3].contains("bulk_write static@0x40 [2] dead"));
        assert!(lines[4].contains("7u16"));
    }

    #[test]
    fn test_dump_limit() {
        let trace = sample();
        let out = text(|o| dump(&trace, false, Some(2), o));
        assert_eq!(out.lines().count(), 3);
        assert!(out.ends_with("... 4 more\n"));
    }

    #[test]
    fn test_dump_json_lines() {
        let trace = sample();
        let out = text(|o| dump(&trace, true, Some(3), o));
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["method"], "draw");
        assert_eq!(lines[1]["depth"], 1);
        assert!(lines[2].get("method").is_none());
        assert_eq!(lines[2]["depth"], 1);
    }

    #[test]
    fn test_verify_accepts_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.trace");
        std::fs::write(&path, sample_bytes()).unwrap();
        let out = text(|o| verify(&path, o));
        assert!(out.starts_with("ok "));
        assert!(out.contains("6 events"));
    }

    #[test]
    fn test_verify_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.trace");
        let bytes = sample_bytes();
        std::fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        let mut out = Vec::new();
        assert!(verify(&path, &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_verify_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let err = verify(&dir.path().join("absent"), &mut out).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
