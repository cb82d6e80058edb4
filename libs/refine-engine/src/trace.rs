//! Execution traces for failing tests.
//!
//! A traced run executes the candidate under a small harness that records
//! call/line/return/exception events up to a nesting depth and prints them
//! to stderr after the program finishes. Only Python candidates can be
//! traced.

use refine_common::config::{RuntimeConfig, TraceLimits};
use refine_common::types::Language;

pub const HARNESS_FILE: &str = "refine_trace.py";

const EVENT_PREFIX: &str = "@@TRACE ";
const OMITTED_PREFIX: &str = "@@OMITTED ";

/// sys.settrace harness: argv is <target> <max_depth> <keep>
pub const PYTHON_HARNESS: &str = r#"import sys
import collections

def _refine_main():
    target, max_depth, keep = sys.argv[1], int(sys.argv[2]), int(sys.argv[3])
    with open(target) as f:
        code = compile(f.read(), target, "exec")
    head, tail = [], collections.deque(maxlen=keep)
    state = {"depth": 0, "total": 0}

    def emit(text):
        state["total"] += 1
        entry = "%d\t%s" % (state["depth"], text[:200].replace("\n", " "))
        if len(head) < keep:
            head.append(entry)
        else:
            tail.append(entry)

    def tracer(frame, event, arg):
        if frame.f_code.co_filename != target:
            return None
        if event == "call":
            state["depth"] += 1
            if state["depth"] <= max_depth:
                names = frame.f_code.co_varnames[:frame.f_code.co_argcount]
                args = ", ".join("%s=%r" % (n, frame.f_locals.get(n)) for n in names)
                emit("call %s(%s)" % (frame.f_code.co_name, args))
        elif state["depth"] <= max_depth:
            if event == "line":
                emit("line %d" % frame.f_lineno)
            elif event == "return":
                emit("return %s -> %r" % (frame.f_code.co_name, arg))
            elif event == "exception":
                emit("exception %s: %s" % (arg[0].__name__, arg[1]))
        if event == "return":
            state["depth"] -= 1
        return tracer

    sys.argv = [target]
    sys.settrace(tracer)
    try:
        exec(code, {"__name__": "__main__", "__file__": target})
    finally:
        sys.settrace(None)
        out = sys.stderr
        for entry in head:
            out.write("@@TRACE " + entry + "\n")
        omitted = state["total"] - len(head) - len(tail)
        if omitted > 0:
            out.write("@@OMITTED %d\n" % omitted)
        for entry in tail:
            out.write("@@TRACE " + entry + "\n")
        out.flush()

_refine_main()
"#;

/// Command line for a traced run, or `None` when the language has no tracer
pub fn traced_argv(runtime: &RuntimeConfig, limits: &TraceLimits) -> Option<Vec<String>> {
    match runtime.language {
        Language::Python => Some(vec![
            runtime.command.clone(),
            HARNESS_FILE.to_string(),
            runtime.file_name.clone(),
            limits.max_depth.to_string(),
            limits.max_lines.to_string(),
        ]),
        Language::Shell => None,
    }
}

/// Separate harness output from the program's own stderr.
///
/// Returns the program stderr and the rendered trace (`None` when the
/// harness recorded nothing).
pub fn split_trace(stderr: &str, limits: &TraceLimits) -> (String, Option<String>) {
    let mut program_stderr = Vec::new();
    let mut lines = Vec::new();
    let mut omitted = 0usize;
    let mut omitted_at = 0usize;

    for line in stderr.lines() {
        if let Some(event) = line.strip_prefix(EVENT_PREFIX) {
            let (depth, text) = match event.split_once('\t') {
                Some((d, t)) => (d.parse::<usize>().unwrap_or(0), t),
                None => (0, event),
            };
            if depth <= limits.max_depth {
                let indent = "  ".repeat(depth.saturating_sub(1));
                lines.push(format!("{}{}", indent, text));
            }
        } else if let Some(count) = line.strip_prefix(OMITTED_PREFIX) {
            omitted += count.trim().parse::<usize>().unwrap_or(0);
            omitted_at = lines.len();
        } else {
            program_stderr.push(line);
        }
    }

    if lines.is_empty() {
        return (program_stderr.join("\n"), None);
    }

    let marker_lines = usize::from(omitted > 0);
    let rendered = if lines.len() + marker_lines > limits.max_lines {
        clip_head_tail(lines, limits.max_lines, omitted)
    } else {
        if omitted > 0 {
            lines.insert(omitted_at, omitted_marker(omitted));
        }
        lines
    };
    (program_stderr.join("\n"), Some(rendered.join("\n")))
}

fn omitted_marker(count: usize) -> String {
    format!("... {} omitted lines ...", count)
}

/// Keep the first and last halves of `lines` with a marker between them,
/// `max_lines` lines in total including the marker. `already_omitted`
/// counts lines dropped before clipping.
fn clip_head_tail(mut lines: Vec<String>, max_lines: usize, already_omitted: usize) -> Vec<String> {
    if lines.len() <= max_lines && already_omitted == 0 {
        return lines;
    }
    let keep = max_lines.saturating_sub(1).min(lines.len());
    let head = keep.div_ceil(2);
    let tail = keep - head;
    let cut = lines.len() - keep;
    let tail_lines = lines.split_off(lines.len() - tail);
    lines.truncate(head);
    lines.push(omitted_marker(cut + already_omitted));
    lines.extend(tail_lines);
    lines
}

/// Clip text to at most `max_lines` lines, keeping the head and tail
pub fn clip_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    clip_head_tail(lines, max_lines, 0).join("\n")
}
