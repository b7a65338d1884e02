//! Detection and parsing of Python tracebacks out of free-form chat text.
//!
//! The input is whatever a human pasted into a channel: maybe no traceback,
//! maybe one, maybe a chained pair, maybe wrapped in a markdown fence with a
//! log prefix on every line. Detection is cheap and allocation-free; parsing
//! is tolerant and returns the best structure it can, failing only when
//! detection fired but not a single frame could be extracted.

use once_cell::sync::Lazy;
use regex::Regex;
use tracebot_protocol::Result;
use tracebot_protocol::TriageErr;
use tracebot_protocol::models::ParsedTraceback;
use tracebot_protocol::models::StackFrame;

/// Exception type recorded when the tail line was cut off (for example by a
/// chat-platform length limit).
pub const TRUNCATED_EXCEPTION_TYPE: &str = "<truncated>";

const BANNER: &str = "Traceback (most recent call last):";

static FRAME_RE: Lazy<Regex> = Lazy::new(|| {
    // Unanchored so leading log prefixes (timestamps, level tags) on frame
    // lines are tolerated.
    Regex::new(r#"(?m)File "([^"]+)", line (\d+)(?:, in (\S.*?))?[ \t]*$"#).expect("static regex")
});

static EXCEPTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*):\s?(.*)$")
        .expect("static regex")
});

static EXCEPTION_NO_MSG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\s*$")
        .expect("static regex")
});

static CHAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?:The above exception was the direct cause of the following exception:|During handling of the above exception, another exception occurred:)[ \t]*$",
    )
    .expect("static regex")
});

static SYNTAX_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?m)^.*File "([^"]+)", line (\d+)[^\n]*\n(?:[^\n]*\n)?[ \t]*\^+[ \t]*\n[ \t]*(SyntaxError|IndentationError|TabError):[ \t]*(.*)$"#,
    )
    .expect("static regex")
});

static CODE_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*\n(.*?)```").expect("static regex"));

static ANSI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("static regex"));

/// Stateless traceback detector/parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracebackParser;

impl TracebackParser {
    pub fn new() -> Self {
        Self
    }

    /// Cheap detection: true iff the text contains a traceback banner, a
    /// frame line, or a SyntaxError-style header. Must not allocate large
    /// structures.
    pub fn contains_traceback(&self, text: &str) -> bool {
        if text.is_empty() {
            return false;
        }
        text.contains(BANNER)
            || FRAME_RE.is_match(text)
            || SYNTAX_ERROR_RE.is_match(text)
    }

    /// Parse the first traceback found in `text`.
    ///
    /// Fails with `Parse` only when no frame could be extracted; a missing
    /// exception tail yields [`TRUNCATED_EXCEPTION_TYPE`] instead.
    pub fn parse(&self, text: &str) -> Result<ParsedTraceback> {
        if text.is_empty() {
            return Err(TriageErr::Parse("empty text".to_string()));
        }

        let cleaned = strip_ansi(text);
        let candidate = extract_from_code_blocks(&cleaned)
            .unwrap_or_else(|| cleaned.to_string());

        if let Some(syntax) = parse_syntax_error(&candidate, text) {
            return Ok(syntax);
        }

        let block = match candidate.find(BANNER) {
            Some(start) => &candidate[start..],
            // A bare `File "...", line N` counts as a detectable
            // traceback, so frame lines without a banner still parse.
            None => match candidate.lines().position(|line| FRAME_RE.is_match(line)) {
                Some(_) => candidate.as_str(),
                None => return Err(TriageErr::Parse("no traceback header found".to_string())),
            },
        };

        if CHAIN_RE.is_match(block) {
            return parse_chained(block, text);
        }
        parse_single(block, text)
    }

    /// Every disjoint traceback block in document order. Chain markers and
    /// repeated banners both delimit blocks; blocks that fail to parse are
    /// skipped.
    pub fn extract_all(&self, text: &str) -> Vec<ParsedTraceback> {
        let cleaned = strip_ansi(text);
        let candidate =
            extract_from_code_blocks(&cleaned).unwrap_or_else(|| cleaned.to_string());

        let mut blocks: Vec<&str> = Vec::new();
        for segment in split_on_chain_markers(&candidate) {
            let starts: Vec<usize> = segment.match_indices(BANNER).map(|(idx, _)| idx).collect();
            match starts.as_slice() {
                [] => {}
                [only] => blocks.push(&segment[*only..]),
                many => {
                    for pair in many.windows(2) {
                        blocks.push(&segment[pair[0]..pair[1]]);
                    }
                    blocks.push(&segment[many[many.len() - 1]..]);
                }
            }
        }

        blocks
            .into_iter()
            .filter_map(|block| parse_single(block, block).ok())
            .collect()
    }
}

fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Content of the first fenced code block containing a traceback, if any.
fn extract_from_code_blocks(text: &str) -> Option<String> {
    for captures in CODE_BLOCK_RE.captures_iter(text) {
        let block = captures.get(1)?.as_str();
        if block.contains(BANNER) || SYNTAX_ERROR_RE.is_match(block) {
            return Some(block.to_string());
        }
    }
    None
}

fn split_on_chain_markers(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut last = 0;
    for found in CHAIN_RE.find_iter(text) {
        segments.push(&text[last..found.start()]);
        last = found.end();
    }
    segments.push(&text[last..]);
    segments
}

fn parse_syntax_error(candidate: &str, raw_text: &str) -> Option<ParsedTraceback> {
    let captures = SYNTAX_ERROR_RE.captures(candidate)?;
    let line_number = captures[2].parse::<u32>().ok()?;
    let frame = StackFrame {
        file_path: captures[1].to_string(),
        line_number,
        function_name: "<module>".to_string(),
        code_line: None,
    };
    Some(ParsedTraceback {
        exception_type: captures[3].to_string(),
        exception_message: captures[4].trim_end().to_string(),
        frames: vec![frame],
        raw_text: raw_text.to_string(),
        is_chained: false,
        cause: None,
    })
}

fn parse_single(block: &str, raw_text: &str) -> Result<ParsedTraceback> {
    let lines: Vec<&str> = block.lines().collect();
    let frames = extract_frames(&lines);
    if frames.is_empty() {
        return Err(TriageErr::Parse("no stack frames found".to_string()));
    }

    let (exception_type, exception_message) = match extract_exception_tail(&lines) {
        Some(tail) => tail,
        None => (TRUNCATED_EXCEPTION_TYPE.to_string(), String::new()),
    };

    Ok(ParsedTraceback {
        exception_type,
        exception_message,
        frames,
        raw_text: raw_text.to_string(),
        is_chained: false,
        cause: None,
    })
}

fn parse_chained(block: &str, raw_text: &str) -> Result<ParsedTraceback> {
    let mut chain: Option<ParsedTraceback> = None;

    for segment in split_on_chain_markers(block) {
        let segment = segment.trim();
        if segment.is_empty() || !(segment.contains(BANNER) || FRAME_RE.is_match(segment)) {
            continue;
        }
        let Ok(mut parsed) = parse_single(segment, segment) else {
            continue;
        };
        let cause = chain.take();
        parsed.is_chained = cause.is_some();
        parsed.cause = cause.map(Box::new);
        chain = Some(parsed);
    }

    match chain {
        Some(mut outermost) => {
            // The outermost exception keeps the full original text.
            outermost.raw_text = raw_text.to_string();
            Ok(outermost)
        }
        None => Err(TriageErr::Parse(
            "could not parse any exception from chain".to_string(),
        )),
    }
}

fn extract_frames(lines: &[&str]) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if let Some(captures) = FRAME_RE.captures(lines[i]) {
            let Ok(line_number) = captures[2].parse::<u32>() else {
                i += 1;
                continue;
            };
            let function_name = captures
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| "<module>".to_string());

            // The source line, when printed, follows immediately and is
            // indented deeper than the frame header.
            let mut code_line = None;
            if let Some(next) = lines.get(i + 1)
                && next.starts_with("    ")
                && !next.trim_start().starts_with("File ")
            {
                code_line = Some(next.trim().to_string());
                i += 1;
            }

            frames.push(StackFrame {
                file_path: captures[1].to_string(),
                line_number,
                function_name,
                code_line,
            });
        }
        i += 1;
    }
    frames
}

/// Find the `<Type>: message` tail, including indented continuation lines.
/// Returns `None` when the block ends without one (truncated paste).
fn extract_exception_tail(lines: &[&str]) -> Option<(String, String)> {
    let last_frame_idx = lines
        .iter()
        .rposition(|line| FRAME_RE.is_match(line))?;

    let mut idx = last_frame_idx + 1;
    while idx < lines.len() {
        let line = lines[idx];
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('^') {
            idx += 1;
            continue;
        }
        // Skip the frame's source line; it is indented under the header.
        if line.starts_with("    ") {
            idx += 1;
            continue;
        }

        let stripped = line.trim_start();
        if let Some(captures) = EXCEPTION_RE.captures(stripped) {
            let exception_type = captures[1].to_string();
            let mut message = captures[2].trim_end().to_string();
            // Indented continuation lines belong to the message; an empty
            // line or a frame line terminates it.
            for follow in &lines[idx + 1..] {
                if follow.trim().is_empty() || FRAME_RE.is_match(follow) {
                    break;
                }
                if follow.starts_with(' ') || follow.starts_with('\t') {
                    message.push('\n');
                    message.push_str(follow.trim_end());
                } else {
                    break;
                }
            }
            return Some((exception_type, message));
        }
        if let Some(captures) = EXCEPTION_NO_MSG_RE.captures(stripped) {
            return Some((captures[1].to_string(), String::new()));
        }
        idx += 1;
    }
    None
}
