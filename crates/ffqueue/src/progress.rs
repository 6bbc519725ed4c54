//! Extraction of progress information from ffmpeg's diagnostic output.
//!
//! ffmpeg reports progress on stderr as `frame=  10 fps=... time=01:02:03.45 bitrate=...`,
//! repeated every half second or so. Everything here is pure and works on
//! whatever chunk a single pipe read produced, which need not be line aligned.

use crate::error::DurationError;

const TIME_MARKER: &str = "time=";
const PROBE_DURATION_KEY: &str = "duration=";

/// Find the elapsed processing time in a chunk of ffmpeg output.
///
/// Uses the last parsable `time=` marker in the chunk since it is the most
/// recent one. Returns `None` when the chunk carries no usable marker
/// (including `time=N/A`); it never reports zero for a missing marker.
pub fn find_elapsed_seconds(chunk: &str) -> Option<i64> {
    chunk
        .match_indices(TIME_MARKER)
        .filter_map(|(pos, _)| {
            let rest = &chunk[pos + TIME_MARKER.len()..];
            let token = rest
                .split(|c: char| c.is_whitespace())
                .next()
                .unwrap_or("");
            parse_clock(token).ok()
        })
        .last()
}

/// Return the first configured error phrase contained in `chunk`
pub fn find_error_marker<'a, S: AsRef<str>>(chunk: &str, markers: &'a [S]) -> Option<&'a str> {
    markers
        .iter()
        .map(|m| m.as_ref())
        .find(|m| !m.is_empty() && chunk.contains(m))
}

/// True if `chunk` contains any of the configured error phrases
pub fn contains_error_marker<S: AsRef<str>>(chunk: &str, markers: &[S]) -> bool {
    find_error_marker(chunk, markers).is_some()
}

/// Parse a `[-]HH:MM:SS` duration into a signed number of seconds.
///
/// Fractional seconds (`00:00:05.80`) are accepted and truncated.
pub fn parse_duration(text: &str) -> Result<i64, DurationError> {
    parse_clock(text.trim())
}

/// Format seconds as `[-]HH:MM:SS`. Hours are padded to two digits but may grow beyond.
pub fn format_duration(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let total = seconds.unsigned_abs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, secs)
}

/// Progress percentage of `elapsed` against `duration`, clamped to 0..=100.
///
/// A zero or negative duration (unknown length) always reports 0.
pub fn percent(elapsed: i64, duration: i64) -> u32 {
    if duration <= 0 {
        return 0;
    }
    let pct = elapsed.saturating_mul(100) / duration;
    pct.clamp(0, 100) as u32
}

/// Locate the `duration=<seconds>` entry in ffprobe `default=noprint_wrappers=1` output.
///
/// ffprobe prints `duration=N/A` for streams without a known length, which yields `None`.
pub fn find_probe_duration(output: &str) -> Option<i64> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(PROBE_DURATION_KEY))
        .filter_map(|value| value.trim().parse::<f64>().ok())
        .find(|value| value.is_finite())
        .map(|value| value.trunc() as i64)
}

fn parse_clock(text: &str) -> Result<i64, DurationError> {
    let format_err = || DurationError::Format(text.to_string());

    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    let parts: Vec<&str> = body.split(':').collect();
    if parts.len() != 3 {
        return Err(format_err());
    }

    let seconds_part = parts[2].split('.').next().unwrap_or("");

    let hours = parse_field(text, parts[0])?;
    let minutes = parse_field(text, parts[1])?;
    let seconds = parse_field(text, seconds_part)?;

    let total = hours
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes.checked_mul(60)?))
        .and_then(|hm| hm.checked_add(seconds))
        .ok_or_else(format_err)?;

    Ok(if negative { -total } else { total })
}

fn parse_field(input: &str, field: &str) -> Result<i64, DurationError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DurationError::Number {
            input: input.to_string(),
            field: field.to_string(),
        });
    }
    field.parse::<i64>().map_err(|_| DurationError::Number {
        input: input.to_string(),
        field: field.to_string(),
    })
}
