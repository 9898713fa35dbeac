//! Response parsing: pulls structured intent out of free-form model text.
//!
//! The vision model is asked to embed a JSON fragment (target descriptor
//! and/or pixel coordinates) inside its prose. Providers without structured
//! output mangle this in every way imaginable, so extraction is
//! brace-balanced rather than regex-first, with a regex fallback for the
//! numeric fields when the fragment itself is broken JSON.
use serde::Deserialize;

use crate::accessibility::TargetDescriptor;

/// Raw pixel coordinates proposed by the model, in screenshot space.
/// Center-point semantics by contract with the prompt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawCoordinates {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
}

/// Result of interpreting one model response. Transient: produced and
/// consumed within a single guidance cycle.
#[derive(Debug, Clone)]
pub struct ParsedGuidance {
    /// The prose shown to the user, with any structured fragment stripped.
    pub display_text: String,
    pub target: Option<TargetDescriptor>,
    pub coordinates: Option<RawCoordinates>,
    pub is_complete: bool,
}

#[derive(Debug, Deserialize)]
struct FragmentPayload {
    #[serde(default)]
    target: Option<TargetDescriptor>,
    #[serde(default)]
    coordinates: Option<RawCoordinates>,
    // Legacy format: coordinates at the top level of the fragment.
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    height: Option<f64>,
}

pub fn parse(model_text: &str) -> ParsedGuidance {
    let is_complete = is_completion(model_text);

    let mut target: Option<TargetDescriptor> = None;
    let mut coordinates: Option<RawCoordinates> = None;
    let mut recognized: Vec<(usize, usize)> = Vec::new();

    // Every recognized fragment is stripped from the prose, even when a
    // response carries several. The structured fields merge across them:
    // the first fragment supplying each slot wins, so a target-only
    // fragment and a separate coordinates-only blob combine instead of one
    // discarding the other.
    for (start, end) in balanced_fragments(model_text) {
        let Some((t, c)) = interpret_fragment(&model_text[start..end]) else {
            continue;
        };
        recognized.push((start, end));
        target = target.or(t);
        coordinates = coordinates.or(c);
    }

    let mut display_text = model_text.to_string();
    if !recognized.is_empty() {
        display_text = strip_fragments(model_text, &recognized);
    }

    if target.is_none() && coordinates.is_none() {
        target = infer_target(model_text);
        if target.is_some() {
            tracing::debug!(target = ?target, "no structured fragment, target inferred from prose");
        }
    }

    ParsedGuidance {
        display_text: display_text.trim().to_string(),
        target,
        coordinates,
        is_complete,
    }
}

/// Completion classifier over the whole response text. Deliberately
/// permissive: missing a real completion is more annoying than an early
/// positive on an unambiguous phrase.
pub fn is_completion(text: &str) -> bool {
    let lc = text.trim().to_lowercase();
    const MARKERS: [&str; 6] = ["done!", "done.", "complete!", "finished!", "success!", "🎉"];
    if MARKERS.iter().any(|m| lc.starts_with(m)) {
        return true;
    }
    (lc.contains("successfully") && lc.contains("created"))
        || (lc.contains("goal") && lc.contains("achieved"))
}

/// Byte ranges of top-level `{...}` fragments, tracking nesting depth and
/// string-literal boundaries (with escapes) so a fragment embedded in prose
/// is isolated correctly even when its contents are malformed.
fn balanced_fragments(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut fragments = Vec::new();
    let mut start: Option<usize> = None;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        if let Some(s) = start.take() {
                            fragments.push((s, i + 1));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    fragments
}

/// Parses one fragment into (target, coordinates). `None` when the fragment
/// carries neither, e.g. an unrelated JSON blob quoted in the prose.
fn interpret_fragment(fragment: &str) -> Option<(Option<TargetDescriptor>, Option<RawCoordinates>)> {
    match serde_json::from_str::<FragmentPayload>(fragment) {
        Ok(payload) => {
            let coordinates = payload.coordinates.or_else(|| {
                // Legacy: {"x":.., "y":..} at the top level.
                match (payload.x, payload.y) {
                    (Some(x), Some(y)) => Some(RawCoordinates {
                        x,
                        y,
                        width: payload.width,
                        height: payload.height,
                    }),
                    _ => None,
                }
            });
            if payload.target.is_none() && coordinates.is_none() {
                None
            } else {
                Some((payload.target, coordinates))
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "fragment is not valid JSON, trying field extraction");
            regex_coordinate_fallback(fragment).map(|c| (None, Some(c)))
        }
    }
}

/// Last-resort extraction of numeric coordinate fields from a broken fragment.
fn regex_coordinate_fallback(fragment: &str) -> Option<RawCoordinates> {
    fn field(fragment: &str, name: &str) -> Option<f64> {
        let re = regex::Regex::new(&format!(r#""{name}"\s*:\s*(-?\d+(?:\.\d+)?)"#)).ok()?;
        re.captures(fragment)?.get(1)?.as_str().parse().ok()
    }
    let x = field(fragment, "x")?;
    let y = field(fragment, "y")?;
    Some(RawCoordinates {
        x,
        y,
        width: field(fragment, "width"),
        height: field(fragment, "height"),
    })
}

/// Removes the fragments from the prose, along with any code-fence markers
/// left empty around them, so the user never sees raw payload. `ranges` are
/// non-overlapping and in document order.
fn strip_fragments(text: &str, ranges: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for &(start, end) in ranges {
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);

    // Fences that only wrapped the fragment are now empty shells.
    if let Ok(fence_re) = regex::Regex::new(r"```(?:json)?\s*```") {
        out = fence_re.replace_all(&out, "").to_string();
    }

    // Collapse the whitespace gap the fragment left behind.
    if let Ok(ws_re) = regex::Regex::new(r"[ \t]{2,}") {
        out = ws_re.replace_all(&out, " ").to_string();
    }
    out.trim().to_string()
}

/// Best-effort inference when the model returned pure prose: quoted text
/// after an action verb, plus a special case for quit accelerators.
fn infer_target(text: &str) -> Option<TargetDescriptor> {
    let verb_re =
        regex::Regex::new(r#"(?i)\b(?:click|tap|select|press)\b[^"'‘’“”]*["'“‘]([^"'“”‘’]+)["'”’]"#)
            .ok()?;
    if let Some(caps) = verb_re.captures(text) {
        return Some(TargetDescriptor {
            text: caps.get(1)?.as_str().to_string(),
            kind: None,
            context: None,
        });
    }

    // "Press Cmd+Q" style shortcut with no quoted target: point at the app
    // menu instead. Use the capitalized app name next to the shortcut if the
    // prose offers one, otherwise literally "Quit".
    let quit_re = regex::Regex::new(r"(?i)(?:⌘\s*Q|cmd\s*\+\s*q|command\s*\+\s*q|ctrl\s*\+\s*q)").ok()?;
    if quit_re.is_match(text) {
        let app_re = regex::Regex::new(r"\b([A-Z][a-zA-Z]{2,})\b").ok()?;
        let app = app_re
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .find(|w| !matches!(w.as_str(), "Press" | "Cmd" | "Command" | "Ctrl" | "Quit" | "The"));
        return Some(TargetDescriptor {
            text: app.unwrap_or_else(|| "Quit".to_string()),
            kind: Some("menu".into()),
            context: None,
        });
    }

    None
}
