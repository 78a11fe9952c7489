//! Incremental extraction of items from a streamed JSON array.
//!
//! Both functions take the whole output accumulated so far and re-scan it
//! from the start. A completed object's source span never changes once its
//! closing brace has arrived, so calling [`extract_items`] on growing prefixes
//! of the same text only ever appends to the result.

use hookline_core::item::ParsedItem;

/// Field names whose presence marks progress through an in-flight item.
pub const PROGRESS_MARKERS: [&str; 4] = ["\"hook\"", "\"caption\"", "\"body\"", "\"brollQuery\""];

pub const MIN_PARTIAL_PROGRESS: f64 = 0.1;
pub const MAX_PARTIAL_PROGRESS: f64 = 0.9;

/// Scanner state at the end of a pass.
#[derive(Debug, Default)]
struct ScanState {
    seen_array: bool,
    in_string: bool,
    escaped: bool,
    depth: usize,
    object_start: Option<usize>,
}

/// Single left-to-right pass. Calls `on_object` with the source span of every
/// top-level object inside the array, in encounter order.
fn scan<'a>(text: &'a str, mut on_object: impl FnMut(&'a str)) -> ScanState {
    let mut state = ScanState::default();

    // Structural characters are all ASCII, so byte offsets at them are
    // always valid char boundaries.
    for (i, &b) in text.as_bytes().iter().enumerate() {
        if !state.seen_array {
            if b == b'[' {
                state.seen_array = true;
            }
            continue;
        }

        if state.in_string {
            if state.escaped {
                state.escaped = false;
            } else if b == b'\\' {
                state.escaped = true;
            } else if b == b'"' {
                state.in_string = false;
            }
            continue;
        }

        match b {
            b'"' => state.in_string = true,
            b'{' => {
                if state.depth == 0 {
                    state.object_start = Some(i);
                }
                state.depth += 1;
            }
            b'}' if state.depth > 0 => {
                state.depth -= 1;
                if state.depth == 0 {
                    if let Some(start) = state.object_start {
                        on_object(&text[start..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    state
}

/// Every complete, well-formed object inside the top-level array, in order.
///
/// Candidates that fail to parse are dropped silently; half-written or
/// malformed objects are normal while a stream is in flight.
pub fn extract_items(text: &str) -> Vec<ParsedItem> {
    let mut items = Vec::new();
    scan(text, |candidate| {
        match serde_json::from_str::<ParsedItem>(candidate) {
            Ok(item) => items.push(item),
            Err(e) => tracing::trace!(error = %e, len = candidate.len(), "skipping malformed item"),
        }
    });
    items
}

/// Coarse completion estimate for the object currently being written.
///
/// Returns 0 when no object is open. Otherwise counts which of the
/// [`PROGRESS_MARKERS`] appear in the open object and maps that to a fraction
/// clamped to `[0.1, 0.9]`; a full 1.0 only comes from a parsed item.
pub fn estimate_partial_progress(text: &str) -> f64 {
    let state = scan(text, |_| {});
    let start = match state.object_start {
        Some(start) if state.depth > 0 => start,
        _ => return 0.0,
    };

    let open = &text[start..];
    let seen = PROGRESS_MARKERS
        .iter()
        .filter(|marker| open.contains(*marker))
        .count();

    (seen as f64 / PROGRESS_MARKERS.len() as f64).clamp(MIN_PARTIAL_PROGRESS, MAX_PARTIAL_PROGRESS)
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_text_value() -> impl Strategy<Value = String> {
        prop::string::string_regex(r#"[a-zA-Z0-9 {}\[\]"\\é🏡,:]{0,24}"#).unwrap()
    }

    fn arb_item() -> impl Strategy<Value = ParsedItem> {
        (
            prop::option::of(arb_text_value()),
            prop::option::of(arb_text_value()),
            prop::option::of(arb_text_value()),
        )
            .prop_map(|(hook, caption, broll_query)| ParsedItem {
                hook,
                caption,
                slides: None,
                broll_query,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_full_array_extracts_every_item(items in prop::collection::vec(arb_item(), 0..6)) {
            let text = serde_json::to_string(&items).unwrap();
            prop_assert_eq!(extract_items(&text), items);
        }

        #[test]
        fn prop_prefix_results_are_prefix_consistent(
            items in prop::collection::vec(arb_item(), 1..5),
            cut in 0usize..1000,
        ) {
            let text = serde_json::to_string(&items).unwrap();
            let mut end = cut.min(text.len());
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            let partial = extract_items(&text[..end]);
            let full = extract_items(&text);
            prop_assert!(partial.len() <= full.len());
            prop_assert_eq!(&full[..partial.len()], &partial[..]);
        }

        #[test]
        fn prop_progress_is_bounded(items in prop::collection::vec(arb_item(), 1..4), cut in 0usize..1000) {
            let text = serde_json::to_string(&items).unwrap();
            let mut end = cut.min(text.len());
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            let p = estimate_partial_progress(&text[..end]);
            prop_assert!(p == 0.0 || (MIN_PARTIAL_PROGRESS..=MAX_PARTIAL_PROGRESS).contains(&p));
        }
    }
}
