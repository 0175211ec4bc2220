//! Think-tag filtering
//!
//! Models may emit a `<think>...</think>` reasoning region inline with their
//! answer. The filter hides that region from the visible transcript while
//! still scanning every fragment for the closing marker.
//!
//! Markers are matched per fragment, not across fragment boundaries. A
//! fragment holding both markers is suppressed in full: the start marker
//! turns suppression on before the emit decision and the end marker turns
//! it off afterwards.

/// Opening marker of a reasoning region
pub const THINK_START: &str = "<think>";
/// Closing marker of a reasoning region
pub const THINK_END: &str = "</think>";

/// Filter state carried between fragments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThinkState {
    pub suppressing: bool,
}

/// Advance the filter by one fragment
///
/// Returns the next state and whether `fragment` should be shown.
pub fn step(state: ThinkState, fragment: &str) -> (ThinkState, bool) {
    let mut suppressing = state.suppressing;
    if fragment.contains(THINK_START) {
        suppressing = true;
    }
    let emit = !suppressing;
    if fragment.contains(THINK_END) {
        suppressing = false;
    }
    (ThinkState { suppressing }, emit)
}

/// Accumulates the visible part of a fragment stream
#[derive(Debug, Clone, Default)]
pub struct ThinkFilter {
    state: ThinkState,
    visible: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment; returns it back when it is visible
    pub fn push<'a>(&mut self, fragment: &'a str) -> Option<&'a str> {
        let (next, emit) = step(self.state, fragment);
        self.state = next;
        if emit {
            self.visible.push_str(fragment);
            Some(fragment)
        } else {
            None
        }
    }

    pub fn state(&self) -> ThinkState {
        self.state
    }

    /// Visible text accumulated so far
    pub fn visible(&self) -> &str {
        &self.visible
    }

    pub fn into_visible(self) -> String {
        self.visible
    }

    /// Run a whole fragment sequence through a fresh filter
    pub fn collect<I, S>(fragments: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new();
        for fragment in fragments {
            filter.push(fragment.as_ref());
        }
        filter.into_visible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(fragments: &[&str]) -> Vec<String> {
        let mut filter = ThinkFilter::new();
        fragments
            .iter()
            .filter_map(|f| filter.push(f).map(str::to_string))
            .collect()
    }

    #[test]
    fn test_passthrough_without_markers() {
        let fragments = ["Hel", "lo", ", ", "wor", "ld"];
        assert_eq!(emitted(&fragments), fragments.to_vec());
        assert_eq!(ThinkFilter::collect(fragments), "Hello, world");
    }

    #[test]
    fn test_region_is_suppressed() {
        let fragments = ["A", "<think>", "pondering", "more", "</think>", "B", "C"];
        assert_eq!(emitted(&fragments), vec!["A", "B", "C"]);
        assert_eq!(ThinkFilter::collect(fragments), "ABC");
    }

    #[test]
    fn test_markers_inside_fragments() {
        let fragments = ["x", "ok <think>hmm", "still", "done</think> y", "z"];
        assert_eq!(emitted(&fragments), vec!["x", "z"]);
    }

    #[test]
    fn test_start_and_end_in_same_fragment_is_suppressed() {
        let fragments = ["a", "<think>quick</think>", "b"];
        assert_eq!(emitted(&fragments), vec!["a", "b"]);
        assert_eq!(ThinkFilter::collect(fragments), "ab");
    }

    #[test]
    fn test_unclosed_region_suppresses_rest() {
        let fragments = ["a", "<think>", "b", "c"];
        assert_eq!(ThinkFilter::collect(fragments), "a");
    }

    #[test]
    fn test_step_is_pure() {
        let start = ThinkState::default();
        let (next, emit) = step(start, "<think>");
        assert!(!emit);
        assert!(next.suppressing);
        assert!(!start.suppressing);

        let (after, emit) = step(next, "</think>");
        assert!(!emit);
        assert!(!after.suppressing);
    }

    #[test]
    fn test_empty_stream() {
        let filter = ThinkFilter::new();
        assert_eq!(filter.visible(), "");
        assert_eq!(filter.state(), ThinkState::default());
    }
}
