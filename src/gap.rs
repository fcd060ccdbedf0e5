//! Gap resolution: reduce a request window to the minimum upstream fetch plan
//!
//! Planning is pure: it sees the trading-day grid for the window, the set of
//! days already stored, the set of days under active negative coverage, and
//! where "today" falls. It emits maximal contiguous runs of days that need
//! upstream work, where contiguity is defined by the successor relation of
//! the trading-day grid (weekends and holidays never split a run).

use chrono::NaiveDate;
use std::collections::BTreeSet;

/// One upstream sub-window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Touches today while the market is open; subject to the refetch guard.
    pub hot: bool,
    /// Whether any day in the span is actually absent from the store. A hot
    /// span with nothing missing is refetched only to pick up intraday
    /// updates and may be skipped while the guard is fresh.
    pub has_missing: bool,
}

/// The minimal upstream plan for one request window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapPlan {
    pub spans: Vec<FetchSpan>,
    /// Days of the grid already present in the store.
    pub present_days: usize,
    /// Days of the grid that need fetching.
    pub missing_days: usize,
    /// Size of the trading-day grid.
    pub total_days: usize,
}

impl GapPlan {
    /// Spans that must reach upstream even when the hot guard is fresh.
    pub fn required_spans(&self) -> impl Iterator<Item = &FetchSpan> {
        self.spans.iter().filter(|s| s.has_missing)
    }
}

/// Compute the fetch plan for a window.
///
/// * `grid`: trading days of the requested window, ascending.
/// * `present`: days with a stored bar.
/// * `negative`: days under active negative coverage; treated as satisfied.
/// * `today`: today's date in the market, when the window may touch it.
/// * `market_open`: whether the market is currently in session.
pub fn plan(
    grid: &[NaiveDate],
    present: &BTreeSet<NaiveDate>,
    negative: &BTreeSet<NaiveDate>,
    today: Option<NaiveDate>,
    market_open: bool,
) -> GapPlan {
    let total = grid.len();
    if total == 0 {
        return GapPlan::default();
    }

    let satisfied = |d: &NaiveDate| present.contains(d) || negative.contains(d);
    let missing_days = grid.iter().filter(|d| !satisfied(d)).count();
    let present_days = grid.iter().filter(|d| present.contains(d)).count();

    // The window is hot when its last grid day is today and the session is
    // live; today's bar keeps changing until the close.
    let hot_active = market_open && today.is_some() && grid.last() == today.as_ref();

    // Maximal runs of missing days under the grid successor relation.
    let mut spans: Vec<FetchSpan> = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, d) in grid.iter().enumerate() {
        if !satisfied(d) {
            run_start.get_or_insert(i);
        } else if let Some(s) = run_start.take() {
            spans.push(FetchSpan {
                start: grid[s],
                end: grid[i - 1],
                hot: false,
                has_missing: true,
            });
        }
    }
    if let Some(s) = run_start {
        spans.push(FetchSpan {
            start: grid[s],
            end: grid[total - 1],
            hot: false,
            has_missing: true,
        });
    }

    if hot_active {
        let last_idx = total - 1;
        match spans.last_mut() {
            // The trailing missing run reaches today: it is the hot run. A
            // missing run that touches today was never merged with anything
            // else because runs are maximal within one state.
            Some(last) if last.end == grid[last_idx] => {
                last.hot = true;
                expand_hot(last, grid);
            }
            // Today is already present: synthesize a hot refetch span over
            // the trailing run of satisfied days.
            _ => {
                let mut s = last_idx;
                while s > 0 && satisfied(&grid[s - 1]) {
                    s -= 1;
                }
                let mut span = FetchSpan {
                    start: grid[s],
                    end: grid[last_idx],
                    hot: true,
                    has_missing: false,
                };
                expand_hot(&mut span, grid);
                spans.push(span);
            }
        }
    }

    GapPlan { spans, present_days, missing_days, total_days: total }
}

/// Widen a hot span by at most one trading day on each side of the grid,
/// absorbing off-by-one quirks of upstream intraday windows.
fn expand_hot(span: &mut FetchSpan, grid: &[NaiveDate]) {
    if let Some(pos) = grid.iter().position(|d| *d == span.start) {
        if pos > 0 {
            span.start = grid[pos - 1];
        }
    }
    if let Some(pos) = grid.iter().position(|d| *d == span.end) {
        if pos + 1 < grid.len() {
            span.end = grid[pos + 1];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        crate::types::parse_day(s).unwrap()
    }

    fn grid(days: &[&str]) -> Vec<NaiveDate> {
        days.iter().map(|s| d(s)).collect()
    }

    fn set(days: &[&str]) -> BTreeSet<NaiveDate> {
        days.iter().map(|s| d(s)).collect()
    }

    const JAN_GRID: &[&str] = &[
        "20240102", "20240103", "20240104", "20240105", "20240108", "20240109",
        "20240110", "20240111", "20240112",
    ];

    #[test]
    fn test_empty_grid_empty_plan() {
        let p = plan(&[], &BTreeSet::new(), &BTreeSet::new(), None, false);
        assert_eq!(p, GapPlan::default());
    }

    #[test]
    fn test_cold_window_single_span() {
        let g = grid(JAN_GRID);
        let p = plan(&g, &BTreeSet::new(), &BTreeSet::new(), None, false);
        assert_eq!(p.spans.len(), 1);
        assert_eq!(p.spans[0].start, d("20240102"));
        assert_eq!(p.spans[0].end, d("20240112"));
        assert!(p.spans[0].has_missing);
        assert!(!p.spans[0].hot);
        assert_eq!(p.missing_days, 9);
        assert_eq!(p.present_days, 0);
    }

    #[test]
    fn test_fully_present_empty_plan() {
        let g = grid(JAN_GRID);
        let present: BTreeSet<_> = g.iter().copied().collect();
        let p = plan(&g, &present, &BTreeSet::new(), None, false);
        assert!(p.spans.is_empty());
        assert_eq!(p.present_days, 9);
        assert_eq!(p.missing_days, 0);
    }

    #[test]
    fn test_weekend_does_not_split_runs() {
        // Missing Friday Jan 5 and Monday Jan 8: one run despite the weekend.
        let g = grid(JAN_GRID);
        let present = set(&["20240102", "20240103", "20240104", "20240109",
            "20240110", "20240111", "20240112"]);
        let p = plan(&g, &present, &BTreeSet::new(), None, false);
        assert_eq!(p.spans.len(), 1);
        assert_eq!(p.spans[0].start, d("20240105"));
        assert_eq!(p.spans[0].end, d("20240108"));
    }

    #[test]
    fn test_two_disjoint_runs() {
        let g = grid(JAN_GRID);
        let present = set(&["20240104", "20240105", "20240108", "20240111", "20240112"]);
        let p = plan(&g, &present, &BTreeSet::new(), None, false);
        assert_eq!(p.spans.len(), 2);
        assert_eq!((p.spans[0].start, p.spans[0].end), (d("20240102"), d("20240103")));
        assert_eq!((p.spans[1].start, p.spans[1].end), (d("20240109"), d("20240110")));
    }

    #[test]
    fn test_negative_days_are_satisfied() {
        let g = grid(JAN_GRID);
        let present = set(&["20240102", "20240103", "20240104", "20240105",
            "20240109", "20240110", "20240111", "20240112"]);
        let negative = set(&["20240108"]);
        let p = plan(&g, &present, &negative, None, false);
        assert!(p.spans.is_empty());
        // Negative days are satisfied but not counted as cache hits.
        assert_eq!(p.present_days, 8);
    }

    #[test]
    fn test_hot_missing_run_marked_and_expanded() {
        // Grid ends at today; today and yesterday missing.
        let g = grid(JAN_GRID);
        let present = set(&["20240102", "20240103", "20240104", "20240105",
            "20240108", "20240109", "20240110"]);
        let p = plan(&g, &present, &BTreeSet::new(), Some(d("20240112")), true);
        assert_eq!(p.spans.len(), 1);
        let span = p.spans[0];
        assert!(span.hot);
        assert!(span.has_missing);
        // Run was [11th, 12th]; expansion pulls in one trading day of slack.
        assert_eq!(span.start, d("20240110"));
        assert_eq!(span.end, d("20240112"));
    }

    #[test]
    fn test_hot_span_synthesized_when_today_present() {
        let g = grid(JAN_GRID);
        let present: BTreeSet<_> = g.iter().copied().collect();
        let p = plan(&g, &present, &BTreeSet::new(), Some(d("20240112")), true);
        assert_eq!(p.spans.len(), 1);
        let span = p.spans[0];
        assert!(span.hot);
        assert!(!span.has_missing);
        assert_eq!(span.end, d("20240112"));
        assert_eq!(p.missing_days, 0);
    }

    #[test]
    fn test_hot_run_not_merged_with_interior_run() {
        // Interior gap plus a missing today: two spans, only the last hot.
        let g = grid(JAN_GRID);
        let present = set(&["20240102", "20240103", "20240105", "20240108",
            "20240109", "20240110", "20240111"]);
        let p = plan(&g, &present, &BTreeSet::new(), Some(d("20240112")), true);
        assert_eq!(p.spans.len(), 2);
        assert!(!p.spans[0].hot);
        assert_eq!((p.spans[0].start, p.spans[0].end), (d("20240104"), d("20240104")));
        assert!(p.spans[1].hot);
        // Hot run [12th] expanded one day left.
        assert_eq!((p.spans[1].start, p.spans[1].end), (d("20240111"), d("20240112")));
    }

    #[test]
    fn test_market_closed_no_hot_span() {
        let g = grid(JAN_GRID);
        let present: BTreeSet<_> = g.iter().copied().collect();
        let p = plan(&g, &present, &BTreeSet::new(), Some(d("20240112")), false);
        assert!(p.spans.is_empty());
    }

    #[test]
    fn test_window_before_today_never_hot() {
        let g = grid(JAN_GRID);
        let p = plan(&g, &BTreeSet::new(), &BTreeSet::new(), Some(d("20240301")), true);
        assert_eq!(p.spans.len(), 1);
        assert!(!p.spans[0].hot);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Arbitrary grid of up to 60 trading days with an arbitrary subset
        /// present.
        fn grid_and_present() -> impl Strategy<Value = (Vec<NaiveDate>, BTreeSet<NaiveDate>)> {
            (1usize..60, proptest::collection::vec(any::<bool>(), 60)).prop_map(
                |(len, mask)| {
                    let base = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
                    let mut grid = Vec::new();
                    let mut day = base;
                    while grid.len() < len {
                        // Grids skip weekends like a real calendar would.
                        if chrono::Datelike::weekday(&day).number_from_monday() <= 5 {
                            grid.push(day);
                        }
                        day += chrono::Duration::days(1);
                    }
                    let present = grid
                        .iter()
                        .zip(mask)
                        .filter(|(_, keep)| *keep)
                        .map(|(d, _)| *d)
                        .collect();
                    (grid, present)
                },
            )
        }

        proptest! {
            /// Spans cover exactly the missing portion of the grid, in order,
            /// without overlap.
            #[test]
            fn spans_cover_exactly_the_missing_set(
                (grid, present) in grid_and_present()
            ) {
                let p = plan(&grid, &present, &BTreeSet::new(), None, false);

                let mut covered = BTreeSet::new();
                let mut prev_end: Option<NaiveDate> = None;
                for span in &p.spans {
                    prop_assert!(span.start <= span.end);
                    if let Some(pe) = prev_end {
                        prop_assert!(span.start > pe);
                    }
                    prev_end = Some(span.end);
                    for d in grid.iter().filter(|d| **d >= span.start && **d <= span.end) {
                        covered.insert(*d);
                    }
                }

                let missing: BTreeSet<_> =
                    grid.iter().filter(|d| !present.contains(*d)).copied().collect();
                prop_assert_eq!(covered, missing);
                prop_assert_eq!(p.missing_days, p.total_days - p.present_days);
            }
        }
    }
}
