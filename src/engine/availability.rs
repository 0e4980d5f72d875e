use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::{MAX_IN_CLAUSE_IDS, MAX_QUERY_WINDOW_MS};
use crate::model::*;

use super::store::Ledger;
use super::{Engine, EngineError};

// ── Interval algebra ────────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` may overlap itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}

/// Sweep line over several free lists: ranges where at least `min_available`
/// of them are free at once, no shorter than `min_duration`.
pub fn common_spans(free_lists: &[Vec<Span>], min_available: usize, min_duration: Option<Ms>) -> Vec<Span> {
    if min_available == 0 {
        return Vec::new();
    }
    let mut edges: Vec<(Ms, i32)> = Vec::new();
    for list in free_lists {
        for s in list {
            edges.push((s.start, 1));
            edges.push((s.end, -1));
        }
    }
    // Ends sort before starts at the same instant: touching spans don't overlap.
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let threshold = min_available as i32;
    let mut result = Vec::new();
    let mut count = 0;
    let mut seg_start: Option<Ms> = None;
    for (time, delta) in edges {
        let prev = count;
        count += delta;
        if prev < threshold && count >= threshold {
            seg_start = Some(time);
        } else if prev >= threshold
            && count < threshold
            && let Some(start) = seg_start.take()
            && time > start
        {
            let span = Span::new(start, time);
            if min_duration.is_none_or(|d| span.duration_ms() >= d) {
                result.push(span);
            }
        }
    }
    result
}

fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.start > window.end {
        return Err(EngineError::Validation("window ends before it starts".into()));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Busy time of `element_id` inside `window`, merged and clipped.
    ///
    /// Counts the element's own commitments and those of every group it
    /// belongs to on the window's start date. Rejected commitments, non-busy
    /// categories and zero-length events are ignored.
    fn busy_in(&self, ledger: &Ledger, element_id: Ulid, window: &Span) -> Result<Vec<Span>, EngineError> {
        ledger
            .element(&element_id)
            .ok_or(EngineError::NotFound(element_id))?;
        let date = date_of(window.start);
        let mut holders = vec![element_id];
        for group_id in self.resolver(ledger).groups_for(element_id, date, true)? {
            if let Some(state) = ledger.group(&group_id) {
                holders.push(state.group.element_id);
            }
        }

        let mut busy: Vec<Span> = holders
            .iter()
            .flat_map(|holder| ledger.commitments_of_element(holder))
            .filter(|c| c.status != CommitmentStatus::Rejected)
            .filter_map(|c| ledger.event(&c.event_id))
            .filter(|e| !e.span.is_instant() && ledger.event_is_busy(e) && e.span.overlaps(window))
            .map(|e| Span::new(e.span.start.max(window.start), e.span.end.min(window.end)))
            .collect();
        busy.sort_by_key(|s| s.start);
        Ok(merge_overlapping(&busy))
    }

    fn free_in(
        &self,
        ledger: &Ledger,
        element_id: Ulid,
        window: &Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        let busy = self.busy_in(ledger, element_id, window)?;
        Ok(subtract_intervals(&[*window], &busy)
            .into_iter()
            .filter(|s| min_duration.is_none_or(|d| s.duration_ms() >= d))
            .collect())
    }

    pub async fn busy_spans(&self, element_id: Ulid, window: Span) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let ledger = self.ledger.read().await;
        self.busy_in(&ledger, element_id, &window)
    }

    pub async fn free_spans(
        &self,
        element_id: Ulid,
        window: Span,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        let ledger = self.ledger.read().await;
        self.free_in(&ledger, element_id, &window, min_duration)
    }

    /// Non-group members of `group_id` with nothing busy inside `window`.
    pub async fn free_members(
        &self,
        group_id: Ulid,
        window: Span,
        recurse: bool,
    ) -> Result<BTreeSet<Ulid>, EngineError> {
        validate_window(&window)?;
        let ledger = self.ledger.read().await;
        let members = self
            .resolver(&ledger)
            .members(group_id, Some(date_of(window.start)), recurse, true)?;
        let mut free = BTreeSet::new();
        for element_id in members {
            if self.busy_in(&ledger, element_id, &window)?.is_empty() {
                free.insert(element_id);
            }
        }
        Ok(free)
    }

    /// Ranges inside `window` where at least `min_available` of `element_ids` are free.
    pub async fn common_free_spans(
        &self,
        element_ids: &[Ulid],
        window: Span,
        min_available: usize,
        min_duration: Option<Ms>,
    ) -> Result<Vec<Span>, EngineError> {
        validate_window(&window)?;
        if element_ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many element IDs"));
        }
        if element_ids.is_empty() || min_available == 0 {
            return Ok(Vec::new());
        }
        let ledger = self.ledger.read().await;
        let mut lists = Vec::with_capacity(element_ids.len());
        for &id in element_ids {
            lists.push(self.free_in(&ledger, id, &window, None)?);
        }
        Ok(common_spans(&lists, min_available, min_duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_spanning_several_bases() {
        let base = vec![Span::new(0, 100), Span::new(200, 300)];
        let remove = vec![Span::new(50, 250)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(0, 50), Span::new(250, 300)]
        );
    }

    #[test]
    fn merge_joins_adjacent_and_nested() {
        let spans = vec![Span::new(0, 10), Span::new(10, 20), Span::new(12, 15), Span::new(30, 40)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 20), Span::new(30, 40)]);
    }

    #[test]
    fn common_spans_threshold() {
        let a = vec![Span::new(9 * H, 12 * H)];
        let b = vec![Span::new(10 * H, 14 * H)];
        let c = vec![Span::new(11 * H, 13 * H)];
        let lists = vec![a, b, c];

        assert_eq!(common_spans(&lists, 3, None), vec![Span::new(11 * H, 12 * H)]);
        assert_eq!(common_spans(&lists, 2, None), vec![Span::new(10 * H, 13 * H)]);
        assert!(common_spans(&lists, 3, Some(2 * H)).is_empty());
        assert!(common_spans(&lists, 0, None).is_empty());
    }

    #[test]
    fn common_spans_touching_is_not_overlap() {
        let lists = vec![vec![Span::new(0, 10)], vec![Span::new(10, 20)]];
        assert!(common_spans(&lists, 2, None).is_empty());
    }
}
