use std::collections::BTreeSet;

use crate::model::contents::FileList;

/// Index-based selection over the visible file list.
#[derive(Debug, Clone, Default)]
pub struct SelectionModel {
    selected: BTreeSet<usize>,
    lead: Option<usize>,
    check_select_mode: bool,
    single: bool,
    change_depth: usize,
    /// State at the outermost `begin_change`.
    baseline: Option<(BTreeSet<usize>, Option<usize>, bool)>,
}

impl SelectionModel {
    pub fn new(single: bool) -> Self {
        Self {
            single,
            ..Self::default()
        }
    }

    pub fn is_single(&self) -> bool {
        self.single
    }

    pub fn selected_indexes(&self) -> Vec<usize> {
        self.selected.iter().copied().collect()
    }

    pub fn selected_index(&self) -> Option<usize> {
        self.selected.iter().next().copied()
    }

    pub fn is_selected(&self, index: usize) -> bool {
        self.selected.contains(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn lead_index(&self) -> Option<usize> {
        self.lead
    }

    pub fn set_lead_index(&mut self, lead: Option<usize>) {
        self.lead = lead;
    }

    pub fn check_select_mode(&self) -> bool {
        self.check_select_mode
    }

    pub fn set_check_select_mode(&mut self, enabled: bool) {
        self.check_select_mode = enabled;
    }

    pub fn set_index_selected(&mut self, index: usize, selected: bool) {
        if !selected {
            self.selected.remove(&index);
            return;
        }
        if self.single {
            self.selected.clear();
        }
        self.selected.insert(index);
    }

    /// Select exactly `index` and make it the lead.
    pub fn select_only(&mut self, index: usize) {
        self.selected.clear();
        self.selected.insert(index);
        self.lead = Some(index);
    }

    pub fn unselect_all(&mut self) {
        self.selected.clear();
    }

    /// Drop the selection and the lead.
    pub fn clear(&mut self) {
        self.unselect_all();
        self.set_lead_index(None);
    }

    /// Open a change bracket. Brackets nest.
    pub fn begin_change(&mut self) {
        if self.change_depth == 0 {
            self.baseline = Some(self.state());
        }
        self.change_depth += 1;
    }

    /// Close a change bracket. Returns whether the selection differs from
    /// the state at the outermost `begin_change` once that bracket closes.
    pub fn end_change(&mut self) -> bool {
        self.change_depth = self.change_depth.saturating_sub(1);
        if self.change_depth > 0 {
            return false;
        }
        match self.baseline.take() {
            Some(baseline) => baseline != self.state(),
            None => false,
        }
    }

    fn state(&self) -> (BTreeSet<usize>, Option<usize>, bool) {
        (self.selected.clone(), self.lead, self.check_select_mode)
    }
}

/// Selection captured by entry identity so it survives list swaps.
#[derive(Debug, Clone, Default)]
pub struct SelectionSnapshot {
    urls: Vec<String>,
    indexes: Vec<usize>,
    lead_index: Option<usize>,
    lead_url: Option<String>,
    check_select_mode: bool,
}

impl SelectionSnapshot {
    pub fn capture(selection: &SelectionModel, list: &FileList) -> Self {
        let indexes = selection.selected_indexes();
        let urls = indexes
            .iter()
            .filter_map(|&i| list.url_at(i).map(str::to_string))
            .collect();
        let lead_index = selection.lead_index();
        Self {
            urls,
            indexes,
            lead_index,
            lead_url: lead_index.and_then(|i| list.url_at(i)).map(str::to_string),
            check_select_mode: selection.check_select_mode(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    /// Re-apply the selection to `list` after a contents swap.
    ///
    /// When none of the previously selected entries survive, the entry
    /// following the removed run is selected instead, clamped to the end of
    /// the list. Returns `true` in that case so the caller publishes a change
    /// even if the selected index is numerically the same.
    pub fn restore(self, selection: &mut SelectionModel, list: &FileList) -> bool {
        let check_select_mode = self.check_select_mode;
        let old_indexes = self.indexes.clone();
        self.restore_identity(selection, list);

        if selection.is_empty() && !old_indexes.is_empty() {
            let max = old_indexes.iter().copied().max().unwrap_or(0);
            let target = (max + 2 - old_indexes.len()).min(list.len());
            if let Some(index) = target.checked_sub(1) {
                selection.select_only(index);
            }
            return true;
        }
        if check_select_mode {
            selection.set_check_select_mode(true);
        }
        false
    }

    /// Re-resolve selected entries and the lead by URL. No fallback.
    pub fn restore_identity(self, selection: &mut SelectionModel, list: &FileList) {
        selection.unselect_all();
        for url in &self.urls {
            if let Some(index) = list.index_of(url) {
                selection.set_index_selected(index, true);
            }
        }

        let lead = match &self.lead_url {
            Some(url) => list.index_of(url).or(self.lead_index),
            None => self.lead_index,
        };
        selection.set_lead_index(lead.filter(|&i| i < list.len()));
    }
}
