use crate::fs::entry::Entry;

/// Decides which scanned entries reach the file list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFilter {
    show_hidden: bool,
}

impl FileFilter {
    pub fn new(show_hidden: bool) -> Self {
        Self { show_hidden }
    }

    pub fn show_hidden(&self) -> bool {
        self.show_hidden
    }

    pub fn set_show_hidden(&mut self, show_hidden: bool) {
        self.show_hidden = show_hidden;
    }

    pub fn is_visible(&self, entry: &Entry) -> bool {
        self.show_hidden || !entry.is_hidden()
    }

    /// Keep only the visible entries.
    pub fn apply(&self, entries: Vec<Entry>) -> Vec<Entry> {
        if self.show_hidden {
            return entries;
        }
        entries.into_iter().filter(|e| !e.is_hidden()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hides_dotfiles_by_default() {
        let filter = FileFilter::default();
        let kept = filter.apply(vec![
            Entry::file("local", "/d/.env"),
            Entry::file("local", "/d/a.txt"),
        ]);
        assert_eq!(kept, vec![Entry::file("local", "/d/a.txt")]);
    }

    #[test]
    fn show_hidden_keeps_everything() {
        let mut filter = FileFilter::default();
        filter.set_show_hidden(true);
        assert!(filter.is_visible(&Entry::file("local", "/d/.env")));
        assert_eq!(filter.apply(vec![Entry::file("local", "/d/.env")]).len(), 1);
    }
}
