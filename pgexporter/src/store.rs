//! Column store: grouping and ordering of rendered metric families.
//!
//! Fan-out entries arrive per (metric, server); the store re-assembles them
//! per metric family so that each family is emitted with exactly one
//! `#HELP`/`#TYPE` header followed by every server's value lines.  Buckets are
//! keyed by the `(tag, column-name, type)` triple and emitted in creation
//! order.

use indexmap::IndexMap;

use crate::alternatives::ColumnKind;
use crate::config::SortKind;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct BucketKey {
    tag: String,
    name: String,
    kind: ColumnKind,
}

/// One metric family being assembled: its header and ordered value lines.
#[derive(Debug)]
pub struct Bucket {
    sort: SortKind,
    header: String,
    lines: Vec<Line>,
}

#[derive(Debug)]
struct Line {
    /// First-column value of the originating tuple, for
    /// [`SortKind::ByFirstColumn`] placement.
    key: Option<String>,
    text: String,
}

impl Bucket {
    /// Inserts a rendered value line.
    ///
    /// `first_cell` is the originating tuple's first-column value.  Under
    /// [`SortKind::ByName`] lines append at the tail (the merge step already
    /// provides server-name order); under [`SortKind::ByFirstColumn`] a line
    /// lands right after the last line sharing its first-column value, or
    /// right after the header when no line shares it.
    pub fn push(&mut self, first_cell: &str, text: String) {
        match self.sort {
            SortKind::ByName => self.lines.push(Line { key: None, text }),
            SortKind::ByFirstColumn => {
                let at = self
                    .lines
                    .iter()
                    .rposition(|line| line.key.as_deref() == Some(first_cell))
                    .map_or(0, |index| index + 1);
                self.lines.insert(at, Line { key: Some(first_cell.to_string()), text });
            }
        }
    }
}

/// Insertion-ordered store of metric-family buckets.
#[derive(Debug, Default)]
pub struct ColumnStore {
    buckets: IndexMap<BucketKey, Bucket>,
}

impl ColumnStore {
    /// Creates an empty store.
    pub fn new() -> ColumnStore {
        ColumnStore::default()
    }

    /// Finds the bucket for `(tag, name, kind)`, creating it with `sort` and
    /// a header rendered by `header` on first sight.
    pub fn bucket(
        &mut self,
        tag: &str,
        name: &str,
        kind: ColumnKind,
        sort: SortKind,
        header: impl FnOnce() -> String,
    ) -> &mut Bucket {
        let key = BucketKey { tag: tag.to_string(), name: name.to_string(), kind };
        self.buckets
            .entry(key)
            .or_insert_with(|| Bucket { sort, header: header(), lines: Vec::new() })
    }

    /// Emits every bucket in creation order: header, value lines, blank line.
    pub fn emit(self, out: &mut String) {
        for bucket in self.buckets.into_values() {
            out.push_str(&bucket.header);
            for line in &bucket.lines {
                out.push_str(&line.text);
            }
            out.push('\n');
        }
    }
}
