//! Version-keyed query alternatives.
//!
//! A metric is authored as a set of SQL variants, each applying to server (or
//! extension) versions at or above its key.  Variants live in a self-balancing
//! tree ordered by version; a scrape picks the variant with the greatest key
//! that does not exceed the server's actual version.

use crate::version::Version;

/// Semantic type of a result-set column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Contributes to the Prometheus label set only.
    Label,
    /// A gauge value column.
    Gauge,
    /// A counter value column.
    Counter,
    /// Pre-aggregated histogram data (bounds/buckets/sum/count).
    Histogram,
}

impl ColumnKind {
    /// The `#TYPE` keyword for this kind.  `Label` has no type line.
    pub fn type_keyword(self) -> &'static str {
        match self {
            ColumnKind::Label => "label",
            ColumnKind::Gauge => "gauge",
            ColumnKind::Counter => "counter",
            ColumnKind::Histogram => "histogram",
        }
    }
}

/// Per-column metadata of a query variant.
#[derive(Clone, Debug)]
pub struct Column {
    /// Column name; becomes the metric-name suffix or the label key.  May be
    /// empty, in which case the metric is named by the tag alone.
    pub name: String,
    /// Semantic type.
    pub kind: ColumnKind,
    /// Authored description, used for the `#HELP` line.
    pub description: String,
}

/// One SQL query together with its column schema.
#[derive(Clone, Debug)]
pub struct QueryVariant {
    /// The SQL text.
    pub query: String,
    /// Declared columns, in result order.
    pub columns: Vec<Column>,
}

impl QueryVariant {
    /// Creates a variant from its SQL text and column schema.
    pub fn new(query: String, columns: Vec<Column>) -> QueryVariant {
        QueryVariant { query, columns }
    }

    /// Whether the result carries pre-aggregated histogram columns.
    pub fn is_histogram(&self) -> bool {
        self.histogram_column().is_some()
    }

    /// Index of the column marked [`ColumnKind::Histogram`], if any.
    pub fn histogram_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.kind == ColumnKind::Histogram)
    }

    /// Declared column names, in result order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Self-balancing (AVL) tree of query variants keyed by version.
///
/// Duplicate-key inserts are a no-op: the first variant wins and the incoming
/// one is dropped.  [`VersionTree::lookup`] returns the variant with the
/// greatest key less than or equal to the target, or nothing when every key
/// exceeds the target — meaning the metric is unsupported on that server.
#[derive(Clone, Debug, Default)]
pub struct VersionTree {
    root: Option<Box<Node>>,
}

#[derive(Clone, Debug)]
struct Node {
    version: Version,
    variant: QueryVariant,
    height: i32,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl VersionTree {
    /// Creates an empty tree.
    pub fn new() -> VersionTree {
        VersionTree::default()
    }

    /// Whether the tree holds no variants.
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Inserts a variant keyed by `version`, rebalancing as needed.
    pub fn insert(&mut self, version: Version, variant: QueryVariant) {
        self.root = Some(insert(self.root.take(), version, variant));
    }

    /// Returns the variant with the greatest key `<= target`, if any.
    pub fn lookup(&self, target: Version) -> Option<&QueryVariant> {
        let mut best: Option<&Node> = None;
        let mut current = self.root.as_deref();

        while let Some(node) = current {
            if node.version <= target && best.map_or(true, |b| node.version > b.version) {
                best = Some(node);
            }
            current = if node.version > target {
                node.left.as_deref()
            } else {
                node.right.as_deref()
            };
        }

        best.map(|node| &node.variant)
    }
}

fn height(node: &Option<Box<Node>>) -> i32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn balance(node: &Node) -> i32 {
    height(&node.left) - height(&node.right)
}

fn update_height(node: &mut Node) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn rotate_right(mut a: Box<Node>) -> Box<Node> {
    match a.left.take() {
        None => a,
        Some(mut b) => {
            a.left = b.right.take();
            update_height(&mut a);
            b.right = Some(a);
            update_height(&mut b);
            b
        }
    }
}

fn rotate_left(mut a: Box<Node>) -> Box<Node> {
    match a.right.take() {
        None => a,
        Some(mut b) => {
            a.right = b.left.take();
            update_height(&mut a);
            b.left = Some(a);
            update_height(&mut b);
            b
        }
    }
}

fn insert(node: Option<Box<Node>>, version: Version, variant: QueryVariant) -> Box<Node> {
    let Some(mut node) = node else {
        return Box::new(Node { version, variant, height: 1, left: None, right: None });
    };

    if version == node.version {
        // Duplicate key: keep the existing variant, drop the incoming one.
        return node;
    } else if version < node.version {
        node.left = Some(insert(node.left.take(), version, variant));
    } else {
        node.right = Some(insert(node.right.take(), version, variant));
    }

    update_height(&mut node);
    rebalance(node)
}

fn rebalance(mut node: Box<Node>) -> Box<Node> {
    let factor = balance(&node);
    if factor > 1 {
        if node.left.as_deref().map_or(0, balance) < 0 {
            node.left = node.left.take().map(rotate_left);
        }
        rotate_right(node)
    } else if factor < -1 {
        if node.right.as_deref().map_or(0, balance) > 0 {
            node.right = node.right.take().map(rotate_right);
        }
        rotate_left(node)
    } else {
        node
    }
}
