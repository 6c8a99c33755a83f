//! Outline editing engine for Org-style structured text.
//! The library stays pure: it reads a parsed node tree and produces line edits,
//! leaving buffer ownership, prompts and folding to the host editor.

pub mod core {
    use crate::states::{PriorityRange, TodoKeywords};
    use crate::timestamp::Timestamp;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::{collections::BTreeMap, path::PathBuf};
    use uuid::Uuid;

    /* ------------------------------- IDs ------------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct DocumentId(pub Uuid);

    impl DocumentId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    /// Stable handle into the document arena. Only valid for the document version it came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub usize);

    /* ---------------------------- Positions ---------------------------- */

    /// Zero-based line and character column.
    #[derive(
        Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    )]
    pub struct Position {
        pub line: usize,
        pub col: usize,
    }

    impl Position {
        pub fn new(line: usize, col: usize) -> Self {
            Self { line, col }
        }
    }

    /// Half-open character range `start..end`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TextRange {
        pub start: Position,
        pub end: Position,
    }

    impl TextRange {
        /// Whole lines `start_line..end_line`.
        pub fn lines(start_line: usize, end_line: usize) -> Self {
            Self {
                start: Position::new(start_line, 0),
                end: Position::new(end_line, 0),
            }
        }

        pub fn on_line(line: usize, start_col: usize, end_col: usize) -> Self {
            Self {
                start: Position::new(line, start_col),
                end: Position::new(line, end_col),
            }
        }

        pub fn contains(&self, pos: Position) -> bool {
            self.start <= pos && pos < self.end
        }

        pub fn contains_range(&self, other: &TextRange) -> bool {
            self.start <= other.start && other.end <= self.end
        }

        pub fn start_line(&self) -> usize {
            self.start.line
        }

        /// First line after the range when it ends at column 0, else the last line + 1.
        pub fn end_line(&self) -> usize {
            if self.end.col == 0 {
                self.end.line
            } else {
                self.end.line + 1
            }
        }
    }

    /// Replace lines `start_line..end_line` with `lines`. Insertions have `start_line == end_line`.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TextEdit {
        pub start_line: usize,
        pub end_line: usize,
        pub lines: Vec<String>,
    }

    impl TextEdit {
        pub fn replace(start_line: usize, end_line: usize, lines: Vec<String>) -> Self {
            Self {
                start_line,
                end_line,
                lines,
            }
        }

        pub fn replace_line(line: usize, text: String) -> Self {
            Self::replace(line, line + 1, vec![text])
        }

        pub fn insert(at: usize, lines: Vec<String>) -> Self {
            Self::replace(at, at, lines)
        }

        pub fn delete(start_line: usize, end_line: usize) -> Self {
            Self::replace(start_line, end_line, vec![])
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Settings read from `#+KEY:` lines before the first heading.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FileSettings {
        /// `#+TODO:` style sequences; empty means "use the editor configuration".
        #[serde(default)]
        pub todo_sequences: Vec<Vec<String>>,
        /// `#+PRIORITIES: A C` override.
        pub priorities: Option<PriorityRange>,
        #[serde(default)]
        pub meta: IndexMap<String, String>,
    }

    /// Aggregate root: one parsed outline document, nodes owned by index.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Document {
        pub id: DocumentId,
        pub path: Option<PathBuf>,
        /// Buffer version this tree was parsed from.
        pub version: u64,
        pub settings: FileSettings,
        /// Effective keyword vocabulary (file settings over configuration).
        pub keywords: TodoKeywords,
        pub priorities: PriorityRange,
        pub nodes: Vec<Node>,
        /// Source lines captured while parsing; edits are computed against these.
        pub lines: Vec<String>,
        /// Pending in-line substitutions for lines no other node re-renders.
        #[serde(skip)]
        pub(crate) line_rewrites: BTreeMap<usize, Vec<(usize, usize, String)>>,
    }

    impl Document {
        pub const ROOT: NodeId = NodeId(0);

        pub fn new(path: Option<PathBuf>, lines: Vec<String>, version: u64) -> Self {
            let root = Node {
                id: Self::ROOT,
                range: TextRange::lines(0, lines.len()),
                parent: None,
                children: vec![],
                data: NodeData::Document,
            };
            Self {
                id: DocumentId::new(),
                path,
                version,
                settings: FileSettings::default(),
                keywords: TodoKeywords::default(),
                priorities: PriorityRange::default(),
                nodes: vec![root],
                lines,
                line_rewrites: BTreeMap::new(),
            }
        }

        pub fn node(&self, id: NodeId) -> Option<&Node> {
            self.nodes.get(id.0)
        }

        pub fn get(&self, id: NodeId) -> Result<&Node, DomainError> {
            self.nodes.get(id.0).ok_or(DomainError::UnknownNode(id))
        }

        pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node, DomainError> {
            self.nodes.get_mut(id.0).ok_or(DomainError::UnknownNode(id))
        }

        pub fn heading(&self, id: NodeId) -> Result<&Heading, DomainError> {
            match &self.get(id)?.data {
                NodeData::Heading(h) => Ok(h),
                _ => Err(DomainError::NotAHeading(id)),
            }
        }

        pub fn heading_mut(&mut self, id: NodeId) -> Result<&mut Heading, DomainError> {
            match &mut self.get_mut(id)?.data {
                NodeData::Heading(h) => Ok(h),
                _ => Err(DomainError::NotAHeading(id)),
            }
        }

        pub fn list_item(&self, id: NodeId) -> Result<&ListItem, DomainError> {
            match &self.get(id)?.data {
                NodeData::ListItem(item) => Ok(item),
                _ => Err(DomainError::NotAListItem(id)),
            }
        }

        pub fn list_item_mut(&mut self, id: NodeId) -> Result<&mut ListItem, DomainError> {
            match &mut self.get_mut(id)?.data {
                NodeData::ListItem(item) => Ok(item),
                _ => Err(DomainError::NotAListItem(id)),
            }
        }

        pub fn timestamp(&self, id: NodeId) -> Result<&Timestamp, DomainError> {
            match &self.get(id)?.data {
                NodeData::Timestamp(ts) => Ok(ts),
                _ => Err(DomainError::NotATimestamp(id)),
            }
        }

        pub fn line(&self, idx: usize) -> &str {
            self.lines.get(idx).map(String::as_str).unwrap_or("")
        }

        /// All heading ids in document order.
        pub fn headings(&self) -> impl Iterator<Item = NodeId> + '_ {
            self.nodes
                .iter()
                .filter(|n| n.kind() == NodeKind::Heading)
                .map(|n| n.id)
        }

        /// Children of `id` that are headings.
        pub fn child_headings(&self, id: NodeId) -> Vec<NodeId> {
            self.children_of_kind(id, NodeKind::Heading)
        }

        pub fn children_of_kind(&self, id: NodeId, kind: NodeKind) -> Vec<NodeId> {
            self.node(id)
                .map(|n| {
                    n.children
                        .iter()
                        .copied()
                        .filter(|c| self.node(*c).map(|x| x.kind()) == Some(kind))
                        .collect()
                })
                .unwrap_or_default()
        }

        /// Nearest heading that owns `id` (itself when `id` is a heading).
        pub fn owning_heading(&self, id: NodeId) -> Option<NodeId> {
            let mut cur = Some(id);
            while let Some(c) = cur {
                let node = self.node(c)?;
                if node.kind() == NodeKind::Heading {
                    return Some(c);
                }
                cur = node.parent;
            }
            None
        }

        /// Titles of the ancestor headings, outermost first.
        pub fn outline_path(&self, id: NodeId) -> Vec<String> {
            let mut out = Vec::new();
            let mut cur = self.node(id).and_then(|n| n.parent);
            while let Some(c) = cur {
                let Some(node) = self.node(c) else { break };
                if let NodeData::Heading(h) = &node.data {
                    out.push(h.title.trim().to_string());
                }
                cur = node.parent;
            }
            out.reverse();
            out
        }

        /// Every descendant of `id`, depth first, excluding `id`.
        pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
            let mut out = Vec::new();
            let mut stack: Vec<NodeId> = self
                .node(id)
                .map(|n| n.children.iter().rev().copied().collect())
                .unwrap_or_default();
            while let Some(c) = stack.pop() {
                out.push(c);
                if let Some(node) = self.node(c) {
                    stack.extend(node.children.iter().rev().copied());
                }
            }
            out
        }

        pub(crate) fn push_node(&mut self, parent: NodeId, range: TextRange, data: NodeData) -> NodeId {
            let id = NodeId(self.nodes.len());
            self.nodes.push(Node {
                id,
                range,
                parent: Some(parent),
                children: vec![],
                data,
            });
            if let Some(p) = self.nodes.get_mut(parent.0) {
                p.children.push(id);
            }
            id
        }
    }

    /* ------------------------------ Nodes ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum NodeKind {
        Document,
        Heading,
        ListItem,
        Timestamp,
        Link,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Node {
        pub id: NodeId,
        pub range: TextRange,
        pub parent: Option<NodeId>,
        pub children: Vec<NodeId>,
        pub data: NodeData,
    }

    impl Node {
        pub fn kind(&self) -> NodeKind {
            match self.data {
                NodeData::Document => NodeKind::Document,
                NodeData::Heading(_) => NodeKind::Heading,
                NodeData::ListItem(_) => NodeKind::ListItem,
                NodeData::Timestamp(_) => NodeKind::Timestamp,
                NodeData::Link(_) => NodeKind::Link,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum NodeData {
        Document,
        Heading(Box<Heading>),
        ListItem(ListItem),
        Timestamp(Timestamp),
        Link(LinkNode),
    }

    /* ------------------------------ Entities ------------------------------ */

    /// One heading; its subtree is the node range, children hang off the arena node.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Heading {
        pub level: u8,
        pub todo: Option<TodoKeyword>,
        pub priority: Option<Priority>,
        /// Raw title text, markup untouched.
        pub title: String,
        /// Tags after the title (`:a:b:`), in written order.
        #[serde(default)]
        pub tags: Vec<String>,
        #[serde(default)]
        pub planning: Planning,
        #[serde(default)]
        pub properties: PropertyDrawer,
        #[serde(default)]
        pub logbook: Logbook,
        /// Drawers found directly under the headline, by line span.
        #[serde(default)]
        pub drawers: Vec<DrawerSpan>,

        /// Headline line index.
        pub line: usize,
        /// Column where the title starts on the headline.
        pub title_col: usize,
        pub planning_line: Option<usize>,
        /// Leading whitespace of the planning line, kept when it is re-rendered.
        #[serde(default)]
        pub planning_indent: String,

        #[serde(skip)]
        pub(crate) dirty: Dirty,
        /// Lines waiting to be written into a log drawer or at the append line.
        #[serde(skip)]
        pub(crate) pending_log: Vec<String>,
        #[serde(skip)]
        pub(crate) pending_log_drawer: Option<String>,
    }

    /// Regions of a heading that must be re-rendered from the model.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub(crate) struct Dirty {
        pub level: bool,
        pub headline: bool,
        pub planning: bool,
        pub properties: bool,
    }

    impl Heading {
        pub fn new(level: u8, title: impl Into<String>, line: usize) -> Self {
            Self {
                level,
                todo: None,
                priority: None,
                title: title.into(),
                tags: vec![],
                planning: Planning::default(),
                properties: PropertyDrawer::default(),
                logbook: Logbook::default(),
                drawers: vec![],
                line,
                title_col: level as usize + 1,
                planning_line: None,
                planning_indent: String::new(),
                dirty: Dirty::default(),
                pending_log: vec![],
                pending_log_drawer: None,
            }
        }

        pub fn is_done(&self) -> bool {
            self.todo.as_ref().is_some_and(|t| t.is_done)
        }

        pub fn drawer(&self, name: &str) -> Option<&DrawerSpan> {
            self.drawers
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(name))
        }

        pub fn property(&self, key: &str) -> Option<&str> {
            self.properties
                .props
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        }

        pub fn mark_level_dirty(&mut self) {
            self.dirty.level = true;
        }

        pub fn mark_headline_dirty(&mut self) {
            self.dirty.headline = true;
        }

        pub fn mark_planning_dirty(&mut self) {
            self.dirty.planning = true;
        }

        pub fn mark_properties_dirty(&mut self) {
            self.dirty.properties = true;
        }

        pub fn is_dirty(&self) -> bool {
            self.dirty != Dirty::default() || !self.pending_log.is_empty()
        }
    }

    /// Single-character priority, e.g. `[#A]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Priority(pub char);

    /// Keyword text plus the partition it belongs to.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TodoKeyword {
        pub text: String,
        pub is_done: bool,
    }

    /// Planning line: SCHEDULED, DEADLINE, CLOSED.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Planning {
        pub scheduled: Option<Timestamp>,
        pub deadline: Option<Timestamp>,
        pub closed: Option<Timestamp>,
    }

    impl Planning {
        pub fn is_empty(&self) -> bool {
            self.scheduled.is_none() && self.deadline.is_none() && self.closed.is_none()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PropertyDrawer {
        #[serde(default)]
        pub props: IndexMap<String, String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DrawerSpan {
        pub name: String,
        /// Line of `:NAME:`.
        pub start_line: usize,
        /// Line after `:END:`.
        pub end_line: usize,
    }

    /// CLOCK entries plus every other logbook line kept raw.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Logbook {
        #[serde(default)]
        pub clock: Vec<ClockEntry>,
        #[serde(default)]
        pub raw: Vec<String>,
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        pub start: Timestamp,
        pub end: Option<Timestamp>,
        /// Duration written after `=>`, in minutes.
        pub minutes: Option<i64>,
    }

    impl ClockEntry {
        /// Written duration, or the span between start and end when it is missing.
        pub fn duration_minutes(&self) -> Option<i64> {
            if self.minutes.is_some() {
                return self.minutes;
            }
            let end = self.end.as_ref()?;
            Some((end.point() - self.start.point()).num_minutes())
        }
    }

    /// A list item; nested items are arena children.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListItem {
        /// Leading whitespace before the bullet.
        pub indent: String,
        pub bullet: Bullet,
        pub checkbox: Option<Checkbox>,
        /// Text after the bullet (and checkbox) on the bullet line.
        pub text: String,
        pub line: usize,
        /// Column where `text` starts.
        pub content_col: usize,
        #[serde(skip)]
        pub(crate) dirty: bool,
    }

    impl ListItem {
        pub fn render(&self) -> String {
            let mut buf = String::new();
            buf.push_str(&self.indent);
            buf.push_str(&self.bullet.marker());
            buf.push(' ');
            if let Some(cb) = self.checkbox {
                buf.push_str(cb.marker());
                buf.push(' ');
            }
            buf.push_str(&self.text);
            buf
        }

        pub fn mark_dirty(&mut self) {
            self.dirty = true;
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Bullet {
        Unordered(char),
        Ordered { number: u32, delimiter: char },
    }

    impl Bullet {
        pub fn marker(&self) -> String {
            match self {
                Bullet::Unordered(c) => c.to_string(),
                Bullet::Ordered { number, delimiter } => format!("{number}{delimiter}"),
            }
        }

        /// Same marker family: identical bullet char, or ordered with the same delimiter.
        pub fn same_family(&self, other: &Bullet) -> bool {
            match (self, other) {
                (Bullet::Unordered(a), Bullet::Unordered(b)) => a == b,
                (
                    Bullet::Ordered { delimiter: a, .. },
                    Bullet::Ordered { delimiter: b, .. },
                ) => a == b,
                _ => false,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Checkbox {
        Empty,   // [ ]
        Partial, // [-]
        Checked, // [X]
    }

    impl Checkbox {
        pub fn marker(&self) -> &'static str {
            match self {
                Checkbox::Empty => "[ ]",
                Checkbox::Partial => "[-]",
                Checkbox::Checked => "[X]",
            }
        }
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LinkNode {
        pub target: String,
        pub description: Option<String>,
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("heading level {0} is out of bounds")]
        InvalidLevel(u8),
        #[error("invalid timestamp")]
        InvalidTimestamp,
        #[error("unknown node {0:?}")]
        UnknownNode(NodeId),
        #[error("node {0:?} is not a heading")]
        NotAHeading(NodeId),
        #[error("node {0:?} is not a list item")]
        NotAListItem(NodeId),
        #[error("node {0:?} is not a timestamp")]
        NotATimestamp(NodeId),
    }

    /* ----------------------------- Text helpers ----------------------------- */

    /// Byte offset of character column `col` (clamped to the end).
    pub(crate) fn byte_at(s: &str, col: usize) -> usize {
        s.char_indices().nth(col).map(|(b, _)| b).unwrap_or(s.len())
    }

    pub(crate) fn char_len(s: &str) -> usize {
        s.chars().count()
    }

    /// Replace character columns `start..end` of `s` with `with`.
    pub(crate) fn splice_chars(s: &str, start: usize, end: usize, with: &str) -> String {
        let b0 = byte_at(s, start);
        let b1 = byte_at(s, end.max(start));
        let mut out = String::with_capacity(s.len() + with.len());
        out.push_str(&s[..b0]);
        out.push_str(with);
        out.push_str(&s[b1..]);
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn text_range_is_half_open() {
            let r = TextRange::on_line(3, 4, 10);
            assert!(r.contains(Position::new(3, 4)));
            assert!(r.contains(Position::new(3, 9)));
            assert!(!r.contains(Position::new(3, 10)));
            assert!(!r.contains(Position::new(2, 5)));
        }

        #[test]
        fn line_ranges_cover_whole_lines() {
            let r = TextRange::lines(2, 5);
            assert!(r.contains(Position::new(4, 200)));
            assert!(!r.contains(Position::new(5, 0)));
            assert_eq!(r.end_line(), 5);
            assert!(r.contains_range(&TextRange::on_line(3, 1, 6)));
        }

        #[test]
        fn splice_counts_characters_not_bytes() {
            assert_eq!(splice_chars("héllo wörld", 6, 11, "there"), "héllo there");
            assert_eq!(splice_chars("abc", 3, 3, "d"), "abcd");
        }

        #[test]
        fn list_item_renders_marker_checkbox_and_text() {
            let item = ListItem {
                indent: "  ".into(),
                bullet: Bullet::Ordered {
                    number: 3,
                    delimiter: ')',
                },
                checkbox: Some(Checkbox::Empty),
                text: "call Bob".into(),
                line: 0,
                content_col: 9,
                dirty: false,
            };
            assert_eq!(item.render(), "  3) [ ] call Bob");
        }
    }
}

pub mod config {
    use crate::core::FileSettings;
    use crate::states::{PriorityRange, TodoKeywords};
    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::path::Path;

    /// How much bookkeeping a state change writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum LogPolicy {
        Off,
        #[default]
        Time,
        Note,
    }

    impl LogPolicy {
        pub fn is_on(&self) -> bool {
            !matches!(self, LogPolicy::Off)
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct BlankBeforeNewEntry {
        /// Blank line before a new heading when the current subtree is itself preceded by one.
        pub heading: bool,
        pub plain_list_item: bool,
    }

    impl Default for BlankBeforeNewEntry {
        fn default() -> Self {
            Self {
                heading: true,
                plain_list_item: false,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct EditorConfig {
        pub todo_keywords: Vec<Vec<String>>,
        pub priorities: PriorityRange,
        pub log_done: LogPolicy,
        pub log_into_drawer: Option<String>,
        pub log_repeat: LogPolicy,
        pub time_stamp_rounding_minutes: u32,
        pub blank_before_new_entry: BlankBeforeNewEntry,
        pub archive_location: String,
    }

    impl Default for EditorConfig {
        fn default() -> Self {
            Self {
                todo_keywords: vec![vec!["TODO".into(), "|".into(), "DONE".into()]],
                priorities: PriorityRange::default(),
                log_done: LogPolicy::Time,
                log_into_drawer: None,
                log_repeat: LogPolicy::Time,
                time_stamp_rounding_minutes: 5,
                blank_before_new_entry: BlankBeforeNewEntry::default(),
                archive_location: "%s_archive::".into(),
            }
        }
    }

    impl EditorConfig {
        pub fn from_json_str(s: &str) -> Result<Self> {
            serde_json::from_str(s).context("invalid editor configuration")
        }

        pub fn load(path: &Path) -> Result<Self> {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            Self::from_json_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        }

        /// Keyword vocabulary for a document: `#+TODO:` lines win over configuration.
        pub fn todo_keywords_for(&self, settings: &FileSettings) -> TodoKeywords {
            if settings.todo_sequences.is_empty() {
                TodoKeywords::from_sequences(&self.todo_keywords)
            } else {
                TodoKeywords::from_sequences(&settings.todo_sequences)
            }
        }

        pub fn priorities_for(&self, settings: &FileSettings) -> PriorityRange {
            settings.priorities.unwrap_or(self.priorities)
        }

        /// Drawer that holds clock lines and state-change notes when parsing.
        pub fn log_drawer_name(&self) -> &str {
            self.log_into_drawer.as_deref().unwrap_or("LOGBOOK")
        }

        /// Minute step for time-of-day adjustment, never zero.
        pub fn rounding(&self) -> u32 {
            self.time_stamp_rounding_minutes.max(1)
        }

        /// Archive target for a document path: `%s` expands to the path, `::heading` suffix dropped.
        pub fn archive_target(&self, path: Option<&Path>) -> String {
            let file = path.map(|p| p.display().to_string()).unwrap_or_default();
            let expanded = self.archive_location.replace("%s", &file);
            match expanded.split_once("::") {
                Some((target, _)) => target.to_string(),
                None => expanded,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn partial_json_keeps_defaults() {
            let cfg = EditorConfig::from_json_str(r#"{"log_done":"note","log_into_drawer":"LOGBOOK"}"#)
                .unwrap();
            assert_eq!(cfg.log_done, LogPolicy::Note);
            assert_eq!(cfg.log_into_drawer.as_deref(), Some("LOGBOOK"));
            assert_eq!(cfg.time_stamp_rounding_minutes, 5);
            assert_eq!(cfg.priorities, PriorityRange::default());
            assert!(cfg.blank_before_new_entry.heading);
        }

        #[test]
        fn file_settings_override_keywords_and_priorities() {
            let cfg = EditorConfig::default();
            let settings = FileSettings {
                todo_sequences: vec![vec!["NEXT".into(), "WAIT".into(), "|".into(), "DONE".into()]],
                priorities: Some(PriorityRange {
                    highest: 'A',
                    lowest: 'C',
                }),
                ..FileSettings::default()
            };
            let kws = cfg.todo_keywords_for(&settings);
            assert!(kws.find("NEXT").is_some());
            assert!(kws.find("TODO").is_none());
            assert_eq!(cfg.priorities_for(&settings).lowest, 'C');
        }

        #[test]
        fn archive_target_expands_path() {
            let cfg = EditorConfig::default();
            assert_eq!(
                cfg.archive_target(Some(Path::new("/notes/work.org"))),
                "/notes/work.org_archive"
            );
            assert_eq!(cfg.archive_target(None), "_archive");
        }
    }
}

pub mod timestamp {
    //! Timestamp tokens: `<2026-10-18 Sun 10:00-11:00 +1w -2d>`, `[2026-10-18 Sun]`,
    //! and date ranges `<a>--<b>`. Parsing records where every sub-field sits so
    //! the cursor can address a single field.

    use crate::core::{TextRange, char_len};
    use chrono::{Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{map_res, opt},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum TimestampError {
        #[error("malformed timestamp `{0}`")]
        Malformed(String),
    }

    /* ------------------------------ Model ------------------------------ */

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        /// End of a same-day time range (`10:00-11:00`).
        pub time_end: Option<NaiveTime>,
        pub repeater: Option<Repeater>,
        pub delay: Option<Delay>,
        /// Second half of a date range (`<a>--<b>`), also used by CLOCK lines.
        pub related_date_range: Option<Box<Timestamp>>,
        #[serde(default)]
        pub is_logbook: bool,
        #[serde(default)]
        pub range: TextRange,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub amount: u32,
        pub unit: TimeUnit,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RepeaterKind {
        /// `+`: shift by one interval from the stored date.
        Cumulative,
        /// `++`: shift by whole intervals until the date is no longer in the past.
        CatchUp,
        /// `.+`: shift by one interval from today.
        Restart,
    }

    impl RepeaterKind {
        pub fn mark(&self) -> &'static str {
            match self {
                RepeaterKind::Cumulative => "+",
                RepeaterKind::CatchUp => "++",
                RepeaterKind::Restart => ".+",
            }
        }
    }

    /// Warning period before a deadline; `--` applies to the first occurrence only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Delay {
        pub first_only: bool,
        pub amount: u32,
        pub unit: TimeUnit,
    }

    /// Units that may appear in repeater and delay cookies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TimeUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl TimeUnit {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'h' => Some(TimeUnit::Hour),
                'd' => Some(TimeUnit::Day),
                'w' => Some(TimeUnit::Week),
                'm' => Some(TimeUnit::Month),
                'y' => Some(TimeUnit::Year),
                _ => None,
            }
        }

        pub fn as_char(&self) -> char {
            match self {
                TimeUnit::Hour => 'h',
                TimeUnit::Day => 'd',
                TimeUnit::Week => 'w',
                TimeUnit::Month => 'm',
                TimeUnit::Year => 'y',
            }
        }

        /// hour → day → week → month → year → hour.
        pub fn cycle(&self, forward: bool) -> Self {
            const ORDER: [TimeUnit; 5] = [
                TimeUnit::Hour,
                TimeUnit::Day,
                TimeUnit::Week,
                TimeUnit::Month,
                TimeUnit::Year,
            ];
            let idx = ORDER.iter().position(|u| u == self).unwrap_or(0);
            let next = if forward {
                (idx + 1) % ORDER.len()
            } else {
                (idx + ORDER.len() - 1) % ORDER.len()
            };
            ORDER[next]
        }
    }

    impl From<TimeUnit> for DeltaUnit {
        fn from(u: TimeUnit) -> Self {
            match u {
                TimeUnit::Hour => DeltaUnit::Hour,
                TimeUnit::Day => DeltaUnit::Day,
                TimeUnit::Week => DeltaUnit::Week,
                TimeUnit::Month => DeltaUnit::Month,
                TimeUnit::Year => DeltaUnit::Year,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DeltaUnit {
        Minute,
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    /// Signed field-wise adjustment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Delta {
        pub amount: i64,
        pub unit: DeltaUnit,
    }

    impl Delta {
        pub fn new(amount: i64, unit: DeltaUnit) -> Self {
            Self { amount, unit }
        }
        pub fn minutes(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Minute)
        }
        pub fn hours(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Hour)
        }
        pub fn days(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Day)
        }
        pub fn weeks(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Week)
        }
        pub fn months(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Month)
        }
        pub fn years(amount: i64) -> Self {
            Self::new(amount, DeltaUnit::Year)
        }
    }

    impl Repeater {
        pub fn step(&self) -> Delta {
            Delta::new(self.amount as i64, self.unit.into())
        }
    }

    /* --------------------------- Construction --------------------------- */

    impl Timestamp {
        pub fn from_date(date: NaiveDate, active: bool) -> Self {
            Self {
                active,
                date,
                time: None,
                time_end: None,
                repeater: None,
                delay: None,
                related_date_range: None,
                is_logbook: false,
                range: TextRange::default(),
            }
        }

        /// Minute-precision timestamp for a wall-clock instant.
        pub fn from_datetime(dt: NaiveDateTime, active: bool) -> Self {
            let mut ts = Self::from_date(dt.date(), active);
            ts.time = NaiveTime::from_hms_opt(dt.hour(), dt.minute(), 0);
            ts
        }

        /// Parse a whole token; trailing text is an error.
        pub fn parse(text: &str) -> Result<Self, TimestampError> {
            match token(text) {
                Ok(("", (ts, _))) => Ok(ts),
                _ => Err(TimestampError::Malformed(text.to_string())),
            }
        }

        /// Parse a token at the start of `text`, returning it with the consumed byte length.
        pub fn parse_prefix(text: &str) -> Option<(Self, usize)> {
            let (rest, (ts, _)) = token(text).ok()?;
            Some((ts, text.len() - rest.len()))
        }

        /// Start of the timestamp as a date-time (midnight when no time is set).
        pub fn point(&self) -> NaiveDateTime {
            self.date.and_time(self.time.unwrap_or(NaiveTime::MIN))
        }

        pub fn with_active(&self, active: bool) -> Self {
            let mut out = self.clone();
            out.active = active;
            if let Some(end) = &mut out.related_date_range {
                end.active = active;
            }
            out
        }

        /// Serialized token including delimiters and the second half of a date range.
        pub fn to_wrapped_string(&self) -> String {
            let mut buf = self.render_single();
            if let Some(end) = &self.related_date_range {
                buf.push_str("--");
                buf.push_str(&end.render_single());
            }
            buf
        }

        fn render_single(&self) -> String {
            let mut buf = String::new();
            buf.push(if self.active { '<' } else { '[' });
            buf.push_str(&self.date.format("%Y-%m-%d %a").to_string());
            if let Some(time) = self.time {
                buf.push(' ');
                buf.push_str(&time.format("%H:%M").to_string());
                if let Some(end) = self.time_end {
                    buf.push('-');
                    buf.push_str(&end.format("%H:%M").to_string());
                }
            }
            if let Some(rep) = &self.repeater {
                buf.push_str(&format!(" {}{}{}", rep.kind.mark(), rep.amount, rep.unit.as_char()));
            }
            if let Some(delay) = &self.delay {
                let mark = if delay.first_only { "--" } else { "-" };
                buf.push_str(&format!(" {}{}{}", mark, delay.amount, delay.unit.as_char()));
            }
            buf.push(if self.active { '>' } else { ']' });
            buf
        }
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.to_wrapped_string())
        }
    }

    /* ---------------------------- Arithmetic ---------------------------- */

    fn shift_days(date: NaiveDate, days: i64) -> NaiveDate {
        date.checked_add_signed(Duration::days(days))
            .unwrap_or(date)
    }

    /// Month arithmetic clamps the day to the target month's length.
    fn shift_months(date: NaiveDate, months: i64) -> NaiveDate {
        let m = Months::new(months.unsigned_abs().min(u32::MAX as u64) as u32);
        let shifted = if months >= 0 {
            date.checked_add_months(m)
        } else {
            date.checked_sub_months(m)
        };
        shifted.unwrap_or(date)
    }

    impl Timestamp {
        /// New timestamp shifted by `delta`. Time shifts carry into the date and move a
        /// time-range end along with the start; the text range is left for the caller.
        pub fn adjust(&self, delta: Delta) -> Timestamp {
            let mut out = self.clone();
            match delta.unit {
                DeltaUnit::Day => out.date = shift_days(self.date, delta.amount),
                DeltaUnit::Week => out.date = shift_days(self.date, delta.amount.saturating_mul(7)),
                DeltaUnit::Month => out.date = shift_months(self.date, delta.amount),
                DeltaUnit::Year => {
                    out.date = shift_months(self.date, delta.amount.saturating_mul(12))
                }
                DeltaUnit::Hour | DeltaUnit::Minute => {
                    let minutes = if delta.unit == DeltaUnit::Hour {
                        delta.amount.saturating_mul(60)
                    } else {
                        delta.amount
                    };
                    let Some(time) = self.time else {
                        return out;
                    };
                    let step = Duration::minutes(minutes);
                    if let Some(dt) = self.date.and_time(time).checked_add_signed(step) {
                        out.date = dt.date();
                        out.time = Some(dt.time());
                        out.time_end = self.time_end.map(|end| end.overflowing_add_signed(step).0);
                    }
                }
            }
            out
        }

        /// Shift only the end of a time range; date units and missing ends leave it unchanged.
        pub fn adjust_end_time(&self, delta: Delta) -> Timestamp {
            let mut out = self.clone();
            let minutes = match delta.unit {
                DeltaUnit::Hour => delta.amount.saturating_mul(60),
                DeltaUnit::Minute => delta.amount,
                _ => return out,
            };
            if let Some(end) = self.time_end {
                out.time_end = Some(end.overflowing_add_signed(Duration::minutes(minutes)).0);
            }
            out
        }

        /// Move the start (or range end) minute by `steps` multiples of `rounding`,
        /// snapping an unaligned minute to the grid on the first step.
        pub fn adjust_minutes_rounded(&self, steps: i64, rounding: u32, end: bool) -> Timestamp {
            let current = if end { self.time_end } else { self.time };
            let Some(current) = current else {
                return self.clone();
            };
            let r = rounding.max(1) as i64;
            let m = current.minute() as i64;
            let base = if steps >= 0 {
                m - m.rem_euclid(r)
            } else {
                m + (r - m.rem_euclid(r)) % r
            };
            let delta = Delta::minutes(base + steps * r - m);
            if end {
                self.adjust_end_time(delta)
            } else {
                self.adjust(delta)
            }
        }

        /// Next occurrence for a repeating timestamp, measured against `now`.
        pub fn apply_repeater(&self, now: NaiveDateTime) -> Timestamp {
            let Some(rep) = self.repeater else {
                return self.clone();
            };
            if rep.amount == 0 {
                return self.clone();
            }
            let step = rep.step();
            let hourly = rep.unit == TimeUnit::Hour;
            let mut next = match rep.kind {
                RepeaterKind::Cumulative => self.adjust(step),
                RepeaterKind::Restart => {
                    let mut base = self.clone();
                    base.date = now.date();
                    if hourly {
                        base.time = NaiveTime::from_hms_opt(now.hour(), now.minute(), 0);
                    }
                    base.adjust(step)
                }
                RepeaterKind::CatchUp => {
                    let mut cur = self.adjust(step);
                    loop {
                        let behind = if hourly {
                            cur.point() <= now
                        } else {
                            cur.date < now.date()
                        };
                        if !behind {
                            break;
                        }
                        let advanced = cur.adjust(step);
                        if advanced == cur {
                            break;
                        }
                        cur = advanced;
                    }
                    cur
                }
            };
            if let Some(end) = &self.related_date_range {
                let days = (next.date - self.date).num_days();
                let mut end = end.as_ref().clone();
                end.date = shift_days(end.date, days);
                next.related_date_range = Some(Box::new(end));
            }
            next
        }
    }

    /* ---------------------------- Field locate ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DateField {
        OpenDelimiter,
        Year,
        Month,
        Day,
        DayName,
        Hour,
        Minute,
        EndHour,
        EndMinute,
        RepeaterAmount,
        RepeaterUnit,
        DelayAmount,
        DelayUnit,
        CloseDelimiter,
        RangeSeparator,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum RangeHalf {
        Start,
        End,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FieldHit {
        pub half: RangeHalf,
        pub field: DateField,
    }

    /// Field start offsets (bytes, relative to the token) in ascending order.
    type Spans = Vec<(FieldHit, usize)>;

    /// Which sub-field the character `offset` of `text` addresses.
    /// Separators belong to the field before them.
    pub fn locate_field(text: &str, offset: usize) -> Option<FieldHit> {
        let (rest, (_, spans)) = token(text).ok()?;
        let consumed = &text[..text.len() - rest.len()];
        if offset >= char_len(consumed) {
            return None;
        }
        spans
            .iter()
            .map(|(hit, byte)| (*hit, char_len(&consumed[..*byte])))
            .take_while(|(_, start)| *start <= offset)
            .last()
            .map(|(hit, _)| hit)
    }

    /* ------------------------------ Grammar ------------------------------ */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// A full token: one stamp, optionally `--` and a second stamp of the same kind.
    pub(crate) fn token(i: &str) -> PResult<'_, (Timestamp, Spans)> {
        let (rest, (mut first, mut spans)) = stamp(i, RangeHalf::Start)?;
        let first_len = i.len() - rest.len();
        let second = preceded(tag("--"), |s| stamp(s, RangeHalf::End))(rest);
        let rest = match second {
            Ok((after, (end, end_spans))) if end.active == first.active => {
                spans.push((
                    FieldHit {
                        half: RangeHalf::Start,
                        field: DateField::RangeSeparator,
                    },
                    first_len,
                ));
                spans.extend(end_spans.into_iter().map(|(h, b)| (h, b + first_len + 2)));
                first.related_date_range = Some(Box::new(end));
                after
            }
            _ => rest,
        };
        let consumed = &i[..i.len() - rest.len()];
        first.range = TextRange::on_line(0, 0, char_len(consumed));
        Ok((rest, (first, spans)))
    }

    fn stamp(i: &str, half: RangeHalf) -> PResult<'_, (Timestamp, Spans)> {
        let total = i.len();
        let at = |rest: &str| total - rest.len();
        let mut spans: Spans = Vec::new();
        let mut mark = |field: DateField, byte: usize| spans.push((FieldHit { half, field }, byte));

        let (i, open) = alt((char('<'), char('[')))(i)?;
        let active = open == '<';
        mark(DateField::OpenDelimiter, 0);

        mark(DateField::Year, at(i));
        let (i, year) = number::<i32>(4, 4)(i)?;
        let (i, _) = char('-')(i)?;
        mark(DateField::Month, at(i));
        let (i, month) = number::<u32>(2, 2)(i)?;
        let (i, _) = char('-')(i)?;
        mark(DateField::Day, at(i));
        let (i, day) = number::<u32>(2, 2)(i)?;
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| fail(i, "date"))?;

        let (i, day_name) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        if let Some(name) = day_name {
            mark(DateField::DayName, at(i) - name.len());
        }

        let mut time = None;
        let mut time_end = None;
        let (i, start_clock) = opt(preceded(space1, clock_time))(i)?;
        let i = match start_clock {
            Some(((hour, minute), t)) => {
                let end = at(i);
                mark(DateField::Hour, end - hour.len() - 1 - minute.len());
                mark(DateField::Minute, end - minute.len());
                time = Some(t);
                let (i, end_clock) = opt(preceded(char('-'), clock_time))(i)?;
                if let Some(((hour, minute), t)) = end_clock {
                    let end = at(i);
                    mark(DateField::EndHour, end - hour.len() - 1 - minute.len());
                    mark(DateField::EndMinute, end - minute.len());
                    time_end = Some(t);
                }
                i
            }
            None => i,
        };

        let (i, rep) = opt(preceded(
            space1,
            tuple((alt((tag("++"), tag(".+"), tag("+"))), digit1, one_of("hdwmy"))),
        ))(i)?;
        let repeater = match rep {
            Some((sym, amount, unit)) => {
                let end = at(i);
                mark(DateField::RepeaterAmount, end - 1 - amount.len() - sym.len());
                mark(DateField::RepeaterUnit, end - 1);
                let kind = match sym {
                    "++" => RepeaterKind::CatchUp,
                    ".+" => RepeaterKind::Restart,
                    _ => RepeaterKind::Cumulative,
                };
                Some(Repeater {
                    kind,
                    amount: amount.parse().map_err(|_| fail(i, "repeater"))?,
                    unit: TimeUnit::from_char(unit).ok_or_else(|| fail(i, "unit"))?,
                })
            }
            None => None,
        };

        let (i, del) = opt(preceded(
            space1,
            tuple((alt((tag("--"), tag("-"))), digit1, one_of("hdwmy"))),
        ))(i)?;
        let delay = match del {
            Some((sym, amount, unit)) => {
                let end = at(i);
                mark(DateField::DelayAmount, end - 1 - amount.len() - sym.len());
                mark(DateField::DelayUnit, end - 1);
                Some(Delay {
                    first_only: sym == "--",
                    amount: amount.parse().map_err(|_| fail(i, "delay"))?,
                    unit: TimeUnit::from_char(unit).ok_or_else(|| fail(i, "unit"))?,
                })
            }
            None => None,
        };

        let (i, _) = space0(i)?;
        let close_at = at(i);
        let (i, _) = char(if active { '>' } else { ']' })(i)?;
        mark(DateField::CloseDelimiter, close_at);

        let ts = Timestamp {
            active,
            date,
            time,
            time_end,
            repeater,
            delay,
            related_date_range: None,
            is_logbook: false,
            range: TextRange::default(),
        };
        Ok((i, (ts, spans)))
    }

    type ClockParts<'a> = ((&'a str, &'a str), NaiveTime);

    fn clock_time(i: &str) -> PResult<'_, ClockParts<'_>> {
        let (i, hour) = take_while_m_n(1, 2, |c| c.is_ascii_digit())(i)?;
        let (i, _) = char(':')(i)?;
        let (i, minute) = take_while_m_n(2, 2, |c| c.is_ascii_digit())(i)?;
        let h: u32 = hour.parse().map_err(|_| fail(i, "hour"))?;
        let m: u32 = minute.parse().map_err(|_| fail(i, "minute"))?;
        let t = NaiveTime::from_hms_opt(h, m, 0).ok_or_else(|| fail(i, "time"))?;
        Ok((i, ((hour, minute), t)))
    }

    fn number<T: std::str::FromStr>(m: usize, n: usize) -> impl Fn(&str) -> PResult<'_, T> {
        move |i: &str| map_res(take_while_m_n(m, n, |c| c.is_ascii_digit()), str::parse::<T>)(i)
    }

    fn take_while_m_n<F>(m: usize, n: usize, cond: F) -> impl Fn(&str) -> PResult<'_, &str>
    where
        F: Fn(char) -> bool + Copy,
    {
        move |i: &str| {
            let (rest, out) = take_while(cond)(i)?;
            if out.len() < m || out.len() > n {
                Err(nom::Err::Error(VerboseError {
                    errors: vec![(i, VerboseErrorKind::Context("m_n"))],
                }))
            } else {
                Ok((rest, out))
            }
        }
    }

    fn fail<'a>(i: &'a str, ctx: &'static str) -> nom::Err<VerboseError<&'a str>> {
        nom::Err::Error(VerboseError {
            errors: vec![(i, VerboseErrorKind::Context(ctx))],
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn ts(s: &str) -> Timestamp {
            Timestamp::parse(s).unwrap()
        }

        fn date(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
            date(y, m, d).and_hms_opt(h, min, 0).unwrap()
        }

        #[test]
        fn canonical_tokens_round_trip() {
            for text in [
                "<2026-10-18 Sun>",
                "[2026-10-18 Sun]",
                "<2026-10-18 Sun 09:30>",
                "<2026-10-18 Sun 09:30-11:00>",
                "<2026-10-18 Sun>--<2026-10-20 Tue>",
                "[2026-10-18 Sun 09:30]--[2026-10-18 Sun 10:45]",
                "<2026-10-18 Sun +1y>",
                "<2026-10-18 Sun 08:00 ++2w>",
                "<2026-10-18 Sun .+3d -2d>",
                "<2026-10-18 Sun +1m --1w>",
            ] {
                assert_eq!(ts(text).to_wrapped_string(), text, "{text}");
            }
        }

        #[test]
        fn parse_accepts_missing_weekday_and_short_hour() {
            let t = ts("<2026-10-18 9:05>");
            assert_eq!(t.time, NaiveTime::from_hms_opt(9, 5, 0));
            assert_eq!(t.to_wrapped_string(), "<2026-10-18 Sun 09:05>");
        }

        #[test]
        fn parse_reads_repeater_kinds() {
            assert_eq!(ts("<2026-10-18 +1d>").repeater.unwrap().kind, RepeaterKind::Cumulative);
            assert_eq!(ts("<2026-10-18 ++1d>").repeater.unwrap().kind, RepeaterKind::CatchUp);
            assert_eq!(ts("<2026-10-18 .+1d>").repeater.unwrap().kind, RepeaterKind::Restart);
        }

        #[test]
        fn malformed_tokens_are_rejected() {
            for text in ["<2026-13-01>", "<2026-10-18", "2026-10-18", "[2026-10-18>", "<2026-10-18 Sun> tail", "[ ]"] {
                assert!(Timestamp::parse(text).is_err(), "{text}");
            }
        }

        #[test]
        fn mixed_range_halves_stop_at_first_stamp() {
            let (t, len) = Timestamp::parse_prefix("<2026-10-18 Sun>--[2026-10-19 Mon]").unwrap();
            assert!(t.related_date_range.is_none());
            assert_eq!(len, "<2026-10-18 Sun>".len());
        }

        #[test]
        fn month_adjustment_clamps_day() {
            let t = ts("<2026-01-31 Sat>");
            assert_eq!(t.adjust(Delta::months(1)).date, date(2026, 2, 28));
            let t = ts("<2026-03-31 Tue>");
            assert_eq!(t.adjust(Delta::months(1)).date, date(2026, 4, 30));
            assert_eq!(ts("<2024-02-29 Thu>").adjust(Delta::years(1)).date, date(2025, 2, 28));
        }

        #[test]
        fn time_adjustment_carries_into_date() {
            let t = ts("<2026-12-31 Thu 23:30>");
            let next = t.adjust(Delta::minutes(45));
            assert_eq!(next.date, date(2027, 1, 1));
            assert_eq!(next.time, NaiveTime::from_hms_opt(0, 15, 0));
            let back = ts("<2026-03-01 Sun 00:30>").adjust(Delta::hours(-1));
            assert_eq!(back.date, date(2026, 2, 28));
            assert_eq!(back.to_wrapped_string(), "<2026-02-28 Sat 23:30>");
        }

        #[test]
        fn start_time_shift_moves_range_end() {
            let t = ts("<2026-10-18 Sun 10:00-11:30>").adjust(Delta::hours(1));
            assert_eq!(t.to_wrapped_string(), "<2026-10-18 Sun 11:00-12:30>");
            let only_end = ts("<2026-10-18 Sun 10:00-11:30>").adjust_end_time(Delta::minutes(15));
            assert_eq!(only_end.to_wrapped_string(), "<2026-10-18 Sun 10:00-11:45>");
        }

        #[test]
        fn rounded_minutes_snap_to_grid() {
            let t = ts("<2026-10-18 Sun 10:03>");
            assert_eq!(t.adjust_minutes_rounded(1, 5, false).to_wrapped_string(), "<2026-10-18 Sun 10:05>");
            assert_eq!(t.adjust_minutes_rounded(-1, 5, false).to_wrapped_string(), "<2026-10-18 Sun 10:00>");
            let aligned = ts("<2026-10-18 Sun 10:05>");
            assert_eq!(aligned.adjust_minutes_rounded(-1, 5, false).to_wrapped_string(), "<2026-10-18 Sun 10:00>");
            assert_eq!(aligned.adjust_minutes_rounded(2, 5, false).to_wrapped_string(), "<2026-10-18 Sun 10:15>");
        }

        #[test]
        fn cumulative_repeater_advances_from_stored_date() {
            let t = ts("<2026-10-04 Sun +1w>");
            let next = t.apply_repeater(at(2026, 10, 18, 12, 0));
            assert_eq!(next.date, date(2026, 10, 11));
        }

        #[test]
        fn catch_up_repeater_lands_on_or_after_today() {
            let t = ts("<2026-10-04 Sun ++1w>");
            assert_eq!(t.apply_repeater(at(2026, 10, 18, 12, 0)).date, date(2026, 10, 18));
            let future = ts("<2026-10-25 Sun ++1w>");
            assert_eq!(future.apply_repeater(at(2026, 10, 18, 12, 0)).date, date(2026, 11, 1));
        }

        #[test]
        fn restart_repeater_counts_from_today() {
            let t = ts("<2026-09-01 Tue 07:00 .+2d>");
            let next = t.apply_repeater(at(2026, 10, 18, 12, 0));
            assert_eq!(next.to_wrapped_string(), "<2026-10-20 Tue 07:00 .+2d>");
        }

        #[test]
        fn locate_maps_every_offset_to_one_field() {
            let text = "<2026-10-18 Sun 10:00-11:30 +1w -2d>";
            let hit = |o| locate_field(text, o).map(|h| h.field);
            assert_eq!(hit(0), Some(DateField::OpenDelimiter));
            assert_eq!(hit(1), Some(DateField::Year));
            assert_eq!(hit(5), Some(DateField::Year));
            assert_eq!(hit(6), Some(DateField::Month));
            assert_eq!(hit(9), Some(DateField::Day));
            assert_eq!(hit(12), Some(DateField::DayName));
            assert_eq!(hit(16), Some(DateField::Hour));
            assert_eq!(hit(19), Some(DateField::Minute));
            assert_eq!(hit(22), Some(DateField::EndHour));
            assert_eq!(hit(25), Some(DateField::EndMinute));
            assert_eq!(hit(28), Some(DateField::RepeaterAmount));
            assert_eq!(hit(30), Some(DateField::RepeaterUnit));
            assert_eq!(hit(32), Some(DateField::DelayAmount));
            assert_eq!(hit(34), Some(DateField::DelayUnit));
            assert_eq!(hit(35), Some(DateField::CloseDelimiter));
            assert_eq!(hit(36), None);
            for offset in 0..text.len() {
                assert_eq!(locate_field(text, offset), locate_field(text, offset));
                assert!(locate_field(text, offset).is_some());
            }
        }

        #[test]
        fn locate_reports_range_halves() {
            let text = "<2026-10-18 Sun>--<2026-10-20 Tue>";
            assert_eq!(
                locate_field(text, 16),
                Some(FieldHit { half: RangeHalf::Start, field: DateField::RangeSeparator })
            );
            assert_eq!(
                locate_field(text, 27),
                Some(FieldHit { half: RangeHalf::End, field: DateField::Day })
            );
        }

        #[test]
        fn unit_cycle_wraps() {
            assert_eq!(TimeUnit::Year.cycle(true), TimeUnit::Hour);
            assert_eq!(TimeUnit::Hour.cycle(false), TimeUnit::Year);
            assert_eq!(TimeUnit::Day.cycle(true), TimeUnit::Week);
        }
    }
}

pub mod states {
    //! Keyword and priority state machines. Both are built per operation from the
    //! heading's current value; nothing here is persisted.

    use crate::core::{Priority, TodoKeyword};
    use serde::{Deserialize, Serialize};
    use serde_with::skip_serializing_none;

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct KeywordDef {
        pub text: String,
        pub is_done: bool,
        pub shortcut: Option<char>,
    }

    impl KeywordDef {
        pub fn to_keyword(&self) -> TodoKeyword {
            TodoKeyword {
                text: self.text.clone(),
                is_done: self.is_done,
            }
        }
    }

    /// Flattened keyword vocabulary in configured order.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TodoKeywords {
        pub keywords: Vec<KeywordDef>,
    }

    impl TodoKeywords {
        /// Each sequence is split at `|`; without one the last word is DONE-class.
        /// `WAIT(w@/!)` assigns the fast-access key `w`.
        pub fn from_sequences(seqs: &[Vec<String>]) -> Self {
            let mut keywords = Vec::new();
            for seq in seqs {
                let words: Vec<&str> = seq
                    .iter()
                    .flat_map(|w| w.split_whitespace())
                    .collect();
                let bar = words.iter().position(|w| *w == "|");
                let real: Vec<&str> = words.iter().copied().filter(|w| *w != "|").collect();
                let first_done = match bar {
                    Some(idx) => idx,
                    None => real.len().saturating_sub(1),
                };
                for (idx, word) in real.iter().enumerate() {
                    let (text, shortcut) = split_shortcut(word);
                    if text.is_empty() || keywords.iter().any(|k: &KeywordDef| k.text == text) {
                        continue;
                    }
                    keywords.push(KeywordDef {
                        text: text.to_string(),
                        is_done: idx >= first_done,
                        shortcut,
                    });
                }
            }
            Self { keywords }
        }

        pub fn find(&self, text: &str) -> Option<&KeywordDef> {
            self.keywords.iter().find(|k| k.text == text)
        }

        pub fn position(&self, text: &str) -> Option<usize> {
            self.keywords.iter().position(|k| k.text == text)
        }

        pub fn first_todo(&self) -> Option<&KeywordDef> {
            self.keywords.iter().find(|k| !k.is_done)
        }

        pub fn has_fast_access(&self) -> bool {
            self.keywords.iter().any(|k| k.shortcut.is_some())
        }

        pub fn by_shortcut(&self, key: char) -> Option<&KeywordDef> {
            self.keywords.iter().find(|k| k.shortcut == Some(key))
        }
    }

    fn split_shortcut(word: &str) -> (&str, Option<char>) {
        match word.split_once('(') {
            Some((text, rest)) => {
                let key = rest.chars().next().filter(|c| c.is_alphanumeric());
                (text, key)
            }
            None => (word, None),
        }
    }

    /// Position in the cycle `[none, k0, k1, ..]`.
    #[derive(Debug, Clone, Copy)]
    pub struct TodoState<'a> {
        keywords: &'a TodoKeywords,
        current: Option<usize>,
    }

    impl<'a> TodoState<'a> {
        /// Unknown keyword text is treated as "no keyword".
        pub fn new(keywords: &'a TodoKeywords, current: Option<&str>) -> Self {
            Self {
                keywords,
                current: current.and_then(|t| keywords.position(t)),
            }
        }

        pub fn current(&self) -> Option<&'a KeywordDef> {
            self.current.and_then(|i| self.keywords.keywords.get(i))
        }

        pub fn keyword(&self) -> Option<TodoKeyword> {
            self.current().map(KeywordDef::to_keyword)
        }

        pub fn is_done(&self) -> bool {
            self.current().is_some_and(|k| k.is_done)
        }

        pub fn get_next(&self) -> Self {
            let len = self.keywords.keywords.len();
            let current = match self.current {
                None if len > 0 => Some(0),
                Some(i) if i + 1 < len => Some(i + 1),
                _ => None,
            };
            Self { current, ..*self }
        }

        pub fn get_prev(&self) -> Self {
            let len = self.keywords.keywords.len();
            let current = match self.current {
                None if len > 0 => Some(len - 1),
                Some(i) if i > 0 => Some(i - 1),
                _ => None,
            };
            Self { current, ..*self }
        }

        /// First TODO-class keyword.
        pub fn get_todo(&self) -> Self {
            let current = self.keywords.keywords.iter().position(|k| !k.is_done);
            Self { current, ..*self }
        }

        /// Jump by shortcut; a space clears the keyword. Unknown keys yield `None`.
        pub fn fast_access(&self, key: char) -> Option<Self> {
            if key == ' ' {
                return Some(Self {
                    current: None,
                    ..*self
                });
            }
            let current = self.keywords.keywords.iter().position(|k| k.shortcut == Some(key))?;
            Some(Self {
                current: Some(current),
                ..*self
            })
        }
    }

    /// Before/after pair of one keyword change.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Transition {
        pub from: Option<TodoKeyword>,
        pub to: Option<TodoKeyword>,
    }

    impl Transition {
        pub fn changed(&self) -> bool {
            self.from != self.to
        }

        pub fn was_done(&self) -> bool {
            self.from.as_ref().is_some_and(|k| k.is_done)
        }

        pub fn is_done(&self) -> bool {
            self.to.as_ref().is_some_and(|k| k.is_done)
        }

        pub fn entered_done(&self) -> bool {
            !self.was_done() && self.is_done()
        }

        pub fn left_done(&self) -> bool {
            self.was_done() && !self.is_done()
        }
    }

    /// Priority alphabet, `highest` has the smallest code point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PriorityRange {
        pub highest: char,
        pub lowest: char,
    }

    impl Default for PriorityRange {
        fn default() -> Self {
            Self {
                highest: 'A',
                lowest: 'Z',
            }
        }
    }

    impl PriorityRange {
        /// Parses `#+PRIORITIES: A C B` (highest, lowest, default).
        pub fn from_setting(value: &str) -> Option<Self> {
            let mut parts = value.split_whitespace().filter_map(|p| p.chars().next());
            let highest = parts.next()?;
            let lowest = parts.next()?;
            (highest <= lowest).then_some(Self { highest, lowest })
        }
    }

    /// Priority stepping clamped at both ends; "none" sits below the lowest value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PriorityState {
        range: PriorityRange,
        current: Option<char>,
    }

    impl PriorityState {
        pub fn new(range: PriorityRange, current: Option<Priority>) -> Self {
            Self {
                range,
                current: current.map(|p| p.0),
            }
        }

        pub fn current(&self) -> Option<Priority> {
            self.current.map(Priority)
        }

        pub fn increase(&self) -> Self {
            let current = match self.current {
                None => Some(self.range.lowest),
                Some(c) if c > self.range.lowest => Some(self.range.lowest),
                Some(c) if c <= self.range.highest => Some(self.range.highest),
                Some(c) => char::from_u32(c as u32 - 1).or(Some(c)),
            };
            Self { current, ..*self }
        }

        pub fn decrease(&self) -> Self {
            let current = match self.current {
                None => None,
                Some(c) if c >= self.range.lowest => None,
                Some(c) if c < self.range.highest => Some(self.range.highest),
                Some(c) => char::from_u32(c as u32 + 1).or(Some(c)),
            };
            Self { current, ..*self }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn kws(seq: &[&str]) -> TodoKeywords {
            TodoKeywords::from_sequences(&[seq.iter().map(|s| s.to_string()).collect()])
        }

        #[test]
        fn sequences_split_on_bar_or_last_word() {
            let k = kws(&["TODO", "NEXT", "|", "DONE", "CANCELLED"]);
            assert!(!k.find("NEXT").unwrap().is_done);
            assert!(k.find("CANCELLED").unwrap().is_done);
            let k = kws(&["OPEN", "CLOSED"]);
            assert!(!k.find("OPEN").unwrap().is_done);
            assert!(k.find("CLOSED").unwrap().is_done);
        }

        #[test]
        fn single_string_sequences_and_shortcuts() {
            let k = kws(&["TODO(t) WAIT(w@/!) | DONE(d!)"]);
            assert_eq!(k.by_shortcut('w').unwrap().text, "WAIT");
            assert_eq!(k.find("DONE").unwrap().shortcut, Some('d'));
            assert!(k.has_fast_access());
        }

        #[test]
        fn next_visits_every_keyword_once_then_returns() {
            let k = kws(&["TODO", "NEXT", "|", "DONE"]);
            for start in [None, Some("TODO"), Some("NEXT"), Some("DONE")] {
                let mut st = TodoState::new(&k, start);
                let mut seen = Vec::new();
                for _ in 0..4 {
                    st = st.get_next();
                    seen.push(st.current().map(|d| d.text.clone()));
                }
                assert_eq!(st.current().map(|d| d.text.as_str()), start);
                seen.sort();
                seen.dedup();
                assert_eq!(seen.len(), 4);
            }
        }

        #[test]
        fn prev_reverses_next() {
            let k = kws(&["TODO", "NEXT", "|", "DONE"]);
            let st = TodoState::new(&k, Some("NEXT"));
            assert_eq!(st.get_next().get_prev().current().unwrap().text, "NEXT");
            assert!(TodoState::new(&k, None).get_prev().is_done());
        }

        #[test]
        fn get_todo_resets_to_first_todo_class() {
            let k = kws(&["|", "SKIP", "TODO", "DONE"]);
            let k2 = kws(&["WAIT", "TODO", "|", "DONE"]);
            assert_eq!(TodoState::new(&k2, Some("DONE")).get_todo().current().unwrap().text, "WAIT");
            assert!(TodoState::new(&k, Some("DONE")).get_todo().current().is_none());
        }

        #[test]
        fn fast_access_jumps_or_clears() {
            let k = kws(&["TODO(t)", "|", "DONE(d)"]);
            let st = TodoState::new(&k, Some("TODO"));
            assert_eq!(st.fast_access('d').unwrap().current().unwrap().text, "DONE");
            assert!(st.fast_access(' ').unwrap().current().is_none());
            assert!(st.fast_access('x').is_none());
        }

        #[test]
        fn priority_clamps_at_both_ends() {
            let range = PriorityRange { highest: 'A', lowest: 'C' };
            let none = PriorityState::new(range, None);
            assert_eq!(none.increase().current(), Some(Priority('C')));
            assert_eq!(none.decrease().current(), None);
            let a = PriorityState::new(range, Some(Priority('A')));
            assert_eq!(a.increase().current(), Some(Priority('A')));
            assert_eq!(a.decrease().current(), Some(Priority('B')));
            let c = PriorityState::new(range, Some(Priority('C')));
            assert_eq!(c.decrease().current(), None);
        }

        #[test]
        fn priority_setting_parses_highest_and_lowest() {
            assert_eq!(
                PriorityRange::from_setting("A E C"),
                Some(PriorityRange { highest: 'A', lowest: 'E' })
            );
            assert_eq!(PriorityRange::from_setting("Z A"), None);
        }
    }
}

pub mod parser {
    //! Line-oriented outline parser built on `nom`.
    //!
    //! - Settings (`#+TODO:`, `#+PRIORITIES:`) are read first so headline keywords are known.
    //! - Headings are stack-built by level; each headline is parsed with `nom` combinators.
    //! - Directly under a headline: an optional planning line, then drawers.
    //! - List items nest by indentation; timestamps and links become leaf nodes.

    use crate::config::EditorConfig;
    use crate::core::*;
    use crate::states::{PriorityRange, TodoKeywords};
    use crate::timestamp::{self, Timestamp};
    use anyhow::{Context, Result, anyhow};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, tag_no_case, take_until, take_while, take_while1},
        character::complete::{anychar, char, digit1, not_line_ending, one_of, space0, space1},
        combinator::{map, map_res, opt, recognize},
        error::{VerboseError, VerboseErrorKind},
        multi::many1,
        sequence::{delimited, terminated, tuple},
    };
    use std::{fs, path::Path};

    /* ------------------------ Public entry points ------------------------ */

    /// Builds a fresh node tree from raw text.
    pub trait OutlineParser {
        fn parse_text(&self, path: Option<&Path>, text: &str, version: u64) -> Result<Document>;

        fn parse_file(&self, abs_path: &Path) -> Result<Document> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            self.parse_text(Some(abs_path), &text, 0)
        }
    }

    /// Concrete parser implementing [`OutlineParser`].
    #[derive(Debug, Clone, Default)]
    pub struct NomOutlineParser {
        pub config: EditorConfig,
    }

    impl NomOutlineParser {
        pub fn new(config: EditorConfig) -> Self {
            Self { config }
        }
    }

    impl OutlineParser for NomOutlineParser {
        fn parse_text(&self, path: Option<&Path>, text: &str, version: u64) -> Result<Document> {
            parse_document_with(path, text, &self.config, version)
        }
    }

    pub fn parse_document(text: &str, config: &EditorConfig) -> Result<Document> {
        parse_document_with(None, text, config, 0)
    }

    pub fn parse_document_with(
        path: Option<&Path>,
        text: &str,
        config: &EditorConfig,
        version: u64,
    ) -> Result<Document> {
        let mut doc = Document::new(path.map(Path::to_path_buf), split_lines(text), version);
        doc.settings = parse_settings(&doc.lines);
        doc.keywords = config.todo_keywords_for(&doc.settings);
        doc.priorities = config.priorities_for(&doc.settings);

        let mut builder = Builder {
            doc: &mut doc,
            log_drawer: config.log_drawer_name().to_string(),
            headings: Vec::new(),
            items: Vec::new(),
        };
        builder.run()?;
        tracing::trace!(
            nodes = doc.nodes.len(),
            lines = doc.lines.len(),
            version,
            "parsed outline"
        );
        Ok(doc)
    }

    pub fn split_lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    /* ---------------------------- Settings ---------------------------- */

    fn parse_settings(lines: &[String]) -> FileSettings {
        let mut settings = FileSettings::default();
        for line in lines {
            if heading_level(line).is_some() {
                break;
            }
            let Ok((_, (key, value))) = parse_hash_key_value(line.trim_start()) else {
                continue;
            };
            let value = value.trim();
            match key.to_ascii_lowercase().as_str() {
                "todo" | "seq_todo" | "typ_todo" => settings
                    .todo_sequences
                    .push(value.split_whitespace().map(str::to_string).collect()),
                "priorities" => settings.priorities = PriorityRange::from_setting(value),
                _ => {
                    settings.meta.insert(key.to_string(), value.to_string());
                }
            }
        }
        settings
    }

    fn parse_hash_key_value(i: &str) -> PResult<'_, (&str, &str)> {
        // #+key: value
        map(
            tuple((
                tag("#+"),
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
                tag(":"),
                space0,
                not_line_ending,
            )),
            |(_, key, _, _, val)| (key, val),
        )(i)
    }

    /* ----------------------------- Tree build ----------------------------- */

    struct OpenItem {
        id: NodeId,
        indent: usize,
        last_line: usize,
    }

    struct Builder<'d> {
        doc: &'d mut Document,
        log_drawer: String,
        headings: Vec<(u8, NodeId)>,
        items: Vec<OpenItem>,
    }

    impl Builder<'_> {
        fn run(&mut self) -> Result<()> {
            let n = self.doc.lines.len();
            let mut i = 0;
            while i < n {
                let line = self.doc.lines[i].clone();
                if let Some(level) = heading_level(&line) {
                    self.close_items(0);
                    self.close_headings(level, i);
                    i = self.heading(i, level, &line)?;
                    continue;
                }
                self.body_line(i, &line);
                i += 1;
            }
            self.close_items(0);
            self.close_headings(0, n);
            Ok(())
        }

        fn owner(&self) -> NodeId {
            self.headings
                .last()
                .map(|(_, id)| *id)
                .unwrap_or(Document::ROOT)
        }

        fn close_headings(&mut self, level: u8, at: usize) {
            while let Some((top, id)) = self.headings.last().copied() {
                if top < level {
                    break;
                }
                self.headings.pop();
                if let Some(node) = self.doc.nodes.get_mut(id.0) {
                    node.range = TextRange::lines(node.range.start.line, at);
                }
            }
        }

        /// Close open list items indented at least `indent` columns.
        fn close_items(&mut self, indent: usize) {
            while let Some(top) = self.items.last() {
                if top.indent < indent {
                    break;
                }
                let (id, last) = (top.id, top.last_line);
                self.items.pop();
                if let Some(node) = self.doc.nodes.get_mut(id.0) {
                    node.range = TextRange::lines(node.range.start.line, last + 1);
                }
            }
        }

        /// Parses a headline and its meta area, returning the next unread line.
        fn heading(&mut self, i: usize, level: u8, line: &str) -> Result<usize> {
            let parent = self.owner();
            let (_, parts) = parse_headline(line, &self.doc.keywords).map_err(to_anyhow("headline"))?;
            let mut h = Heading::new(level, parts.title, i);
            h.todo = parts.todo.and_then(|t| self.doc.keywords.find(t)).map(|k| k.to_keyword());
            h.priority = parts.priority.map(Priority);
            h.tags = parts.tags;
            h.title_col = parts.title_col;
            let id = self.doc.push_node(
                parent,
                TextRange::lines(i, i + 1),
                NodeData::Heading(Box::new(h)),
            );
            self.headings.push((level, id));
            self.inline(i, line, id, false);

            let n = self.doc.lines.len();
            let mut j = i + 1;
            if j < n {
                let planning_text = self.doc.lines[j].clone();
                if let Ok((_, entries)) = parse_planning_line(&planning_text) {
                    self.planning(id, j, &planning_text, entries)?;
                    j += 1;
                }
            }
            while j < n {
                let Some(name) = drawer_name(&self.doc.lines[j]) else {
                    break;
                };
                let Some(end) = self.drawer_end(j) else {
                    break;
                };
                self.drawer(id, &name, j, end)?;
                j = end + 1;
            }
            Ok(j)
        }

        fn planning(
            &mut self,
            id: NodeId,
            line_idx: usize,
            line: &str,
            entries: Vec<PlanningEntry>,
        ) -> Result<()> {
            let mut planning = Planning::default();
            for entry in entries {
                let start = char_len(&line[..entry.start]);
                let end = char_len(&line[..entry.end]);
                let mut ts = entry.timestamp;
                ts.range = TextRange::on_line(line_idx, start, end);
                self.doc.push_node(id, ts.range, NodeData::Timestamp(ts.clone()));
                match entry.key {
                    PlanningKey::Scheduled => planning.scheduled = Some(ts),
                    PlanningKey::Deadline => planning.deadline = Some(ts),
                    PlanningKey::Closed => planning.closed = Some(ts),
                }
            }
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            let h = self.doc.heading_mut(id)?;
            h.planning = planning;
            h.planning_line = Some(line_idx);
            h.planning_indent = indent;
            Ok(())
        }

        fn drawer_end(&self, start: usize) -> Option<usize> {
            for (k, line) in self.doc.lines.iter().enumerate().skip(start + 1) {
                if heading_level(line).is_some() {
                    return None;
                }
                if line.trim().eq_ignore_ascii_case(":END:") {
                    return Some(k);
                }
            }
            None
        }

        fn drawer(&mut self, id: NodeId, name: &str, start: usize, end: usize) -> Result<()> {
            let is_log = name.eq_ignore_ascii_case(&self.log_drawer)
                || name.eq_ignore_ascii_case("LOGBOOK");
            let is_props = name.eq_ignore_ascii_case("PROPERTIES");
            let mut props = PropertyDrawer::default();
            let mut log = Logbook::default();
            for k in start + 1..end {
                let line = self.doc.lines[k].clone();
                if is_props {
                    if let Ok((_, (key, value))) = parse_property_line(&line) {
                        props.props.insert(key.to_string(), value.trim_end().to_string());
                    }
                } else if is_log {
                    match parse_clock_line(&line) {
                        Ok((_, entry)) => log.clock.push(entry),
                        Err(_) => log.raw.push(line.clone()),
                    }
                }
                self.inline(k, &line, id, is_log);
            }
            let h = self.doc.heading_mut(id)?;
            h.drawers.push(DrawerSpan {
                name: name.to_string(),
                start_line: start,
                end_line: end + 1,
            });
            if is_props {
                h.properties = props;
            } else if is_log {
                h.logbook.clock.extend(log.clock);
                h.logbook.raw.extend(log.raw);
            }
            Ok(())
        }

        fn body_line(&mut self, i: usize, line: &str) {
            if let Some(marker) = list_marker(line) {
                let width = char_len(&marker.indent);
                self.close_items(width);
                for open in &mut self.items {
                    open.last_line = i;
                }
                let parent = self.items.last().map(|o| o.id).unwrap_or_else(|| self.owner());
                let item = ListItem {
                    indent: marker.indent,
                    bullet: marker.bullet,
                    checkbox: marker.checkbox,
                    text: marker.text,
                    line: i,
                    content_col: marker.content_col,
                    dirty: false,
                };
                let id = self.doc.push_node(parent, TextRange::lines(i, i + 1), NodeData::ListItem(item));
                self.items.push(OpenItem {
                    id,
                    indent: width,
                    last_line: i,
                });
                self.inline(i, line, id, false);
                return;
            }
            if line.trim().is_empty() {
                return;
            }
            let width = line.chars().take_while(|c| c.is_whitespace()).count();
            self.close_items(width);
            for open in &mut self.items {
                open.last_line = i;
            }
            let parent = self.items.last().map(|o| o.id).unwrap_or_else(|| self.owner());
            self.inline(i, line, parent, false);
        }

        /// Timestamps and bracket links on one line become leaf nodes of `parent`.
        fn inline(&mut self, i: usize, line: &str, parent: NodeId, is_logbook: bool) {
            let mut b = 0;
            let mut col = 0;
            while b < line.len() {
                let rest = &line[b..];
                if rest.starts_with("[[") {
                    if let Ok((after, (target, description))) = parse_bracket_link(rest) {
                        let len = rest.len() - after.len();
                        let width = char_len(&rest[..len]);
                        let link = LinkNode {
                            target: target.trim().to_string(),
                            description: description.map(str::to_string),
                        };
                        self.doc.push_node(
                            parent,
                            TextRange::on_line(i, col, col + width),
                            NodeData::Link(link),
                        );
                        b += len;
                        col += width;
                        continue;
                    }
                }
                if rest.starts_with('<') || rest.starts_with('[') {
                    if let Some((mut ts, len)) = Timestamp::parse_prefix(rest) {
                        let width = char_len(&rest[..len]);
                        ts.range = TextRange::on_line(i, col, col + width);
                        ts.is_logbook = is_logbook;
                        self.doc.push_node(parent, ts.range, NodeData::Timestamp(ts));
                        b += len;
                        col += width;
                        continue;
                    }
                }
                let step = rest.chars().next().map(char::len_utf8).unwrap_or(1);
                b += step;
                col += 1;
            }
        }
    }

    /* ----------------------------- Line grammars ----------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn to_anyhow(label: &'static str) -> impl Fn(nom::Err<VerboseError<&str>>) -> anyhow::Error {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => {
                let at = ve
                    .errors
                    .first()
                    .map(|(frag, _)| frag.to_string())
                    .unwrap_or_default();
                anyhow!("parse error in {}: near {:?}", label, at)
            }
            nom::Err::Incomplete(_) => anyhow!("incomplete input while parsing {}", label),
        }
    }

    /// Level of a heading line (`*`s followed by a space), if it is one.
    pub fn heading_level(line: &str) -> Option<u8> {
        let stars = line.chars().take_while(|c| *c == '*').count();
        if stars == 0 || stars > u8::MAX as usize {
            return None;
        }
        match line[stars..].chars().next() {
            Some(' ') | Some('\t') => Some(stars as u8),
            _ => None,
        }
    }

    pub(crate) struct HeadlineParts<'a> {
        pub todo: Option<&'a str>,
        pub priority: Option<char>,
        pub title: &'a str,
        pub title_col: usize,
        pub tags: Vec<String>,
    }

    pub(crate) fn parse_headline<'a>(
        line: &'a str,
        keywords: &TodoKeywords,
    ) -> PResult<'a, HeadlineParts<'a>> {
        let (i, _) = recognize(many1(char('*')))(line)?;
        let (i, _) = space1(i)?;

        let first: PResult<'_, &str> = terminated(
            take_while1(|c: char| !c.is_whitespace()),
            alt((space1, nom::combinator::eof)),
        )(i);
        let (i, todo) = match first {
            Ok((rest, word)) if keywords.find(word).is_some() => (rest, Some(word)),
            _ => (i, None),
        };

        let (i, priority) = opt(delimited(tag("[#"), anychar, tag("]")))(i)?;
        let (i, _) = if priority.is_some() { space0(i)? } else { (i, "") };

        let title_col = char_len(&line[..line.len() - i.len()]);
        let (rest, title_text) = map(not_line_ending, str::trim_end)(i)?;

        let mut tags = Vec::new();
        let mut title = title_text;
        if let Some(trail) = title_text.split_whitespace().last() {
            if trail.len() > 1
                && trail.starts_with(':')
                && trail.ends_with(':')
                && trail.split(':').filter(|s| !s.is_empty()).all(|t| t.chars().all(is_tag_char))
            {
                tags = parse_colon_tags(trail);
                title = title_text[..title_text.len() - trail.len()].trim_end();
            }
        }
        Ok((
            rest,
            HeadlineParts {
                todo,
                priority,
                title,
                title_col,
                tags,
            },
        ))
    }

    pub(crate) fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || matches!(c, '_' | '@' | '#' | '%')
    }

    /// Tags from `:a:b:`, `a b` or `a:b`; duplicates dropped, order kept.
    pub fn parse_colon_tags(s: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for part in s.split(|c: char| c == ':' || c.is_whitespace()) {
            if part.is_empty() || !part.chars().all(is_tag_char) {
                continue;
            }
            if !out.iter().any(|t| t == part) {
                out.push(part.to_string());
            }
        }
        out
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum PlanningKey {
        Scheduled,
        Deadline,
        Closed,
    }

    struct PlanningEntry {
        key: PlanningKey,
        timestamp: Timestamp,
        /// Byte span of the timestamp token in the line.
        start: usize,
        end: usize,
    }

    fn parse_planning_line(line: &str) -> PResult<'_, Vec<PlanningEntry>> {
        // e.g.: SCHEDULED: <2026-10-18 Sun> DEADLINE: <...>  CLOSED: [2026-10-18 Sun 14:10]
        let mut rest = line;
        let mut entries = Vec::new();
        while !rest.trim().is_empty() {
            let (r, _) = space0(rest)?;
            let (r, key) = alt((
                map(tag("SCHEDULED:"), |_| PlanningKey::Scheduled),
                map(tag("DEADLINE:"), |_| PlanningKey::Deadline),
                map(tag("CLOSED:"), |_| PlanningKey::Closed),
            ))(r)?;
            let (r, _) = space0(r)?;
            let start = line.len() - r.len();
            let (r, (timestamp, _)) = timestamp::token(r)?;
            let end = line.len() - r.len();
            entries.push(PlanningEntry {
                key,
                timestamp,
                start,
                end,
            });
            rest = r;
        }
        if entries.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(line, VerboseErrorKind::Context("planning-empty"))],
            }));
        }
        Ok((rest, entries))
    }

    fn drawer_name(line: &str) -> Option<String> {
        let (rest, name) = delimited(
            char::<&str, VerboseError<&str>>(':'),
            take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '-'),
            char(':'),
        )(line.trim())
        .ok()?;
        (rest.is_empty() && !name.eq_ignore_ascii_case("END")).then(|| name.to_string())
    }

    pub(crate) fn parse_property_line(i: &str) -> PResult<'_, (&str, &str)> {
        //  :KEY: value
        map(
            tuple((
                space0,
                char(':'),
                take_while1(|c: char| !c.is_whitespace() && c != ':'),
                char(':'),
                space0,
                not_line_ending,
            )),
            |(_, _, key, _, _, val)| (key, val),
        )(i)
    }

    fn parse_clock_line(i: &str) -> PResult<'_, ClockEntry> {
        // CLOCK: [2026-10-18 Sun 10:00]--[2026-10-18 Sun 11:30] =>  1:30
        let (i, _) = space0(i)?;
        let (i, _) = tag_no_case("CLOCK:")(i)?;
        let (i, _) = space1(i)?;
        let (i, (mut start, _)) = timestamp::token(i)?;
        let end = start.related_date_range.take().map(|b| *b);
        let (i, minutes) = opt(parse_clock_minutes)(i)?;
        Ok((i, ClockEntry { start, end, minutes }))
    }

    fn parse_clock_minutes(i: &str) -> PResult<'_, i64> {
        let (i, _) = space0(i)?;
        let (i, _) = tag("=>")(i)?;
        let (i, _) = space0(i)?;
        let (i, hours) = map_res(digit1, |s: &str| s.parse::<i64>())(i)?;
        let (i, _) = char(':')(i)?;
        let (i, mins) = map_res(digit1, |s: &str| s.parse::<i64>())(i)?;
        Ok((i, hours * 60 + mins))
    }

    pub(crate) struct ListMarker {
        pub indent: String,
        pub bullet: Bullet,
        pub checkbox: Option<Checkbox>,
        pub text: String,
        pub content_col: usize,
    }

    pub(crate) fn list_marker(line: &str) -> Option<ListMarker> {
        parse_list_marker(line).ok().map(|(_, m)| m)
    }

    fn parse_list_marker(line: &str) -> PResult<'_, ListMarker> {
        let (i, indent) = take_while(|c: char| c == ' ' || c == '\t')(line)?;
        let (i, bullet) = alt((
            map(one_of("-+*"), Bullet::Unordered),
            map(
                tuple((map_res(digit1, |s: &str| s.parse::<u32>()), one_of(".)"))),
                |(number, delimiter)| Bullet::Ordered { number, delimiter },
            ),
        ))(i)?;
        if bullet == Bullet::Unordered('*') && indent.is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("star bullet at column 0"))],
            }));
        }
        let (i, _) = alt((space1, nom::combinator::eof))(i)?;
        let (i, checkbox) = opt(terminated(parse_checkbox, alt((space1, nom::combinator::eof))))(i)?;
        let content_col = char_len(&line[..line.len() - i.len()]);
        Ok((
            "",
            ListMarker {
                indent: indent.to_string(),
                bullet,
                checkbox,
                text: i.to_string(),
                content_col,
            },
        ))
    }

    fn parse_checkbox(i: &str) -> PResult<'_, Checkbox> {
        delimited(
            char('['),
            alt((
                map(char(' '), |_| Checkbox::Empty),
                map(char('-'), |_| Checkbox::Partial),
                map(one_of("xX"), |_| Checkbox::Checked),
            )),
            char(']'),
        )(i)
    }

    /// `[[target][description]]` or `[[target]]`.
    pub(crate) fn parse_bracket_link(i: &str) -> PResult<'_, (&str, Option<&str>)> {
        let (rest, inner) = delimited(tag("[["), take_until("]]"), tag("]]"))(i)?;
        let parsed = match inner.split_once("][") {
            Some((target, desc)) => (target, Some(desc)),
            None => (inner, None),
        };
        if parsed.0.trim().is_empty() {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(i, VerboseErrorKind::Context("empty link target"))],
            }));
        }
        Ok((rest, parsed))
    }

}

pub mod outline {
    //! Heading mutators and the renderer that turns dirty model regions into line edits.
    //! Untouched lines are never re-rendered; everything else is rebuilt from the model.

    use crate::core::*;
    use crate::parser::{parse_colon_tags, parse_property_line};
    use crate::timestamp::Timestamp;
    use serde::Serialize;
    use std::collections::BTreeSet;

    /// Where a repeating timestamp lives on its heading.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DateSlot {
        Scheduled,
        Deadline,
        /// A timestamp node in the heading's own body.
        Inline(NodeId),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct RepeaterDate {
        pub slot: DateSlot,
        pub timestamp: Timestamp,
    }

    /* --------------------------- Structural edits --------------------------- */

    impl Document {
        /// Move `id` (and its descendants when `whole_subtree`) `count` levels up.
        /// Returns `false` when that would leave level 1.
        pub fn promote(
            &mut self,
            id: NodeId,
            count: u8,
            whole_subtree: bool,
        ) -> Result<bool, DomainError> {
            let level = self.heading(id)?.level;
            if count == 0 || level <= count {
                return Ok(false);
            }
            self.shift_levels(id, -(count as i16), whole_subtree)?;
            Ok(true)
        }

        pub fn demote(
            &mut self,
            id: NodeId,
            count: u8,
            whole_subtree: bool,
        ) -> Result<bool, DomainError> {
            if count == 0 {
                return Ok(false);
            }
            let deepest = self
                .affected_headings(id, whole_subtree)
                .iter()
                .filter_map(|h| self.heading(*h).ok().map(|h| h.level))
                .max()
                .unwrap_or(0);
            if deepest.checked_add(count).is_none() {
                return Err(DomainError::InvalidLevel(deepest));
            }
            self.shift_levels(id, count as i16, whole_subtree)?;
            Ok(true)
        }

        fn affected_headings(&self, id: NodeId, whole_subtree: bool) -> Vec<NodeId> {
            let mut targets = vec![id];
            if whole_subtree {
                targets.extend(
                    self.descendants(id)
                        .into_iter()
                        .filter(|d| self.node(*d).map(Node::kind) == Some(NodeKind::Heading)),
                );
            }
            targets
        }

        fn shift_levels(&mut self, id: NodeId, delta: i16, whole_subtree: bool) -> Result<(), DomainError> {
            for target in self.affected_headings(id, whole_subtree) {
                let h = self.heading_mut(target)?;
                let current = h.level;
                h.level = u8::try_from(current as i16 + delta)
                    .map_err(|_| DomainError::InvalidLevel(current))?;
                h.mark_level_dirty();
            }
            Ok(())
        }

        /* ------------------------------ Headline ------------------------------ */

        pub fn set_todo(&mut self, id: NodeId, keyword: Option<TodoKeyword>) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.todo != keyword {
                h.todo = keyword;
                h.mark_headline_dirty();
            }
            Ok(())
        }

        /// `None` removes the cookie.
        pub fn set_priority(&mut self, id: NodeId, priority: Option<Priority>) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.priority != priority {
                h.priority = priority;
                h.mark_headline_dirty();
            }
            Ok(())
        }

        /// Accepts `:a:b:`, `a b` or `a:b`.
        pub fn set_tags(&mut self, id: NodeId, tag_string: &str) -> Result<(), DomainError> {
            let tags = parse_colon_tags(tag_string);
            let h = self.heading_mut(id)?;
            if h.tags != tags {
                h.tags = tags;
                h.mark_headline_dirty();
            }
            Ok(())
        }

        pub fn set_title(&mut self, id: NodeId, title: &str) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.title != title {
                h.title = title.to_string();
                h.mark_headline_dirty();
            }
            Ok(())
        }

        /* ----------------------------- Properties ----------------------------- */

        /// Updates an existing key in place (matching case-insensitively) or appends a new one.
        pub fn set_property(&mut self, id: NodeId, key: &str, value: &str) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            let existing = h
                .properties
                .props
                .keys()
                .find(|k| k.eq_ignore_ascii_case(key))
                .cloned();
            let key = existing.unwrap_or_else(|| key.to_string());
            if h.properties.props.get(&key).map(String::as_str) != Some(value) {
                h.properties.props.insert(key, value.to_string());
                h.mark_properties_dirty();
            }
            Ok(())
        }

        /* ------------------------------ Planning ------------------------------ */

        pub fn set_scheduled_date(&mut self, id: NodeId, ts: Timestamp) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            h.planning.scheduled = Some(ts);
            h.mark_planning_dirty();
            Ok(())
        }

        pub fn remove_scheduled_date(&mut self, id: NodeId) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.planning.scheduled.take().is_some() {
                h.mark_planning_dirty();
            }
            Ok(())
        }

        pub fn set_deadline_date(&mut self, id: NodeId, ts: Timestamp) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            h.planning.deadline = Some(ts);
            h.mark_planning_dirty();
            Ok(())
        }

        pub fn remove_deadline_date(&mut self, id: NodeId) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.planning.deadline.take().is_some() {
                h.mark_planning_dirty();
            }
            Ok(())
        }

        pub fn set_closed_date(&mut self, id: NodeId, ts: Timestamp) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            h.planning.closed = Some(ts);
            h.mark_planning_dirty();
            Ok(())
        }

        pub fn remove_closed_date(&mut self, id: NodeId) -> Result<(), DomainError> {
            let h = self.heading_mut(id)?;
            if h.planning.closed.take().is_some() {
                h.mark_planning_dirty();
            }
            Ok(())
        }

        /// Planning SCHEDULED/DEADLINE plus body timestamps (not logbook, not child headings)
        /// that carry a repeater.
        pub fn get_repeater_dates(&self, id: NodeId) -> Result<Vec<RepeaterDate>, DomainError> {
            let h = self.heading(id)?;
            let mut out = Vec::new();
            if let Some(ts) = h.planning.scheduled.as_ref().filter(|t| t.repeater.is_some()) {
                out.push(RepeaterDate {
                    slot: DateSlot::Scheduled,
                    timestamp: ts.clone(),
                });
            }
            if let Some(ts) = h.planning.deadline.as_ref().filter(|t| t.repeater.is_some()) {
                out.push(RepeaterDate {
                    slot: DateSlot::Deadline,
                    timestamp: ts.clone(),
                });
            }
            for d in self.descendants(id) {
                if self.owning_heading(d) != Some(id) {
                    continue;
                }
                let Ok(ts) = self.timestamp(d) else { continue };
                if ts.repeater.is_none() || ts.is_logbook || Some(ts.range.start.line) == h.planning_line {
                    continue;
                }
                out.push(RepeaterDate {
                    slot: DateSlot::Inline(d),
                    timestamp: ts.clone(),
                });
            }
            Ok(out)
        }

        /// Swap a timestamp node's text for `new`. Planning timestamps update the planning model.
        pub fn replace_timestamp(&mut self, node: NodeId, mut new: Timestamp) -> Result<(), DomainError> {
            let old = self.timestamp(node)?.clone();
            new.range = old.range;
            new.is_logbook = old.is_logbook;
            self.get_mut(node)?.data = NodeData::Timestamp(new.clone());

            if let Some(hid) = self.owning_heading(node) {
                let h = self.heading_mut(hid)?;
                if h.planning_line == Some(old.range.start.line) {
                    let plan = &mut h.planning;
                    let slot = [&mut plan.scheduled, &mut plan.deadline, &mut plan.closed]
                        .into_iter()
                        .find(|s| s.as_ref().map(|t| t.range) == Some(old.range));
                    if let Some(slot) = slot {
                        *slot = Some(new);
                        h.dirty.planning = true;
                        return Ok(());
                    }
                }
            }
            let r = old.range;
            self.substitute_text(r.start.line, r.start.col, r.end.col, &new.to_wrapped_string())
        }

        /// Replace character columns `start..end` of `line` with `text`, routed through
        /// whichever node re-renders that line.
        pub fn substitute_text(
            &mut self,
            line: usize,
            start: usize,
            end: usize,
            text: &str,
        ) -> Result<(), DomainError> {
            if let Some(hid) = self.heading_at_line(line) {
                let h = self.heading_mut(hid)?;
                let title_end = h.title_col + char_len(&h.title);
                if start >= h.title_col && end <= title_end {
                    h.title = splice_chars(&h.title, start - h.title_col, end - h.title_col, text);
                    h.mark_headline_dirty();
                    return Ok(());
                }
            }
            if let Some(iid) = self.list_item_at_line(line) {
                let item = self.list_item_mut(iid)?;
                if start >= item.content_col {
                    item.text =
                        splice_chars(&item.text, start - item.content_col, end - item.content_col, text);
                    item.mark_dirty();
                    return Ok(());
                }
            }
            self.line_rewrites
                .entry(line)
                .or_default()
                .push((start, end, text.to_string()));
            Ok(())
        }

        pub fn heading_at_line(&self, line: usize) -> Option<NodeId> {
            self.nodes.iter().find_map(|n| match &n.data {
                NodeData::Heading(h) if h.line == line => Some(n.id),
                _ => None,
            })
        }

        pub fn list_item_at_line(&self, line: usize) -> Option<NodeId> {
            self.nodes.iter().find_map(|n| match &n.data {
                NodeData::ListItem(item) if item.line == line => Some(n.id),
                _ => None,
            })
        }

        /* ------------------------------ List items ------------------------------ */

        pub fn set_checkbox(&mut self, id: NodeId, checkbox: Option<Checkbox>) -> Result<(), DomainError> {
            let item = self.list_item_mut(id)?;
            if item.checkbox != checkbox {
                item.checkbox = checkbox;
                item.mark_dirty();
            }
            Ok(())
        }

        pub fn set_bullet(&mut self, id: NodeId, bullet: Bullet) -> Result<(), DomainError> {
            let item = self.list_item_mut(id)?;
            if item.bullet != bullet {
                item.bullet = bullet;
                item.mark_dirty();
            }
            Ok(())
        }

        pub fn set_item_text(&mut self, id: NodeId, text: &str) -> Result<(), DomainError> {
            let item = self.list_item_mut(id)?;
            if item.text != text {
                item.text = text.to_string();
                item.mark_dirty();
            }
            Ok(())
        }

        /* ------------------------------ Siblings ------------------------------ */

        fn same_level_siblings(&self, id: NodeId) -> Option<(Vec<NodeId>, usize)> {
            let level = self.heading(id).ok()?.level;
            let parent = self.get(id).ok()?.parent?;
            let sibs: Vec<NodeId> = self
                .child_headings(parent)
                .into_iter()
                .filter(|s| self.heading(*s).map(|h| h.level) == Ok(level))
                .collect();
            let idx = sibs.iter().position(|s| *s == id)?;
            Some((sibs, idx))
        }

        pub fn get_prev_headline_same_level(&self, id: NodeId) -> Option<NodeId> {
            let (sibs, idx) = self.same_level_siblings(id)?;
            idx.checked_sub(1).map(|i| sibs[i])
        }

        pub fn get_next_headline_same_level(&self, id: NodeId) -> Option<NodeId> {
            let (sibs, idx) = self.same_level_siblings(id)?;
            sibs.get(idx + 1).copied()
        }

        /* ---------------------------- Append points ---------------------------- */

        /// First line after the planning line and meta drawers.
        fn meta_end(h: &Heading) -> usize {
            let mut end = h.line + 1;
            if let Some(p) = h.planning_line {
                end = end.max(p + 1);
            }
            for d in &h.drawers {
                end = end.max(d.end_line);
            }
            end
        }

        /// Line before the first child heading (or the end of the subtree), trailing blanks skipped.
        pub fn get_append_line(&self, id: NodeId) -> Result<usize, DomainError> {
            let node = self.get(id)?;
            let h = self.heading(id)?;
            let mut at = match self.child_headings(id).first() {
                Some(child) => self.get(*child)?.range.start.line,
                None => node.range.end_line(),
            };
            let floor = Self::meta_end(h);
            while at > floor && self.line(at - 1).trim().is_empty() {
                at -= 1;
            }
            Ok(at.max(floor))
        }

        /// Line just inside drawer `name`. A missing drawer is created after the planning
        /// line and property drawer when edits are rendered.
        pub fn get_drawer_append_line(&mut self, id: NodeId, name: &str) -> Result<usize, DomainError> {
            let h = self.heading_mut(id)?;
            h.pending_log_drawer = Some(name.to_string());
            if let Some(d) = h.drawer(name) {
                return Ok(d.start_line + 1);
            }
            let mut anchor = h.line + 1;
            if let Some(p) = h.planning_line {
                anchor = p + 1;
            }
            if let Some(props) = h.drawer("PROPERTIES") {
                anchor = anchor.max(props.end_line);
            }
            Ok(anchor + 1)
        }

        /// Queue log lines: into `drawer` (newest first) or at the append line.
        pub fn append_log(
            &mut self,
            id: NodeId,
            drawer: Option<&str>,
            lines: Vec<String>,
        ) -> Result<(), DomainError> {
            if let Some(name) = drawer {
                self.get_drawer_append_line(id, name)?;
            }
            let h = self.heading_mut(id)?;
            h.pending_log.extend(lines);
            Ok(())
        }
    }

    /* ------------------------------- Rendering ------------------------------- */

    impl Document {
        /// Edits for every dirty region, ascending by start line.
        pub fn edits(&self) -> Vec<TextEdit> {
            let mut out = Vec::new();
            for node in &self.nodes {
                match &node.data {
                    NodeData::Heading(h) if h.is_dirty() || h.pending_log_drawer.is_some() => {
                        self.heading_edits(node.id, h, &mut out)
                    }
                    NodeData::ListItem(item) if item.dirty => {
                        out.push(TextEdit::replace_line(item.line, item.render()))
                    }
                    _ => {}
                }
            }
            for (line, subs) in &self.line_rewrites {
                let covered = out
                    .iter()
                    .any(|e| e.start_line <= *line && *line < e.end_line);
                if covered {
                    tracing::trace!(line, "line rewrite superseded by a re-rendered region");
                    continue;
                }
                let mut subs = subs.clone();
                subs.sort_by(|a, b| b.0.cmp(&a.0));
                let mut text = self.line(*line).to_string();
                for (start, end, with) in subs {
                    text = splice_chars(&text, start, end, &with);
                }
                out.push(TextEdit::replace_line(*line, text));
            }
            out.sort_by_key(|e| (e.start_line, e.end_line));
            out
        }

        fn heading_edits(&self, id: NodeId, h: &Heading, out: &mut Vec<TextEdit>) {
            if h.dirty.headline {
                out.push(TextEdit::replace_line(h.line, render_headline(h)));
            } else if h.dirty.level {
                out.push(TextEdit::replace_line(h.line, restar(self.line(h.line), h.level)));
            }

            let mut pending: Vec<String> = Vec::new();
            let mut anchor = h.line + 1;

            let planning = if h.planning.is_empty() {
                vec![]
            } else {
                vec![render_planning(h)]
            };
            match h.planning_line {
                Some(l) => {
                    flush_block(out, &mut pending, anchor, l, l + 1, h.dirty.planning.then_some(planning));
                    anchor = anchor.max(l + 1);
                }
                None if h.dirty.planning => pending.extend(planning),
                None => {}
            }

            match h.drawer("PROPERTIES") {
                Some(d) => {
                    let replacement = h.dirty.properties.then(|| self.render_properties(h));
                    flush_block(out, &mut pending, anchor, d.start_line, d.end_line, replacement);
                    anchor = anchor.max(d.end_line);
                }
                None if h.dirty.properties && !h.properties.props.is_empty() => {
                    pending.extend(self.render_properties(h))
                }
                None => {}
            }

            match h.pending_log_drawer.as_deref() {
                Some(name) => match h.drawer(name) {
                    Some(d) => {
                        flush_block(out, &mut pending, anchor, d.start_line, d.end_line, None);
                        if !h.pending_log.is_empty() {
                            out.push(TextEdit::insert(d.start_line + 1, h.pending_log.clone()));
                        }
                    }
                    None => {
                        pending.push(format!(":{name}:"));
                        pending.extend(h.pending_log.iter().cloned());
                        pending.push(":END:".into());
                    }
                },
                None if !h.pending_log.is_empty() => {
                    let at = self.get_append_line(id).unwrap_or(anchor).max(anchor);
                    if at == anchor {
                        pending.extend(h.pending_log.iter().cloned());
                    } else {
                        out.push(TextEdit::insert(at, h.pending_log.clone()));
                    }
                }
                None => {}
            }

            if !pending.is_empty() {
                out.push(TextEdit::insert(anchor, pending));
            }
        }

        /// Existing drawer lines are kept verbatim unless their value changed.
        fn render_properties(&self, h: &Heading) -> Vec<String> {
            let mut out = vec![":PROPERTIES:".to_string()];
            let mut written = BTreeSet::new();
            let mut end_line = ":END:".to_string();
            if let Some(d) = h.drawer("PROPERTIES") {
                for l in d.start_line + 1..d.end_line.saturating_sub(1) {
                    let line = self.line(l);
                    match parse_property_line(line) {
                        Ok((_, (key, value))) => match h.properties.props.get(key) {
                            Some(v) if v == value.trim_end() => out.push(line.to_string()),
                            Some(v) => out.push(format!(":{key}: {v}")),
                            None => continue,
                        },
                        Err(_) => out.push(line.to_string()),
                    }
                    if let Ok((_, (key, _))) = parse_property_line(line) {
                        written.insert(key.to_string());
                    }
                }
                if d.end_line > d.start_line + 1 {
                    end_line = self.line(d.end_line - 1).to_string();
                }
            }
            for (k, v) in &h.properties.props {
                if !written.contains(k) {
                    out.push(format!(":{k}: {v}"));
                }
            }
            out.push(end_line);
            out
        }
    }

    /// Emit a block replacement, merging queued insertions that land on its first line.
    fn flush_block(
        out: &mut Vec<TextEdit>,
        pending: &mut Vec<String>,
        anchor: usize,
        start: usize,
        end: usize,
        replacement: Option<Vec<String>>,
    ) {
        match replacement {
            Some(lines) if start == anchor && !pending.is_empty() => {
                let mut merged = std::mem::take(pending);
                merged.extend(lines);
                out.push(TextEdit::replace(start, end, merged));
            }
            Some(lines) => {
                if !pending.is_empty() {
                    out.push(TextEdit::insert(anchor, std::mem::take(pending)));
                }
                out.push(TextEdit::replace(start, end, lines));
            }
            None => {
                if !pending.is_empty() {
                    out.push(TextEdit::insert(anchor, std::mem::take(pending)));
                }
            }
        }
    }

    pub(crate) fn render_headline(heading: &Heading) -> String {
        let stars = "*".repeat(heading.level as usize);
        let mut buf = stars.clone();
        buf.push(' ');
        if let Some(todo) = &heading.todo {
            buf.push_str(&todo.text);
            buf.push(' ');
        }
        if let Some(priority) = &heading.priority {
            buf.push_str(&format!("[#{}] ", priority.0));
        }
        buf.push_str(&heading.title);
        if !heading.tags.is_empty() {
            if !buf.ends_with(' ') {
                buf.push(' ');
            }
            buf.push(':');
            for tag in &heading.tags {
                buf.push_str(tag);
                buf.push(':');
            }
        }
        let trimmed = buf.trim_end();
        if trimmed == stars {
            format!("{stars} ")
        } else {
            trimmed.to_string()
        }
    }

    /// Replace the leading stars of a headline, leaving the rest untouched.
    pub(crate) fn restar(line: &str, level: u8) -> String {
        let rest = line.trim_start_matches('*');
        format!("{}{}", "*".repeat(level as usize), rest)
    }

    fn render_planning(h: &Heading) -> String {
        let plan = &h.planning;
        let mut parts = Vec::new();
        if let Some(ts) = &plan.scheduled {
            parts.push(format!("SCHEDULED: {}", ts.to_wrapped_string()));
        }
        if let Some(ts) = &plan.deadline {
            parts.push(format!("DEADLINE: {}", ts.to_wrapped_string()));
        }
        if let Some(ts) = &plan.closed {
            parts.push(format!("CLOSED: {}", ts.to_wrapped_string()));
        }
        format!("{}{}", h.planning_indent, parts.join(" "))
    }

}

pub mod navigator {
    use crate::core::*;

    impl Document {
        /// Deepest node whose range contains `pos`.
        pub fn node_at(&self, pos: Position) -> NodeId {
            let mut cur = Self::ROOT;
            'descend: loop {
                let Some(node) = self.node(cur) else { return cur };
                for child in &node.children {
                    if let Some(c) = self.node(*child) {
                        if covers(c, pos) {
                            cur = *child;
                            continue 'descend;
                        }
                    }
                }
                return cur;
            }
        }

        /// `node_at(pos)` or its nearest ancestor of `kind`.
        pub fn closest_node_of_kind(&self, pos: Position, kind: NodeKind) -> Option<NodeId> {
            let mut cur = Some(self.node_at(pos));
            while let Some(id) = cur {
                let node = self.node(id)?;
                if node.kind() == kind {
                    return Some(id);
                }
                cur = node.parent;
            }
            None
        }

        /// Sibling list items that form one list with `id`, in order.
        pub fn list_siblings(&self, id: NodeId) -> Result<Vec<NodeId>, DomainError> {
            let bullet = self.list_item(id)?.bullet;
            let Some(parent) = self.get(id)?.parent else {
                return Ok(vec![id]);
            };
            let items = self.children_of_kind(parent, NodeKind::ListItem);
            let Some(at) = items.iter().position(|i| *i == id) else {
                return Ok(vec![id]);
            };
            let joined = |a: NodeId, b: NodeId| -> bool {
                let (Ok(na), Ok(nb), Ok(ib)) = (self.get(a), self.get(b), self.list_item(b)) else {
                    return false;
                };
                ib.bullet.same_family(&bullet)
                    && (na.range.end_line()..nb.range.start_line()).all(|l| self.line(l).trim().is_empty())
            };
            let mut start = at;
            while start > 0 && joined(items[start - 1], items[start]) {
                start -= 1;
            }
            let mut end = at;
            while end + 1 < items.len() && joined(items[end], items[end + 1]) {
                end += 1;
            }
            Ok(items[start..=end].to_vec())
        }

        pub fn first_item_of_list(&self, id: NodeId) -> Result<NodeId, DomainError> {
            Ok(self.list_siblings(id)?.first().copied().unwrap_or(id))
        }

        /// Renumber the ordered list containing `from`, counting on from `from`'s number.
        /// Returns how many items changed.
        pub fn renumber_ordered_list(&mut self, from: NodeId) -> Result<usize, DomainError> {
            let Bullet::Ordered { number, delimiter } = self.list_item(from)?.bullet else {
                return Ok(0);
            };
            let siblings = self.list_siblings(from)?;
            let Some(at) = siblings.iter().position(|s| *s == from) else {
                return Ok(0);
            };
            let mut changed = 0;
            for (offset, id) in siblings[at..].iter().enumerate() {
                let Some(number) = u32::try_from(offset).ok().and_then(|o| number.checked_add(o)) else {
                    break;
                };
                let expected = Bullet::Ordered { number, delimiter };
                if self.list_item(*id)?.bullet != expected {
                    self.set_bullet(*id, expected)?;
                    changed += 1;
                }
            }
            Ok(changed)
        }
    }

    /// Inline nodes are matched by column; structural nodes by line.
    fn covers(node: &Node, pos: Position) -> bool {
        match node.kind() {
            NodeKind::Timestamp | NodeKind::Link => node.range.contains(pos),
            _ => node.range.start_line() <= pos.line && pos.line < node.range.end_line(),
        }
    }

}

pub mod links {
    //! Link target classification and resolution against a headline index.

    use crate::core::*;
    use serde::Serialize;
    use serde_with::skip_serializing_none;

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum LinkTarget {
        FilePlain { path: String },
        FileWithLine { path: String, line: usize },
        /// `file:x.org::*Heading` or a bare in-document search.
        InternalSearch { file: Option<String>, query: String },
        InternalId { id: String },
        Http { url: String },
        Custom { scheme: String, rest: String },
    }

    pub fn classify(target: &str) -> LinkTarget {
        let target = target.trim();
        if let Some(id) = target.strip_prefix("id:") {
            return LinkTarget::InternalId { id: id.trim().to_string() };
        }
        if target.starts_with("http://") || target.starts_with("https://") {
            return LinkTarget::Http { url: target.to_string() };
        }
        let file = target.strip_prefix("file:");
        let looks_like_path = file.is_some()
            || target.starts_with('/')
            || target.starts_with("./")
            || target.starts_with("../")
            || target.starts_with("~/");
        if looks_like_path {
            let body = file.unwrap_or(target);
            return match body.split_once("::") {
                Some((path, search)) => match search.trim().parse::<usize>() {
                    Ok(line) => LinkTarget::FileWithLine { path: path.to_string(), line },
                    Err(_) => LinkTarget::InternalSearch {
                        file: Some(path.to_string()),
                        query: search.to_string(),
                    },
                },
                None => LinkTarget::FilePlain { path: body.to_string() },
            };
        }
        if let Some((scheme, rest)) = target.split_once(':') {
            let is_scheme = !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-');
            if is_scheme && !target.starts_with('*') && !target.starts_with('#') {
                return LinkTarget::Custom {
                    scheme: scheme.to_string(),
                    rest: rest.to_string(),
                };
            }
        }
        LinkTarget::InternalSearch {
            file: None,
            query: target.to_string(),
        }
    }

    /// Enough of a headline to jump to it.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct HeadlineRef {
        pub line: usize,
        pub level: u8,
        pub title: String,
    }

    /// Lookup surface over a set of headlines.
    pub trait HeadlineIndex {
        fn find_by_id(&self, id: &str) -> Vec<HeadlineRef>;
        fn find_by_property_match(&self, key: &str, value: &str) -> Vec<HeadlineRef>;
        /// `*Exact title`, `#custom-id` or title substring.
        fn find_matching(&self, query: &str) -> Vec<HeadlineRef>;
    }

    /// Index over the headings of one parsed document.
    pub struct DocumentIndex<'a> {
        doc: &'a Document,
    }

    impl<'a> DocumentIndex<'a> {
        pub fn new(doc: &'a Document) -> Self {
            Self { doc }
        }

        fn collect(&self, pred: impl Fn(&Heading) -> bool) -> Vec<HeadlineRef> {
            self.doc
                .headings()
                .filter_map(|id| self.doc.heading(id).ok())
                .filter(|h| pred(h))
                .map(|h| HeadlineRef {
                    line: h.line,
                    level: h.level,
                    title: h.title.clone(),
                })
                .collect()
        }
    }

    impl HeadlineIndex for DocumentIndex<'_> {
        fn find_by_id(&self, id: &str) -> Vec<HeadlineRef> {
            self.find_by_property_match("ID", id)
        }

        fn find_by_property_match(&self, key: &str, value: &str) -> Vec<HeadlineRef> {
            self.collect(|h| h.property(key) == Some(value))
        }

        fn find_matching(&self, query: &str) -> Vec<HeadlineRef> {
            if let Some(title) = query.strip_prefix('*') {
                let title = title.trim();
                return self.collect(|h| h.title.trim().eq_ignore_ascii_case(title));
            }
            if let Some(custom) = query.strip_prefix('#') {
                return self.find_by_property_match("CUSTOM_ID", custom.trim());
            }
            let needle = query.trim().to_lowercase();
            if needle.is_empty() {
                return vec![];
            }
            self.collect(|h| h.title.to_lowercase().contains(&needle))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "status", rename_all = "snake_case")]
    pub enum LinkResolution {
        NotFound,
        Resolved { headline: HeadlineRef },
        Ambiguous { candidates: Vec<HeadlineRef> },
        /// Not resolvable in-document; the host opens it.
        External { target: LinkTarget },
    }

    /// Resolve `target`; a search never lands on the headline at `exclude_line`.
    pub fn resolve(target: &str, index: &dyn HeadlineIndex, exclude_line: Option<usize>) -> LinkResolution {
        let classified = classify(target);
        let candidates = match &classified {
            LinkTarget::InternalId { id } => index.find_by_id(id),
            LinkTarget::InternalSearch { file: None, query } => index
                .find_matching(query)
                .into_iter()
                .filter(|h| Some(h.line) != exclude_line)
                .collect(),
            _ => return LinkResolution::External { target: classified },
        };
        let mut candidates = candidates;
        match candidates.len() {
            0 => LinkResolution::NotFound,
            1 => LinkResolution::Resolved {
                headline: candidates.remove(0),
            },
            _ => LinkResolution::Ambiguous { candidates },
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::EditorConfig;
        use crate::parser::parse_document;

        #[test]
        fn classify_variants() {
            assert_eq!(classify("https://x.org"), LinkTarget::Http { url: "https://x.org".into() });
            assert_eq!(
                classify("./notes.org::5"),
                LinkTarget::FileWithLine { path: "./notes.org".into(), line: 5 }
            );
            assert_eq!(classify("file:/a/b.org"), LinkTarget::FilePlain { path: "/a/b.org".into() });
            assert_eq!(
                classify("file:b.org::*Intro"),
                LinkTarget::InternalSearch { file: Some("b.org".into()), query: "*Intro".into() }
            );
            assert_eq!(classify("id:ABC123"), LinkTarget::InternalId { id: "ABC123".into() });
            assert_eq!(
                classify("*Some heading"),
                LinkTarget::InternalSearch { file: None, query: "*Some heading".into() }
            );
            assert_eq!(
                classify("mailto:me@x.org"),
                LinkTarget::Custom { scheme: "mailto".into(), rest: "me@x.org".into() }
            );
        }

        const TEXT: &str = "* Project alpha
:PROPERTIES:
:ID: A1
:CUSTOM_ID: alpha
:END:
* Project beta
* Notes on alpha
";

        #[test]
        fn resolves_by_id_title_and_search() {
            let doc = parse_document(TEXT, &EditorConfig::default()).unwrap();
            let idx = DocumentIndex::new(&doc);
            match resolve("id:A1", &idx, None) {
                LinkResolution::Resolved { headline } => assert_eq!(headline.line, 0),
                other => panic!("unexpected {other:?}"),
            }
            match resolve("#alpha", &idx, None) {
                LinkResolution::Resolved { headline } => assert_eq!(headline.title, "Project alpha"),
                other => panic!("unexpected {other:?}"),
            }
            match resolve("*project BETA", &idx, None) {
                LinkResolution::Resolved { headline } => assert_eq!(headline.line, 5),
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(resolve("alpha", &idx, None), LinkResolution::Ambiguous { .. }));
            assert!(matches!(resolve("alpha", &idx, Some(0)), LinkResolution::Resolved { .. }));
            assert_eq!(resolve("gamma", &idx, None), LinkResolution::NotFound);
            assert!(matches!(resolve("https://x", &idx, None), LinkResolution::External { .. }));
        }
    }
}

pub mod events {
    use crate::core::*;
    use serde::Serialize;
    use serde_with::skip_serializing_none;

    /// Headline state at the moment an event fired.
    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct HeadingSnapshot {
        pub line: usize,
        pub level: u8,
        pub todo: Option<String>,
        pub priority: Option<char>,
        pub title: String,
        pub tags: Vec<String>,
    }

    impl HeadingSnapshot {
        pub fn capture(doc: &Document, id: NodeId) -> Result<Self, DomainError> {
            let h = doc.heading(id)?;
            Ok(Self {
                line: h.line,
                level: h.level,
                todo: h.todo.as_ref().map(|t| t.text.clone()),
                priority: h.priority.map(|p| p.0),
                title: h.title.clone(),
                tags: h.tags.clone(),
            })
        }
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(tag = "event", rename_all = "snake_case")]
    pub enum OutlineEvent {
        TodoChanged {
            old_node: HeadingSnapshot,
            new_node: HeadingSnapshot,
            old_state: Option<String>,
            was_done: bool,
        },
        HeadlinePromoted {
            old_node: HeadingSnapshot,
            new_node: HeadingSnapshot,
            old_level: u8,
        },
        HeadlineDemoted {
            old_node: HeadingSnapshot,
            new_node: HeadingSnapshot,
            old_level: u8,
        },
    }

    type Listener = Box<dyn FnMut(&OutlineEvent)>;

    /// Fire-and-forget fan-out to host listeners, in emission order.
    #[derive(Default)]
    pub struct EventBus {
        listeners: Vec<Listener>,
    }

    impl EventBus {
        pub fn subscribe(&mut self, listener: impl FnMut(&OutlineEvent) + 'static) {
            self.listeners.push(Box::new(listener));
        }

        pub fn emit(&mut self, event: &OutlineEvent) {
            for listener in &mut self.listeners {
                listener(event);
            }
        }
    }

    impl std::fmt::Debug for EventBus {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EventBus")
                .field("listeners", &self.listeners.len())
                .finish()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::EditorConfig;
        use crate::parser::parse_document;
        use std::{cell::RefCell, rc::Rc};

        #[test]
        fn listeners_see_events_in_order() {
            let doc = parse_document("* TODO [#B] Task :x:\n", &EditorConfig::default()).unwrap();
            let id = doc.headings().next().unwrap();
            let snap = HeadingSnapshot::capture(&doc, id).unwrap();
            assert_eq!(snap.todo.as_deref(), Some("TODO"));
            assert_eq!(snap.priority, Some('B'));

            let seen = Rc::new(RefCell::new(Vec::new()));
            let mut bus = EventBus::default();
            let sink = Rc::clone(&seen);
            bus.subscribe(move |e| sink.borrow_mut().push(e.clone()));
            let promoted = OutlineEvent::HeadlinePromoted {
                old_node: snap.clone(),
                new_node: snap.clone(),
                old_level: 2,
            };
            let changed = OutlineEvent::TodoChanged {
                old_node: snap.clone(),
                new_node: snap,
                old_state: Some("TODO".into()),
                was_done: false,
            };
            bus.emit(&promoted);
            bus.emit(&changed);
            assert_eq!(*seen.borrow(), vec![promoted, changed]);
        }

        #[test]
        fn snapshot_serializes_without_empty_options() {
            let doc = parse_document("* Plain\n", &EditorConfig::default()).unwrap();
            let id = doc.headings().next().unwrap();
            let json = serde_json::to_value(HeadingSnapshot::capture(&doc, id).unwrap()).unwrap();
            assert!(json.get("todo").is_none());
            assert_eq!(json["title"], "Plain");
        }
    }
}

pub mod session {
    //! Edit orchestration over a live buffer.
    //!
    //! Every operation works on a clone of the current document, renders the dirty
    //! regions to line edits, applies them to the buffer and re-parses. Operations that
    //! need host input return a [`HostRequest`]; the answer comes back through
    //! [`Session::respond`].

    use crate::config::{EditorConfig, LogPolicy};
    use crate::core::*;
    use crate::events::{EventBus, HeadingSnapshot, OutlineEvent};
    use crate::links::{self, DocumentIndex, HeadlineIndex, HeadlineRef, LinkResolution};
    use crate::outline::{DateSlot, RepeaterDate};
    use crate::parser::{NomOutlineParser, OutlineParser, split_lines};
    use crate::states::{PriorityState, TodoState, Transition};
    use crate::timestamp::{DateField, Delta, RangeHalf, Timestamp, locate_field};
    use chrono::{Local, NaiveDateTime};
    use serde::Serialize;
    use serde_with::skip_serializing_none;
    use std::path::{Path, PathBuf};
    use tracing::{debug, warn};

    /* ------------------------------ Clock ------------------------------ */

    pub trait Clock {
        fn now(&self) -> NaiveDateTime;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> NaiveDateTime {
            Local::now().naive_local()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct FixedClock(pub NaiveDateTime);

    impl Clock for FixedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    /* ------------------------------ Buffer ------------------------------ */

    /// Live text, one entry per line. `version` bumps once per applied batch.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Buffer {
        pub lines: Vec<String>,
        pub trailing_newline: bool,
        pub version: u64,
    }

    impl Buffer {
        pub fn from_text(text: &str) -> Self {
            Self {
                lines: split_lines(text),
                trailing_newline: text.ends_with('\n'),
                version: 0,
            }
        }

        pub fn text(&self) -> String {
            let mut out = self.lines.join("\n");
            if self.trailing_newline && !self.lines.is_empty() {
                out.push('\n');
            }
            out
        }

        /// Edits address pre-batch line numbers; they are applied bottom-up. At equal
        /// positions earlier edits end up above later ones.
        pub fn apply(&mut self, edits: &[TextEdit]) {
            if edits.is_empty() {
                return;
            }
            let mut plan: Vec<&TextEdit> = edits.iter().collect();
            plan.sort_by_key(|e| (e.start_line, e.end_line));
            for edit in plan.into_iter().rev() {
                let len = self.lines.len();
                let start = edit.start_line.min(len);
                let end = edit.end_line.clamp(start, len);
                self.lines.splice(start..end, edit.lines.iter().cloned());
            }
            self.version += 1;
        }
    }

    /* ------------------------------ Outcomes ------------------------------ */

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct Applied {
        pub edits: Vec<TextEdit>,
        pub events: Vec<OutlineEvent>,
        pub cursor: Option<Position>,
        /// Input still wanted after the edits above were committed (e.g. a closing note).
        pub followup: Option<HostRequest>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct ArchivedSubtree {
        /// Subtree text re-based to level 1, archive properties added.
        pub text: String,
        pub target_file: String,
        /// Edits that removed the subtree from this buffer.
        pub edits: Vec<TextEdit>,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
    pub enum Outcome {
        Applied(Applied),
        /// Nothing to change.
        NoOp,
        /// Not ours to handle; the host runs its default action.
        PassThrough,
        Warning(String),
        Request(HostRequest),
        Resolved(LinkResolution),
        Archived(ArchivedSubtree),
    }

    #[skip_serializing_none]
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub struct HostRequest {
        pub prompt: String,
        pub default: Option<String>,
        pub completions: Vec<String>,
        pub kind: RequestKind,
        /// Buffer version the request was issued against.
        pub version: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    pub enum RequestKind {
        ClosingNote { heading_line: usize, header: String },
        FastAccess { heading_line: usize },
        Tags { heading_line: usize },
        LinkTarget { pos: Position },
        LinkDescription { pos: Position, target: String },
        SelectHeadline { candidates: Vec<HeadlineRef> },
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum CycleDirection {
        Next,
        Prev,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EditError {
        #[error("document version {document} is stale (buffer is at {buffer}); refresh first")]
        StaleDocument { document: u64, buffer: u64 },
        #[error("response does not fit the outstanding request")]
        UnexpectedResponse,
        #[error(transparent)]
        Domain(#[from] DomainError),
        #[error("re-parse failed: {0}")]
        Parse(String),
    }

    /* ------------------------------ Session ------------------------------ */

    pub struct Session {
        config: EditorConfig,
        parser: Box<dyn OutlineParser>,
        clock: Box<dyn Clock>,
        buffer: Buffer,
        document: Document,
        events: EventBus,
        path: Option<PathBuf>,
    }

    impl Session {
        pub fn new(text: &str, config: EditorConfig) -> Result<Self, EditError> {
            let parser = NomOutlineParser::new(config.clone());
            let buffer = Buffer::from_text(text);
            let document = parser
                .parse_text(None, &buffer.text(), buffer.version)
                .map_err(|e| EditError::Parse(format!("{e:#}")))?;
            Ok(Self {
                config,
                parser: Box::new(parser),
                clock: Box::new(SystemClock),
                buffer,
                document,
                events: EventBus::default(),
                path: None,
            })
        }

        pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
            self.clock = Box::new(clock);
            self
        }

        pub fn with_path(mut self, path: impl Into<PathBuf>) -> Result<Self, EditError> {
            self.path = Some(path.into());
            self.refresh()?;
            Ok(self)
        }

        pub fn with_parser(mut self, parser: impl OutlineParser + 'static) -> Result<Self, EditError> {
            self.parser = Box::new(parser);
            self.refresh()?;
            Ok(self)
        }

        pub fn subscribe(&mut self, listener: impl FnMut(&OutlineEvent) + 'static) {
            self.events.subscribe(listener);
        }

        pub fn config(&self) -> &EditorConfig {
            &self.config
        }

        pub fn path(&self) -> Option<&Path> {
            self.path.as_deref()
        }

        pub fn text(&self) -> String {
            self.buffer.text()
        }

        pub fn buffer(&self) -> &Buffer {
            &self.buffer
        }

        /// The parsed tree, only while it matches the buffer.
        pub fn document(&self) -> Result<&Document, EditError> {
            if self.document.version != self.buffer.version {
                return Err(EditError::StaleDocument {
                    document: self.document.version,
                    buffer: self.buffer.version,
                });
            }
            Ok(&self.document)
        }

        pub fn refresh(&mut self) -> Result<(), EditError> {
            self.document = self
                .parser
                .parse_text(self.path.as_deref(), &self.buffer.text(), self.buffer.version)
                .map_err(|e| EditError::Parse(format!("{e:#}")))?;
            Ok(())
        }

        /// Host-side edits; the document stays stale until [`Session::refresh`].
        pub fn apply_host_edits(&mut self, edits: &[TextEdit]) {
            self.buffer.apply(edits);
        }

        fn heading_at(&self, pos: Position) -> Result<Option<NodeId>, EditError> {
            Ok(self.document()?.closest_node_of_kind(pos, NodeKind::Heading))
        }

        fn commit(&mut self, op: &'static str, mut edits: Vec<TextEdit>) -> Result<Vec<TextEdit>, EditError> {
            if edits.is_empty() {
                debug!(op, "nothing to apply");
                return Ok(edits);
            }
            edits.sort_by_key(|e| (e.start_line, e.end_line));
            self.buffer.apply(&edits);
            self.refresh()?;
            debug!(op, edits = edits.len(), version = self.buffer.version, "applied");
            Ok(edits)
        }

        fn finish(
            &mut self,
            op: &'static str,
            edits: Vec<TextEdit>,
            events: Vec<OutlineEvent>,
            cursor: Option<Position>,
            followup: Option<HostRequest>,
        ) -> Result<Outcome, EditError> {
            let edits = self.commit(op, edits)?;
            if edits.is_empty() && followup.is_none() {
                return Ok(Outcome::NoOp);
            }
            for event in &events {
                self.events.emit(event);
            }
            let version = self.buffer.version;
            let followup = followup.map(|r| HostRequest { version, ..r });
            Ok(Outcome::Applied(Applied {
                edits,
                events,
                cursor,
                followup,
            }))
        }

        fn request(&self, prompt: &str, default: Option<String>, completions: Vec<String>, kind: RequestKind) -> Outcome {
            Outcome::Request(HostRequest {
                prompt: prompt.to_string(),
                default,
                completions,
                kind,
                version: self.buffer.version,
            })
        }

        fn now_stamp(&self) -> Timestamp {
            Timestamp::from_datetime(self.clock.now(), false)
        }

        /* ------------------------------ TODO state ------------------------------ */

        pub fn cycle_todo(&mut self, pos: Position, direction: CycleDirection) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let doc = self.document()?;
            let current = doc.heading(hid)?.todo.as_ref().map(|t| t.text.clone());
            let state = TodoState::new(&doc.keywords, current.as_deref());
            let next = match direction {
                CycleDirection::Next => state.get_next(),
                CycleDirection::Prev => state.get_prev(),
            };
            let keyword = next.keyword();
            self.transition_todo(hid, keyword)
        }

        /// Prompt for a fast-access key when shortcuts exist, otherwise cycle forward.
        pub fn set_todo_fast(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let doc = self.document()?;
            if !doc.keywords.has_fast_access() {
                return self.cycle_todo(pos, CycleDirection::Next);
            }
            let completions = doc
                .keywords
                .keywords
                .iter()
                .filter_map(|k| k.shortcut.map(|c| format!("{c} {}", k.text)))
                .collect();
            let heading_line = doc.heading(hid)?.line;
            Ok(self.request("TODO state:", None, completions, RequestKind::FastAccess { heading_line }))
        }

        /// Move the heading to `to`, running closing and repeater bookkeeping.
        pub fn transition_todo(&mut self, hid: NodeId, to: Option<TodoKeyword>) -> Result<Outcome, EditError> {
            let now = self.clock.now();
            let stamp = self.now_stamp();
            let mut draft = self.document()?.clone();
            let from = draft.heading(hid)?.todo.clone();
            let transition = Transition {
                from: from.clone(),
                to: to.clone(),
            };
            if !transition.changed() {
                return Ok(Outcome::NoOp);
            }
            let old_node = HeadingSnapshot::capture(&draft, hid)?;
            let heading_line = old_node.line;
            draft.set_todo(hid, to.clone())?;

            let drawer = self.config.log_into_drawer.clone();
            let mut followup = None;
            let repeaters = draft.get_repeater_dates(hid)?;
            if transition.entered_done() && !repeaters.is_empty() {
                for RepeaterDate { slot, timestamp } in repeaters {
                    let next = timestamp.apply_repeater(now);
                    match slot {
                        DateSlot::Scheduled => draft.set_scheduled_date(hid, next)?,
                        DateSlot::Deadline => draft.set_deadline_date(hid, next)?,
                        DateSlot::Inline(node) => draft.replace_timestamp(node, next)?,
                    }
                }
                let reset = TodoState::new(&draft.keywords, None).get_todo().keyword();
                draft.set_todo(hid, reset)?;
                if self.config.log_repeat.is_on() {
                    draft.set_property(hid, "LAST_REPEAT", &stamp.to_wrapped_string())?;
                    let header = state_change_line(to.as_ref(), from.as_ref(), &stamp);
                    draft.append_log(hid, drawer.as_deref(), vec![header.clone()])?;
                    if self.config.log_repeat == LogPolicy::Note {
                        followup = Some(note_request(heading_line, header));
                    }
                }
            } else if transition.entered_done() && self.config.log_done.is_on() {
                draft.set_closed_date(hid, stamp.clone())?;
                if self.config.log_done == LogPolicy::Note {
                    followup = Some(note_request(heading_line, format!("- CLOSING NOTE {stamp}")));
                }
            } else if transition.left_done() && self.config.log_done.is_on() {
                draft.remove_closed_date(hid)?;
            }

            let event = OutlineEvent::TodoChanged {
                old_node,
                new_node: HeadingSnapshot::capture(&draft, hid)?,
                old_state: from.map(|k| k.text),
                was_done: transition.was_done(),
            };
            let edits = draft.edits();
            self.finish("todo", edits, vec![event], None, followup)
        }

        /* ------------------------------ Structure ------------------------------ */

        pub fn promote(&mut self, pos: Position, count: u8, whole_subtree: bool) -> Result<Outcome, EditError> {
            self.shift(pos, count, whole_subtree, true)
        }

        pub fn demote(&mut self, pos: Position, count: u8, whole_subtree: bool) -> Result<Outcome, EditError> {
            self.shift(pos, count, whole_subtree, false)
        }

        fn shift(&mut self, pos: Position, count: u8, whole_subtree: bool, up: bool) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let mut draft = self.document()?.clone();
            let old_node = HeadingSnapshot::capture(&draft, hid)?;
            let shifted = if up {
                draft.promote(hid, count, whole_subtree)
            } else {
                draft.demote(hid, count, whole_subtree)
            };
            match shifted {
                Ok(true) => {}
                Ok(false) if count == 0 => return Ok(Outcome::NoOp),
                Ok(false) | Err(DomainError::InvalidLevel(_)) => {
                    warn!(line = old_node.line, level = old_node.level, count, "level change out of bounds");
                    let msg = if up {
                        "Cannot promote to level 0"
                    } else {
                        "Cannot demote beyond the deepest level"
                    };
                    return Ok(Outcome::Warning(msg.into()));
                }
                Err(e) => return Err(e.into()),
            }
            let old_level = old_node.level;
            let new_node = HeadingSnapshot::capture(&draft, hid)?;
            let event = if up {
                OutlineEvent::HeadlinePromoted {
                    old_node,
                    new_node,
                    old_level,
                }
            } else {
                OutlineEvent::HeadlineDemoted {
                    old_node,
                    new_node,
                    old_level,
                }
            };
            let op = if up { "promote" } else { "demote" };
            let edits = draft.edits();
            self.finish(op, edits, vec![event], Some(pos), None)
        }

        pub fn move_subtree_up(&mut self, pos: Position) -> Result<Outcome, EditError> {
            self.move_subtree(pos, true)
        }

        pub fn move_subtree_down(&mut self, pos: Position) -> Result<Outcome, EditError> {
            self.move_subtree(pos, false)
        }

        fn move_subtree(&mut self, pos: Position, up: bool) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let doc = self.document()?;
            let other = if up {
                doc.get_prev_headline_same_level(hid)
            } else {
                doc.get_next_headline_same_level(hid)
            };
            let Some(other) = other else {
                warn!(line = pos.line, up, "no sibling to swap with");
                return Ok(Outcome::Warning(
                    "Cannot move past superior level or buffer limit".into(),
                ));
            };
            let (first, second) = if up { (other, hid) } else { (hid, other) };
            let (a0, a1) = (doc.get(first)?.range.start_line(), doc.get(first)?.range.end_line());
            let (b0, b1) = (doc.get(second)?.range.start_line(), doc.get(second)?.range.end_line());
            let slice = |from: usize, to: usize| doc.lines[from..to].iter().cloned();
            let lines: Vec<String> = slice(b0, b1).chain(slice(a1, b0)).chain(slice(a0, a1)).collect();
            let cursor_line = if up {
                a0 + (pos.line - b0)
            } else {
                pos.line + (b1 - a1)
            };
            let edits = vec![TextEdit::replace(a0, b1, lines)];
            let op = if up { "move_subtree_up" } else { "move_subtree_down" };
            self.finish(op, edits, vec![], Some(Position::new(cursor_line, pos.col)), None)
        }

        /// New heading at the enclosing heading's level, after its subtree.
        pub fn insert_heading(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let doc = self.document()?;
            let (level, at, preceded_by_blank) = match doc.closest_node_of_kind(pos, NodeKind::Heading) {
                Some(hid) => {
                    let h = doc.heading(hid)?;
                    let blank = h.line > 0 && doc.line(h.line - 1).trim().is_empty();
                    (h.level, doc.get(hid)?.range.end_line(), blank)
                }
                None => (1, (pos.line + 1).min(doc.lines.len()), false),
            };
            let mut lines = Vec::new();
            let already_blank = at > 0 && doc.line(at - 1).trim().is_empty();
            if self.config.blank_before_new_entry.heading && preceded_by_blank && !already_blank {
                lines.push(String::new());
            }
            lines.push(format!("{} ", "*".repeat(level as usize)));
            let cursor = Position::new(at + lines.len() - 1, level as usize + 1);
            self.finish("insert_heading", vec![TextEdit::insert(at, lines)], vec![], Some(cursor), None)
        }

        /// Continue the enclosing list item, or start a new heading.
        pub fn handle_return(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let doc = self.document()?;
            if let Some(iid) = doc.closest_node_of_kind(pos, NodeKind::ListItem) {
                return self.insert_list_item(iid);
            }
            if doc.closest_node_of_kind(pos, NodeKind::Heading).is_some() {
                return self.insert_heading(pos);
            }
            Ok(Outcome::PassThrough)
        }

        fn insert_list_item(&mut self, iid: NodeId) -> Result<Outcome, EditError> {
            let mut draft = self.document()?.clone();
            let item = draft.list_item(iid)?.clone();
            let at = draft.get(iid)?.range.end_line();
            let bullet = match item.bullet {
                Bullet::Ordered { number, delimiter } => match number.checked_add(1) {
                    Some(number) => Bullet::Ordered { number, delimiter },
                    None => return Ok(ordered_overflow(number)),
                },
                unordered => unordered,
            };
            let fresh = ListItem {
                indent: item.indent.clone(),
                bullet,
                checkbox: item.checkbox.map(|_| Checkbox::Empty),
                text: String::new(),
                line: at,
                content_col: 0,
                dirty: false,
            };
            let rendered = fresh.render();

            if let Bullet::Ordered { number, delimiter } = bullet {
                let siblings = draft.list_siblings(iid)?;
                let following = siblings
                    .iter()
                    .position(|s| *s == iid)
                    .and_then(|i| siblings.get(i + 1))
                    .copied();
                if let Some(next) = following {
                    let Some(number) = number.checked_add(1) else {
                        return Ok(ordered_overflow(number));
                    };
                    draft.set_bullet(next, Bullet::Ordered { number, delimiter })?;
                    draft.renumber_ordered_list(next)?;
                }
            }

            let mut lines = Vec::new();
            if self.config.blank_before_new_entry.plain_list_item {
                lines.push(String::new());
            }
            lines.push(rendered.clone());
            let cursor = Position::new(at + lines.len() - 1, char_len(&rendered));
            let mut edits = draft.edits();
            edits.push(TextEdit::insert(at, lines));
            self.finish("insert_list_item", edits, vec![], Some(cursor), None)
        }

        /// Remove the enclosing subtree and hand back its archived rendition.
        pub fn archive_subtree(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let stamp = self.now_stamp();
            let doc = self.document()?;
            let h = doc.heading(hid)?;
            let range = doc.get(hid)?.range;
            let (start, end) = (range.start_line(), range.end_line().min(doc.lines.len()));
            let subtree_text = format!("{}\n", doc.lines[start..end].join("\n"));

            // The subtree alone lacks the file's `#+TODO:`/`#+PRIORITIES:` lines.
            let mut sub_config = self.config.clone();
            if !doc.settings.todo_sequences.is_empty() {
                sub_config.todo_keywords = doc.settings.todo_sequences.clone();
            }
            sub_config.priorities = self.config.priorities_for(&doc.settings);
            let mut sub = NomOutlineParser::new(sub_config)
                .parse_text(None, &subtree_text, 0)
                .map_err(|e| EditError::Parse(format!("{e:#}")))?;
            let Some(root) = sub.headings().next() else {
                return Ok(Outcome::NoOp);
            };
            sub.set_property(root, "ARCHIVE_TIME", &stamp.to_wrapped_string())?;
            if let Some(path) = &self.path {
                sub.set_property(root, "ARCHIVE_FILE", &path.display().to_string())?;
            }
            let olpath = doc.outline_path(hid).join("/");
            if !olpath.is_empty() {
                sub.set_property(root, "ARCHIVE_OLPATH", &olpath)?;
            }
            if let Some(stem) = self.path.as_deref().and_then(Path::file_stem) {
                sub.set_property(root, "ARCHIVE_CATEGORY", &stem.to_string_lossy())?;
            }
            if let Some(todo) = &h.todo {
                sub.set_property(root, "ARCHIVE_TODO", &todo.text)?;
            }
            if h.level > 1 {
                sub.promote(root, h.level - 1, true)?;
            }
            let mut archived = Buffer::from_text(&subtree_text);
            archived.apply(&sub.edits());
            let target_file = self.config.archive_target(self.path.as_deref());

            let edits = self.commit("archive_subtree", vec![TextEdit::delete(start, end)])?;
            debug!(archive = %target_file, "archived subtree");
            Ok(Outcome::Archived(ArchivedSubtree {
                text: archived.text(),
                target_file,
                edits,
            }))
        }

        /* ------------------------------ Checkboxes ------------------------------ */

        /// Flip the item's checkbox, then update parent boxes and `[n/m]` cookies.
        pub fn toggle_checkbox(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let doc = self.document()?;
            let Some(iid) = doc.closest_node_of_kind(pos, NodeKind::ListItem) else {
                return Ok(Outcome::PassThrough);
            };
            let Some(current) = doc.list_item(iid)?.checkbox else {
                return Ok(Outcome::NoOp);
            };
            let mut draft = doc.clone();
            let flipped = match current {
                Checkbox::Checked => Checkbox::Empty,
                Checkbox::Empty | Checkbox::Partial => Checkbox::Checked,
            };
            draft.set_checkbox(iid, Some(flipped))?;

            let mut cur = draft.get(iid)?.parent;
            while let Some(parent) = cur {
                let node = draft.get(parent)?;
                let next = node.parent;
                match node.kind() {
                    NodeKind::ListItem => {
                        let (done, partial, total) = checkbox_stats(&draft, parent);
                        let item = draft.list_item(parent)?;
                        if item.checkbox.is_some() && total > 0 {
                            let state = if done == total {
                                Checkbox::Checked
                            } else if done == 0 && partial == 0 {
                                Checkbox::Empty
                            } else {
                                Checkbox::Partial
                            };
                            draft.set_checkbox(parent, Some(state))?;
                        }
                        if let Some(text) = update_cookies(&draft.list_item(parent)?.text, done, total) {
                            draft.set_item_text(parent, &text)?;
                        }
                        cur = next;
                    }
                    NodeKind::Heading => {
                        let (done, _, total) = checkbox_stats(&draft, parent);
                        if let Some(title) = update_cookies(&draft.heading(parent)?.title, done, total) {
                            draft.set_title(parent, &title)?;
                        }
                        break;
                    }
                    _ => break,
                }
            }
            let edits = draft.edits();
            self.finish("toggle_checkbox", edits, vec![], Some(pos), None)
        }

        /* ------------------------------ Properties ------------------------------ */

        /// The heading's `ID`, created as a fresh UUID when missing.
        pub fn ensure_heading_id(&mut self, pos: Position) -> Result<Option<(String, Outcome)>, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(None);
            };
            let doc = self.document()?;
            if let Some(id) = doc.heading(hid)?.property("ID") {
                return Ok(Some((id.to_string(), Outcome::NoOp)));
            }
            let id = uuid::Uuid::new_v4().to_string();
            let mut draft = doc.clone();
            draft.set_property(hid, "ID", &id)?;
            let edits = draft.edits();
            let outcome = self.finish("ensure_heading_id", edits, vec![], None, None)?;
            Ok(Some((id, outcome)))
        }

        pub fn priority_up(&mut self, pos: Position) -> Result<Outcome, EditError> {
            self.step_priority(pos, true)
        }

        pub fn priority_down(&mut self, pos: Position) -> Result<Outcome, EditError> {
            self.step_priority(pos, false)
        }

        fn step_priority(&mut self, pos: Position, up: bool) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let mut draft = self.document()?.clone();
            let state = PriorityState::new(draft.priorities, draft.heading(hid)?.priority);
            let next = if up { state.increase() } else { state.decrease() };
            if next == state {
                return Ok(Outcome::NoOp);
            }
            draft.set_priority(hid, next.current())?;
            let edits = draft.edits();
            self.finish("priority", edits, vec![], Some(pos), None)
        }

        /* ------------------------------ Prompts ------------------------------ */

        pub fn set_tags(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let Some(hid) = self.heading_at(pos)? else {
                return Ok(Outcome::PassThrough);
            };
            let doc = self.document()?;
            let h = doc.heading(hid)?;
            let default = (!h.tags.is_empty()).then(|| format!(":{}:", h.tags.join(":")));
            let mut known: Vec<String> = doc
                .headings()
                .filter_map(|id| doc.heading(id).ok())
                .flat_map(|h| h.tags.iter().cloned())
                .collect();
            known.sort();
            known.dedup();
            let heading_line = h.line;
            Ok(self.request("Tags:", default, known, RequestKind::Tags { heading_line }))
        }

        pub fn insert_link(&mut self, pos: Position) -> Result<Outcome, EditError> {
            let doc = self.document()?;
            if pos.line >= doc.lines.len() {
                return Ok(Outcome::PassThrough);
            }
            let mut targets = Vec::new();
            for id in doc.headings() {
                let h = doc.heading(id)?;
                targets.push(format!("*{}", h.title.trim()));
                if let Some(custom) = h.property("CUSTOM_ID") {
                    targets.push(format!("#{custom}"));
                }
            }
            Ok(self.request("Links:", None, targets, RequestKind::LinkTarget { pos }))
        }

        /// Resolve the link under the cursor against `index`.
        pub fn open_link(&self, pos: Position, index: &dyn HeadlineIndex) -> Result<Outcome, EditError> {
            let doc = self.document()?;
            let Some(lid) = doc.closest_node_of_kind(pos, NodeKind::Link) else {
                return Ok(Outcome::PassThrough);
            };
            let NodeData::Link(link) = &doc.get(lid)?.data else {
                return Ok(Outcome::PassThrough);
            };
            let exclude = doc
                .owning_heading(lid)
                .and_then(|h| doc.heading(h).ok())
                .map(|h| h.line);
            match links::resolve(&link.target, index, exclude) {
                LinkResolution::NotFound => {
                    warn!(link = %link.target, "link target not found");
                    Ok(Outcome::Warning(format!("No match for link: {}", link.target)))
                }
                LinkResolution::Ambiguous { candidates } => {
                    let titles = candidates.iter().map(|c| c.title.clone()).collect();
                    Ok(self.request(
                        "Select headline:",
                        None,
                        titles,
                        RequestKind::SelectHeadline { candidates },
                    ))
                }
                resolved => Ok(Outcome::Resolved(resolved)),
            }
        }

        pub fn open_link_in_document(&self, pos: Position) -> Result<Outcome, EditError> {
            let index = DocumentIndex::new(self.document()?);
            self.open_link(pos, &index)
        }

        /// Feed the host's answer to `request`. `None` cancels that branch only.
        pub fn respond(&mut self, request: &HostRequest, answer: Option<String>) -> Result<Outcome, EditError> {
            if request.version != self.buffer.version {
                return Err(EditError::StaleDocument {
                    document: request.version,
                    buffer: self.buffer.version,
                });
            }
            self.document()?;
            let Some(answer) = answer else {
                debug!(prompt = %request.prompt, "request cancelled");
                return Ok(Outcome::NoOp);
            };
            match &request.kind {
                RequestKind::ClosingNote { heading_line, header } => {
                    let Some(hid) = self.document.heading_at_line(*heading_line) else {
                        return Ok(Outcome::Warning("Heading for note is gone".into()));
                    };
                    // A state-change header already in the log only gains the note text.
                    let range = self.document.get(hid)?.range;
                    let written = (range.start_line()..range.end_line().min(self.document.lines.len()))
                        .find(|l| self.document.line(*l) == header.as_str());
                    let edits = match written {
                        Some(_) if answer.trim().is_empty() => return Ok(Outcome::NoOp),
                        Some(l) => vec![TextEdit::replace(l, l + 1, note_lines(header, &answer))],
                        None => {
                            let mut draft = self.document.clone();
                            let drawer = self.config.log_into_drawer.clone();
                            draft.append_log(hid, drawer.as_deref(), note_lines(header, &answer))?;
                            draft.edits()
                        }
                    };
                    self.finish("closing_note", edits, vec![], None, None)
                }
                RequestKind::FastAccess { heading_line } => {
                    let Some(hid) = self.document.heading_at_line(*heading_line) else {
                        return Ok(Outcome::NoOp);
                    };
                    let key = answer.chars().next().ok_or(EditError::UnexpectedResponse)?;
                    let keywords = &self.document.keywords;
                    let target = match keywords.find(answer.trim()) {
                        Some(def) => Some(Some(def.to_keyword())),
                        None => {
                            let current = self.document.heading(hid)?.todo.as_ref().map(|t| t.text.clone());
                            TodoState::new(keywords, current.as_deref())
                                .fast_access(key)
                                .map(|s| s.keyword())
                        }
                    };
                    match target {
                        Some(keyword) => self.transition_todo(hid, keyword),
                        None => Ok(Outcome::Warning(format!("No TODO keyword bound to '{key}'"))),
                    }
                }
                RequestKind::Tags { heading_line } => {
                    let Some(hid) = self.document.heading_at_line(*heading_line) else {
                        return Ok(Outcome::NoOp);
                    };
                    let mut draft = self.document.clone();
                    draft.set_tags(hid, &answer)?;
                    let edits = draft.edits();
                    self.finish("set_tags", edits, vec![], None, None)
                }
                RequestKind::LinkTarget { pos } => {
                    let target = answer.trim().to_string();
                    if target.is_empty() {
                        return Ok(Outcome::NoOp);
                    }
                    Ok(self.request(
                        "Description:",
                        Some(target.clone()),
                        vec![],
                        RequestKind::LinkDescription { pos: *pos, target },
                    ))
                }
                RequestKind::LinkDescription { pos, target } => {
                    let description = answer.trim();
                    let text = if description.is_empty() {
                        format!("[[{target}]]")
                    } else {
                        format!("[[{target}][{description}]]")
                    };
                    let mut draft = self.document.clone();
                    draft.substitute_text(pos.line, pos.col, pos.col, &text)?;
                    let cursor = Position::new(pos.line, pos.col + char_len(&text));
                    let edits = draft.edits();
                    self.finish("insert_link", edits, vec![], Some(cursor), None)
                }
                RequestKind::SelectHeadline { candidates } => {
                    let choice = answer.trim();
                    let picked = candidates
                        .iter()
                        .find(|c| c.title.trim() == choice)
                        .or_else(|| {
                            choice
                                .parse::<usize>()
                                .ok()
                                .and_then(|n| n.checked_sub(1))
                                .and_then(|i| candidates.get(i))
                        });
                    match picked {
                        Some(headline) => Ok(Outcome::Resolved(LinkResolution::Resolved {
                            headline: headline.clone(),
                        })),
                        None => Ok(Outcome::Warning(format!("No headline named {choice:?}"))),
                    }
                }
            }
        }
    }

    /* ------------------------------ Date editing ------------------------------ */

    impl Session {
        /// Adjust the timestamp field under the cursor by `amount` steps.
        pub fn adjust_date_part(&mut self, pos: Position, amount: i64) -> Result<Outcome, EditError> {
            let rounding = self.config.rounding();
            let doc = self.document()?;
            let Some(tid) = doc.closest_node_of_kind(pos, NodeKind::Timestamp) else {
                return Ok(Outcome::PassThrough);
            };
            let ts = doc.timestamp(tid)?.clone();
            let (start, end) = (ts.range.start.col, ts.range.end.col);
            let token: String = doc
                .line(ts.range.start.line)
                .chars()
                .skip(start)
                .take(end - start)
                .collect();
            let Some(hit) = locate_field(&token, pos.col.saturating_sub(start)) else {
                return Ok(Outcome::PassThrough);
            };
            let next = match hit.field {
                DateField::OpenDelimiter | DateField::CloseDelimiter => ts.with_active(!ts.active),
                DateField::RangeSeparator => return Ok(Outcome::NoOp),
                field => match hit.half {
                    RangeHalf::Start => adjust_field(&ts, field, amount, rounding),
                    RangeHalf::End => {
                        let mut out = ts.clone();
                        if let Some(second) = &ts.related_date_range {
                            out.related_date_range =
                                Some(Box::new(adjust_field(second, field, amount, rounding)));
                        }
                        out
                    }
                },
            };
            if next == ts {
                return Ok(Outcome::NoOp);
            }
            let mut draft = doc.clone();
            draft.replace_timestamp(tid, next)?;
            let edits = draft.edits();
            self.finish("adjust_date_part", edits, vec![], Some(pos), None)
        }
    }

    fn adjust_field(ts: &Timestamp, field: DateField, amount: i64, rounding: u32) -> Timestamp {
        let mut out = ts.clone();
        match field {
            DateField::Year => return ts.adjust(Delta::years(amount)),
            DateField::Month => return ts.adjust(Delta::months(amount)),
            DateField::Day | DateField::DayName => return ts.adjust(Delta::days(amount)),
            DateField::Hour => return ts.adjust(Delta::hours(amount)),
            DateField::Minute => return ts.adjust_minutes_rounded(amount, rounding, false),
            DateField::EndHour => return ts.adjust_end_time(Delta::hours(amount)),
            DateField::EndMinute => return ts.adjust_minutes_rounded(amount, rounding, true),
            DateField::RepeaterAmount => {
                if let Some(rep) = &mut out.repeater {
                    rep.amount = bump(rep.amount, amount);
                }
            }
            DateField::RepeaterUnit if amount != 0 => {
                if let Some(rep) = &mut out.repeater {
                    rep.unit = rep.unit.cycle(amount > 0);
                }
            }
            DateField::DelayAmount => {
                if let Some(delay) = &mut out.delay {
                    delay.amount = bump(delay.amount, amount);
                }
            }
            DateField::DelayUnit if amount != 0 => {
                if let Some(delay) = &mut out.delay {
                    delay.unit = delay.unit.cycle(amount > 0);
                }
            }
            _ => {}
        }
        out
    }

    fn ordered_overflow(number: u32) -> Outcome {
        warn!(number, "ordered list marker out of range");
        Outcome::Warning(format!("Cannot number a list item after {number}"))
    }

    fn bump(value: u32, by: i64) -> u32 {
        (value as i64 + by).clamp(0, u32::MAX as i64) as u32
    }

    /* ------------------------------ Helpers ------------------------------ */

    fn note_request(heading_line: usize, header: String) -> HostRequest {
        HostRequest {
            prompt: "Closing note:".into(),
            default: None,
            completions: vec![],
            kind: RequestKind::ClosingNote { heading_line, header },
            version: 0,
        }
    }

    /// `- State "DONE"       from "TODO"       [2026-10-18 Sun 10:00]`
    fn state_change_line(to: Option<&TodoKeyword>, from: Option<&TodoKeyword>, stamp: &Timestamp) -> String {
        let quoted = |k: Option<&TodoKeyword>| k.map(|k| format!("\"{}\"", k.text)).unwrap_or_default();
        format!("- State {:<12} from {:<12} {}", quoted(to), quoted(from), stamp)
    }

    /// Header plus indented note text; an empty note leaves the bare header.
    fn note_lines(header: &str, note: &str) -> Vec<String> {
        if note.trim().is_empty() {
            return vec![header.to_string()];
        }
        let mut lines = vec![format!("{header} \\\\")];
        lines.extend(note.lines().map(|l| format!("  {}", l.trim_end())));
        lines
    }

    /// (checked, partial, with-checkbox) over direct child items.
    fn checkbox_stats(doc: &Document, id: NodeId) -> (usize, usize, usize) {
        let mut stats = (0, 0, 0);
        for child in doc.children_of_kind(id, NodeKind::ListItem) {
            match doc.list_item(child).ok().and_then(|i| i.checkbox) {
                Some(Checkbox::Checked) => {
                    stats.0 += 1;
                    stats.2 += 1;
                }
                Some(Checkbox::Partial) => {
                    stats.1 += 1;
                    stats.2 += 1;
                }
                Some(Checkbox::Empty) => stats.2 += 1,
                None => {}
            }
        }
        stats
    }

    /// Rewrite `[n/m]` and `[p%]` cookies; `None` when nothing changed.
    pub(crate) fn update_cookies(text: &str, done: usize, total: usize) -> Option<String> {
        let percent = if total == 0 { 0 } else { done * 100 / total };
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut changed = false;
        while let Some(open) = rest.find('[') {
            let after = &rest[open + 1..];
            let Some(close) = after.find(']') else { break };
            let inner = &after[..close];
            let original = &rest[open..open + close + 2];
            out.push_str(&rest[..open]);
            let replacement = if is_fraction_cookie(inner) {
                Some(format!("[{done}/{total}]"))
            } else if is_percent_cookie(inner) {
                Some(format!("[{percent}%]"))
            } else {
                None
            };
            match replacement {
                Some(r) => {
                    changed |= r != original;
                    out.push_str(&r);
                }
                None => out.push_str(original),
            }
            rest = &after[close + 1..];
        }
        out.push_str(rest);
        changed.then_some(out)
    }

    fn is_fraction_cookie(inner: &str) -> bool {
        inner.split_once('/').is_some_and(|(a, b)| {
            a.chars().all(|c| c.is_ascii_digit()) && b.chars().all(|c| c.is_ascii_digit())
        })
    }

    fn is_percent_cookie(inner: &str) -> bool {
        inner
            .strip_suffix('%')
            .is_some_and(|d| d.chars().all(|c| c.is_ascii_digit()))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;
        use std::{cell::RefCell, rc::Rc};

        fn clock() -> FixedClock {
            FixedClock(
                NaiveDate::from_ymd_opt(2026, 10, 18)
                    .unwrap()
                    .and_hms_opt(10, 0, 0)
                    .unwrap(),
            )
        }

        fn session(text: &str) -> Session {
            session_with(text, EditorConfig::default())
        }

        fn session_with(text: &str, config: EditorConfig) -> Session {
            Session::new(text, config).unwrap().with_clock(clock())
        }

        fn at(line: usize, col: usize) -> Position {
            Position::new(line, col)
        }

        fn followup(outcome: Outcome) -> HostRequest {
            match outcome {
                Outcome::Applied(Applied { followup: Some(r), .. }) => r,
                other => panic!("expected a follow-up request, got {other:?}"),
            }
        }

        fn request(outcome: Outcome) -> HostRequest {
            match outcome {
                Outcome::Request(r) => r,
                other => panic!("expected a request, got {other:?}"),
            }
        }

        #[test]
        fn buffer_keeps_emission_order_for_same_line_inserts() {
            let mut buf = Buffer::from_text("a\nb\n");
            buf.apply(&[
                TextEdit::insert(1, vec!["x".into()]),
                TextEdit::insert(1, vec!["y".into()]),
                TextEdit::replace_line(1, "B".into()),
            ]);
            assert_eq!(buf.text(), "a\nx\ny\nB\n");
            assert_eq!(buf.version, 1);
        }

        #[test]
        fn finishing_a_task_sets_closed_without_a_note() {
            let mut s = session("* TODO Buy milk\nSCHEDULED: <2026-10-17 Sat>\n");
            let seen = Rc::new(RefCell::new(0));
            let counter = Rc::clone(&seen);
            s.subscribe(move |e| {
                if matches!(e, OutlineEvent::TodoChanged { was_done: false, .. }) {
                    *counter.borrow_mut() += 1;
                }
            });
            let out = s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap();
            assert!(matches!(out, Outcome::Applied(Applied { followup: None, .. })));
            assert_eq!(
                s.text(),
                "* DONE Buy milk\nSCHEDULED: <2026-10-17 Sat> CLOSED: [2026-10-18 Sun 10:00]\n"
            );
            assert_eq!(*seen.borrow(), 1);

            s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap();
            assert_eq!(s.text(), "* Buy milk\nSCHEDULED: <2026-10-17 Sat>\n");
        }

        #[test]
        fn repeating_task_advances_and_logs() {
            let config = EditorConfig {
                log_into_drawer: Some("LOGBOOK".into()),
                ..EditorConfig::default()
            };
            let mut s = session_with("* TODO Water plants\nSCHEDULED: <2026-10-04 Sun +1w>\n", config);
            s.cycle_todo(at(0, 3), CycleDirection::Next).unwrap();
            assert_eq!(
                s.text(),
                "* TODO Water plants\n\
                 SCHEDULED: <2026-10-11 Sun +1w>\n\
                 :PROPERTIES:\n\
                 :LAST_REPEAT: [2026-10-18 Sun 10:00]\n\
                 :END:\n\
                 :LOGBOOK:\n\
                 - State \"DONE\"       from \"TODO\"       [2026-10-18 Sun 10:00]\n\
                 :END:\n"
            );
        }

        #[test]
        fn closing_note_is_requested_then_appended() {
            let config = EditorConfig {
                log_done: LogPolicy::Note,
                ..EditorConfig::default()
            };
            let mut s = session_with("* TODO Buy milk\n", config);
            let req = followup(s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap());
            assert_eq!(s.text(), "* DONE Buy milk\nCLOSED: [2026-10-18 Sun 10:00]\n");
            s.respond(&req, Some("bought it".into())).unwrap();
            assert_eq!(
                s.text(),
                "* DONE Buy milk\nCLOSED: [2026-10-18 Sun 10:00]\n- CLOSING NOTE [2026-10-18 Sun 10:00] \\\\\n  bought it\n"
            );
        }

        #[test]
        fn cancelled_note_keeps_state_change() {
            let config = EditorConfig {
                log_done: LogPolicy::Note,
                ..EditorConfig::default()
            };
            let mut s = session_with("* TODO Buy milk\n", config);
            let req = followup(s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap());
            assert_eq!(s.respond(&req, None).unwrap(), Outcome::NoOp);
            assert!(s.text().starts_with("* DONE Buy milk\nCLOSED:"));
        }

        #[test]
        fn fast_access_prompts_and_applies() {
            let mut s = session("#+TODO: TODO(t) WAIT(w) | DONE(d)\n* TODO Task\n");
            let req = request(s.set_todo_fast(at(1, 0)).unwrap());
            assert!(req.completions.contains(&"w WAIT".to_string()));
            s.respond(&req, Some("w".into())).unwrap();
            assert_eq!(s.text(), "#+TODO: TODO(t) WAIT(w) | DONE(d)\n* WAIT Task\n");
        }

        #[test]
        fn stale_document_is_rejected_until_refresh() {
            let mut s = session("* TODO A\n");
            s.apply_host_edits(&[TextEdit::insert(0, vec!["intro".into()])]);
            assert!(matches!(
                s.cycle_todo(at(1, 0), CycleDirection::Next),
                Err(EditError::StaleDocument { document: 0, buffer: 1 })
            ));
            s.refresh().unwrap();
            assert!(s.cycle_todo(at(1, 0), CycleDirection::Next).is_ok());
        }

        #[test]
        fn promote_past_top_level_warns() {
            let mut s = session("* A\n** B\n");
            assert!(matches!(s.promote(at(0, 0), 1, false).unwrap(), Outcome::Warning(_)));
            assert_eq!(s.text(), "* A\n** B\n");
            match s.demote(at(0, 0), 1, true).unwrap() {
                Outcome::Applied(applied) => assert!(matches!(
                    applied.events.as_slice(),
                    [OutlineEvent::HeadlineDemoted { old_level: 1, .. }]
                )),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(s.text(), "** A\n*** B\n");
        }

        #[test]
        fn date_parts_adjust_under_cursor() {
            let mut s = session("* Meet\n<2026-10-18 Sun 09:03>\n");
            s.adjust_date_part(at(1, 9), 1).unwrap();
            assert_eq!(s.text(), "* Meet\n<2026-10-19 Mon 09:03>\n");
            s.adjust_date_part(at(1, 20), 1).unwrap();
            assert_eq!(s.text(), "* Meet\n<2026-10-19 Mon 09:05>\n");
            s.adjust_date_part(at(1, 0), 1).unwrap();
            assert_eq!(s.text(), "* Meet\n[2026-10-19 Mon 09:05]\n");
            assert_eq!(s.adjust_date_part(at(0, 1), 1).unwrap(), Outcome::PassThrough);
        }

        #[test]
        fn month_adjustment_clamps_day() {
            let mut s = session("* Pay\nDEADLINE: <2026-01-31 Sat>\n");
            s.adjust_date_part(at(1, 16), 1).unwrap();
            assert_eq!(s.text(), "* Pay\nDEADLINE: <2026-02-28 Sat>\n");
        }

        #[test]
        fn repeater_unit_cycles() {
            let mut s = session("* Gym\n<2026-10-18 Sun +1w>\n");
            s.adjust_date_part(at(1, 18), 1).unwrap();
            assert_eq!(s.text(), "* Gym\n<2026-10-18 Sun +1m>\n");
        }

        #[test]
        fn return_in_ordered_list_renumbers_followers() {
            let mut s = session("* L\n1) one\n2) two\n3) three\n");
            match s.handle_return(at(1, 3)).unwrap() {
                Outcome::Applied(applied) => assert_eq!(applied.cursor, Some(at(2, 3))),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(s.text(), "* L\n1) one\n2) \n3) two\n4) three\n");
        }

        #[test]
        fn return_in_checkbox_list_starts_unchecked() {
            let mut s = session("- [X] a\n");
            s.handle_return(at(0, 0)).unwrap();
            assert_eq!(s.text(), "- [X] a\n- [ ] \n");
        }

        #[test]
        fn insert_heading_after_subtree_with_blank_policy() {
            let mut s = session("* A\nbody\n* B\n");
            s.insert_heading(at(1, 0)).unwrap();
            assert_eq!(s.text(), "* A\nbody\n* \n* B\n");

            let mut s = session("intro\n\n* A\nbody\n");
            s.insert_heading(at(3, 0)).unwrap();
            assert_eq!(s.text(), "intro\n\n* A\nbody\n\n* \n");
        }

        #[test]
        fn move_subtree_swaps_siblings() {
            let mut s = session("* A\na\n* B\nb\n");
            assert!(matches!(s.move_subtree_up(at(0, 0)).unwrap(), Outcome::Warning(_)));
            s.move_subtree_down(at(0, 0)).unwrap();
            assert_eq!(s.text(), "* B\nb\n* A\na\n");
            s.move_subtree_up(at(2, 0)).unwrap();
            assert_eq!(s.text(), "* A\na\n* B\nb\n");
        }

        #[test]
        fn archive_returns_rebased_subtree() {
            let mut s = session("* Projects\n** DONE Old task :x:\nnotes\n*** sub\n** Keep\n")
                .with_path("/tmp/work.org")
                .unwrap();
            match s.archive_subtree(at(1, 0)).unwrap() {
                Outcome::Archived(archived) => {
                    assert_eq!(archived.target_file, "/tmp/work.org_archive");
                    assert_eq!(
                        archived.text,
                        "* DONE Old task :x:\n\
                         :PROPERTIES:\n\
                         :ARCHIVE_TIME: [2026-10-18 Sun 10:00]\n\
                         :ARCHIVE_FILE: /tmp/work.org\n\
                         :ARCHIVE_OLPATH: Projects\n\
                         :ARCHIVE_CATEGORY: work\n\
                         :ARCHIVE_TODO: DONE\n\
                         :END:\n\
                         notes\n\
                         ** sub\n"
                    );
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(s.text(), "* Projects\n** Keep\n");
        }

        #[test]
        fn checkbox_toggle_updates_parents_and_cookies() {
            let mut s = session("* Tasks [0/2]\n- [ ] a\n- [ ] b\n");
            s.toggle_checkbox(at(1, 0)).unwrap();
            assert_eq!(s.text(), "* Tasks [1/2]\n- [X] a\n- [ ] b\n");

            let mut s = session("- [ ] parent [/]\n  - [ ] x\n  - [ ] y\n");
            s.toggle_checkbox(at(1, 4)).unwrap();
            assert_eq!(s.text(), "- [-] parent [1/2]\n  - [X] x\n  - [ ] y\n");
            s.toggle_checkbox(at(2, 4)).unwrap();
            assert_eq!(s.text(), "- [X] parent [2/2]\n  - [X] x\n  - [X] y\n");
        }

        #[test]
        fn cookie_rewrite_leaves_links_alone() {
            assert_eq!(
                update_cookies("see [[x]] [50%]", 1, 4).as_deref(),
                Some("see [[x]] [25%]")
            );
            assert_eq!(update_cookies("plain [a]", 1, 1), None);
        }

        #[test]
        fn heading_id_is_created_once() {
            let mut s = session("* A\n");
            let (id, outcome) = s.ensure_heading_id(at(0, 0)).unwrap().unwrap();
            assert!(matches!(outcome, Outcome::Applied(_)));
            assert_eq!(s.text(), format!("* A\n:PROPERTIES:\n:ID: {id}\n:END:\n"));
            let (again, outcome) = s.ensure_heading_id(at(0, 0)).unwrap().unwrap();
            assert_eq!(again, id);
            assert_eq!(outcome, Outcome::NoOp);
        }

        #[test]
        fn priority_steps_within_file_range() {
            let mut s = session("#+PRIORITIES: A C B\n* Task\n");
            s.priority_up(at(1, 0)).unwrap();
            assert_eq!(s.text(), "#+PRIORITIES: A C B\n* [#C] Task\n");
            s.priority_up(at(1, 0)).unwrap();
            assert_eq!(s.text(), "#+PRIORITIES: A C B\n* [#B] Task\n");
            s.priority_down(at(1, 0)).unwrap();
            s.priority_down(at(1, 0)).unwrap();
            assert_eq!(s.text(), "#+PRIORITIES: A C B\n* Task\n");
        }

        #[test]
        fn tags_prompt_round_trip() {
            let mut s = session("* Task :a:\n* Other :b:\n");
            let req = request(s.set_tags(at(0, 0)).unwrap());
            assert_eq!(req.prompt, "Tags:");
            assert_eq!(req.default.as_deref(), Some(":a:"));
            assert_eq!(req.completions, vec!["a".to_string(), "b".to_string()]);
            s.respond(&req, Some("a b".into())).unwrap();
            assert_eq!(s.text(), "* Task :a:b:\n* Other :b:\n");
        }

        #[test]
        fn link_insertion_prompts_target_then_description() {
            let mut s = session("* Task\nsee \n");
            let req = request(s.insert_link(at(1, 4)).unwrap());
            assert!(req.completions.contains(&"*Task".to_string()));
            let req = request(s.respond(&req, Some("*Task".into())).unwrap());
            assert_eq!(req.prompt, "Description:");
            assert_eq!(req.default.as_deref(), Some("*Task"));
            s.respond(&req, Some(String::new())).unwrap();
            assert_eq!(s.text(), "* Task\nsee [[*Task]]\n");
        }

        #[test]
        fn open_link_resolves_or_warns() {
            let s = session("* Alpha\n* Beta\nGo [[*Alpha]] and [[nothing]]\n");
            match s.open_link_in_document(at(2, 5)).unwrap() {
                Outcome::Resolved(LinkResolution::Resolved { headline }) => assert_eq!(headline.line, 0),
                other => panic!("unexpected {other:?}"),
            }
            assert!(matches!(s.open_link_in_document(at(2, 20)).unwrap(), Outcome::Warning(_)));
        }

        #[test]
        fn ambiguous_link_asks_for_a_headline() {
            let mut s = session("[[Alpha]]\n* Alpha one\n* Alpha two\n");
            let req = request(s.open_link_in_document(at(0, 3)).unwrap());
            assert_eq!(req.completions.len(), 2);
            match s.respond(&req, Some("Alpha two".into())).unwrap() {
                Outcome::Resolved(LinkResolution::Resolved { headline }) => assert_eq!(headline.line, 2),
                other => panic!("unexpected {other:?}"),
            }
        }

        fn logbook_config(log_repeat: LogPolicy) -> EditorConfig {
            EditorConfig {
                log_into_drawer: Some("LOGBOOK".into()),
                log_repeat,
                ..EditorConfig::default()
            }
        }

        #[test]
        fn repeat_log_goes_to_top_of_existing_logbook() {
            let mut s = session_with(
                "* TODO Water\nSCHEDULED: <2026-10-04 Sun +1w>\n:LOGBOOK:\n- old\n:END:\nbody\n",
                logbook_config(LogPolicy::Time),
            );
            s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap();
            assert_eq!(
                s.text(),
                "* TODO Water\n\
                 SCHEDULED: <2026-10-11 Sun +1w>\n\
                 :PROPERTIES:\n\
                 :LAST_REPEAT: [2026-10-18 Sun 10:00]\n\
                 :END:\n\
                 :LOGBOOK:\n\
                 - State \"DONE\"       from \"TODO\"       [2026-10-18 Sun 10:00]\n\
                 - old\n\
                 :END:\n\
                 body\n"
            );
        }

        #[test]
        fn repeat_note_extends_the_state_change_line() {
            let mut s = session_with(
                "* TODO Water\nSCHEDULED: <2026-10-04 Sun +1w>\n",
                logbook_config(LogPolicy::Note),
            );
            let req = followup(s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap());
            s.respond(&req, Some("watered".into())).unwrap();
            assert_eq!(
                s.text(),
                "* TODO Water\n\
                 SCHEDULED: <2026-10-11 Sun +1w>\n\
                 :PROPERTIES:\n\
                 :LAST_REPEAT: [2026-10-18 Sun 10:00]\n\
                 :END:\n\
                 :LOGBOOK:\n\
                 - State \"DONE\"       from \"TODO\"       [2026-10-18 Sun 10:00] \\\\\n\
                 \x20 watered\n\
                 :END:\n"
            );
        }

        #[test]
        fn cancelled_repeat_note_keeps_the_state_change_line() {
            let mut s = session_with(
                "* TODO Water\nSCHEDULED: <2026-10-04 Sun +1w>\n",
                logbook_config(LogPolicy::Note),
            );
            let req = followup(s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap());
            let before = s.text();
            assert_eq!(s.respond(&req, None).unwrap(), Outcome::NoOp);
            assert_eq!(s.text(), before);
            assert!(s.text().contains("- State \"DONE\"       from \"TODO\"       [2026-10-18 Sun 10:00]\n"));
        }

        #[test]
        fn leaving_done_on_a_repeating_task_only_drops_closed() {
            let mut s = session("* DONE Gym\nSCHEDULED: <2026-10-18 Sun +1w> CLOSED: [2026-10-17 Sat 09:00]\n");
            s.cycle_todo(at(0, 0), CycleDirection::Next).unwrap();
            assert_eq!(s.text(), "* Gym\nSCHEDULED: <2026-10-18 Sun +1w>\n");
        }

        #[test]
        fn end_time_fields_move_only_the_range_end() {
            let mut s = session("* Meet\n<2026-10-18 Sun 09:00-10:00>\n");
            s.adjust_date_part(at(1, 22), 1).unwrap();
            assert_eq!(s.text(), "* Meet\n<2026-10-18 Sun 09:00-11:00>\n");
            s.adjust_date_part(at(1, 25), 1).unwrap();
            assert_eq!(s.text(), "* Meet\n<2026-10-18 Sun 09:00-11:05>\n");
        }

        #[test]
        fn date_range_end_half_adjusts_second_date() {
            let mut s = session("* Trip\n<2026-10-18 Sun>--<2026-10-20 Tue>\n");
            s.adjust_date_part(at(1, 27), 1).unwrap();
            assert_eq!(s.text(), "* Trip\n<2026-10-18 Sun>--<2026-10-21 Wed>\n");
            assert_eq!(s.adjust_date_part(at(1, 16), 1).unwrap(), Outcome::NoOp);
        }

        #[test]
        fn heading_id_respects_file_keywords() {
            let mut s = session("#+TODO: NEXT | FINISHED\n* NEXT Call back\n");
            let (id, _) = s.ensure_heading_id(at(1, 0)).unwrap().unwrap();
            assert_eq!(
                s.text(),
                format!("#+TODO: NEXT | FINISHED\n* NEXT Call back\n:PROPERTIES:\n:ID: {id}\n:END:\n")
            );
            let h = s.document().unwrap().headings().next().unwrap();
            assert_eq!(s.document().unwrap().heading(h).unwrap().title, "Call back");
        }

        #[test]
        fn archive_keeps_file_keywords_in_the_subtree() {
            let mut s = session("#+TODO: NEXT | FINISHED\n* Area\n** FINISHED Old :x:\n* Keep\n");
            match s.archive_subtree(at(2, 0)).unwrap() {
                Outcome::Archived(archived) => assert_eq!(
                    archived.text,
                    "* FINISHED Old :x:\n\
                     :PROPERTIES:\n\
                     :ARCHIVE_TIME: [2026-10-18 Sun 10:00]\n\
                     :ARCHIVE_OLPATH: Area\n\
                     :ARCHIVE_TODO: FINISHED\n\
                     :END:\n"
                ),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(s.text(), "#+TODO: NEXT | FINISHED\n* Area\n* Keep\n");
        }

        #[test]
        fn return_in_nested_ordered_list_stays_in_the_sublist() {
            let mut s = session("- a\n  1. x\n  2. y\n- b\n");
            match s.handle_return(at(1, 5)).unwrap() {
                Outcome::Applied(applied) => assert_eq!(applied.cursor, Some(at(2, 5))),
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(s.text(), "- a\n  1. x\n  2. \n  3. y\n- b\n");
        }

        #[test]
        fn return_after_largest_ordered_number_warns() {
            let mut s = session("4294967295) x\n");
            assert!(matches!(s.handle_return(at(0, 0)).unwrap(), Outcome::Warning(_)));
            assert_eq!(s.text(), "4294967295) x\n");

            let mut s = session("4294967294) x\n7) y\n");
            assert!(matches!(s.handle_return(at(0, 0)).unwrap(), Outcome::Warning(_)));
            assert_eq!(s.text(), "4294967294) x\n7) y\n");
        }
    }
}

pub use config::EditorConfig;
pub use parser::{NomOutlineParser, OutlineParser, parse_document};
pub use session::{Outcome, Session};
