//! Tool-call argument accumulation.
//!
//! Arguments arrive as a stream of JSON text fragments keyed by a provider
//! call index or call id. Fragments pass through a [`FragmentRepair`]
//! strategy before being appended, so protocols whose upstreams resend
//! bytes can opt into duplicate repair without touching accumulation.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::protocol::canonical::{OutputEvent, ToolArguments};
use crate::util::{floor_char_boundary, next_call_id};

/// Key identifying one in-flight tool call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallKey {
    Index(u32),
    Id(String),
}

/// Accumulated state of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallEntry {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Outcome of probing an entry's accumulated arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Parsed(serde_json::Value),
    Incomplete,
    Invalid(String),
}

/// How an incoming fragment should be merged into the accumulated string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentMerge<'a> {
    Append(&'a str),
    Discard,
}

/// Decides what part of a fragment is new.
pub trait FragmentRepair: Send {
    fn merge<'a>(&self, accumulated: &str, fragment: &'a str) -> FragmentMerge<'a>;
}

/// Appends every fragment verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAppend;

impl FragmentRepair for PlainAppend {
    fn merge<'a>(&self, _accumulated: &str, fragment: &'a str) -> FragmentMerge<'a> {
        FragmentMerge::Append(fragment)
    }
}

/// Repairs fragments that repeat bytes the upstream already sent.
///
/// Rules, in order:
/// 1. a fragment equal to everything accumulated so far is a full replay;
/// 2. a fragment of at least `min_repeat_len` bytes that the accumulated
///    string already ends with is a repeat;
/// 3. a fragment that starts with the whole accumulated string is a resend
///    plus new data, so only the tail is kept;
/// 4. if the first `prefix_scan_len` bytes of the accumulated string occur
///    inside the fragment and the fragment continues from there with the
///    whole accumulated string, the upstream restarted mid-fragment and only
///    the tail after that restart is kept.
///
/// Rule 4 can misfire on arguments that legitimately repeat their own
/// opening text (for example nested objects sharing the first key).
#[derive(Debug, Clone, Copy)]
pub struct DuplicateFragmentRepair {
    pub min_repeat_len: usize,
    pub prefix_scan_len: usize,
}

impl Default for DuplicateFragmentRepair {
    fn default() -> Self {
        Self {
            min_repeat_len: 8,
            prefix_scan_len: 50,
        }
    }
}

impl FragmentRepair for DuplicateFragmentRepair {
    fn merge<'a>(&self, accumulated: &str, fragment: &'a str) -> FragmentMerge<'a> {
        if accumulated.is_empty() || fragment.is_empty() {
            return FragmentMerge::Append(fragment);
        }
        if accumulated.len() >= 2 && fragment == accumulated {
            return FragmentMerge::Discard;
        }
        if fragment.len() >= self.min_repeat_len && accumulated.ends_with(fragment) {
            return FragmentMerge::Discard;
        }
        if accumulated.len() >= self.min_repeat_len {
            if let Some(tail) = fragment.strip_prefix(accumulated) {
                return FragmentMerge::Append(tail);
            }
            let probe_end = floor_char_boundary(accumulated, self.prefix_scan_len);
            let probe = &accumulated[..probe_end];
            if probe.len() >= self.min_repeat_len {
                if let Some(pos) = fragment.find(probe) {
                    if let Some(tail) = fragment[pos..].strip_prefix(accumulated) {
                        return FragmentMerge::Append(tail);
                    }
                }
            }
        }
        FragmentMerge::Append(fragment)
    }
}

/// Per-response accumulator of streamed tool-call arguments.
pub struct ToolCallAccumulator {
    entries: FxHashMap<CallKey, ToolCallEntry>,
    order: Vec<CallKey>,
    repair: Box<dyn FragmentRepair>,
}

impl ToolCallAccumulator {
    #[must_use]
    pub fn new(repair: Box<dyn FragmentRepair>) -> Self {
        Self {
            entries: FxHashMap::default(),
            order: Vec::new(),
            repair,
        }
    }

    #[must_use]
    pub fn plain() -> Self {
        Self::new(Box::new(PlainAppend))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &CallKey) -> Option<&ToolCallEntry> {
        self.entries.get(key)
    }

    /// Register a call explicitly. Returns `true` when the entry is new.
    pub fn start(&mut self, key: CallKey, id: Option<&str>, name: Option<&str>) -> bool {
        let created = !self.entries.contains_key(&key);
        let entry = self.entry_mut(key);
        fill_identity(entry, id, name);
        created
    }

    /// Append one arguments fragment, creating the entry on first sight.
    pub fn append(&mut self, key: CallKey, id: Option<&str>, name: Option<&str>, fragment: &str) {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        let entry = self.entries.entry(key).or_default();
        fill_identity(entry, id, name);
        match self.repair.merge(&entry.arguments, fragment) {
            FragmentMerge::Append(tail) => entry.arguments.push_str(tail),
            FragmentMerge::Discard => {
                debug!(
                    call_id = %entry.id,
                    fragment_len = fragment.len(),
                    "discarded repeated tool-call argument fragment"
                );
            }
        }
    }

    /// Replace the accumulated arguments with an authoritative full string.
    pub fn set_arguments(&mut self, key: &CallKey, arguments: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            arguments.clone_into(&mut entry.arguments);
        }
    }

    /// Probe whether the accumulated arguments are complete JSON.
    #[must_use]
    pub fn try_complete(&self, key: &CallKey) -> Completion {
        match self.entries.get(key) {
            Some(entry) => probe_arguments(&entry.arguments),
            None => Completion::Incomplete,
        }
    }

    /// Remove and return one entry.
    pub fn take(&mut self, key: &CallKey) -> Option<ToolCallEntry> {
        let entry = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(entry)
    }

    /// Remove every entry, in the order the calls were first seen.
    pub fn drain(&mut self) -> Vec<(CallKey, ToolCallEntry)> {
        let mut out = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            if let Some(entry) = self.entries.remove(&key) {
                out.push((key, entry));
            }
        }
        out
    }

    fn entry_mut(&mut self, key: CallKey) -> &mut ToolCallEntry {
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.entry(key).or_default()
    }
}

fn fill_identity(entry: &mut ToolCallEntry, id: Option<&str>, name: Option<&str>) {
    if let Some(id) = id.filter(|id| !id.is_empty()) {
        if entry.id.is_empty() {
            id.clone_into(&mut entry.id);
        }
    }
    if let Some(name) = name.filter(|name| !name.is_empty()) {
        if entry.name.is_empty() {
            name.clone_into(&mut entry.name);
        }
    }
}

/// Probe a raw arguments string. Whitespace-only arguments count as `{}`.
#[must_use]
pub fn probe_arguments(arguments: &str) -> Completion {
    let trimmed = arguments.trim();
    if trimmed.is_empty() {
        return Completion::Parsed(serde_json::Value::Object(serde_json::Map::new()));
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => Completion::Parsed(value),
        Err(err) if err.is_eof() => Completion::Incomplete,
        Err(err) => Completion::Invalid(err.to_string()),
    }
}

/// Materialize an entry at a completion signal.
///
/// Incomplete or invalid arguments fall back to [`ToolArguments::Raw`] so the
/// call is still surfaced.
#[must_use]
pub fn finalize_entry(entry: ToolCallEntry) -> OutputEvent {
    let arguments = match probe_arguments(&entry.arguments) {
        Completion::Parsed(value) => ToolArguments::Parsed(value),
        Completion::Incomplete | Completion::Invalid(_) => {
            tracing::warn!(
                call_id = %entry.id,
                name = %entry.name,
                "tool call arguments are not valid JSON; reporting raw arguments"
            );
            ToolArguments::Raw(entry.arguments)
        }
    };
    let id = if entry.id.is_empty() {
        next_call_id()
    } else {
        entry.id
    };
    OutputEvent::ToolCallComplete {
        id,
        name: entry.name,
        arguments,
    }
}
