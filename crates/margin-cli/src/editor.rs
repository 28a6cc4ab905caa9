//! In-memory document that accepted patches are applied to

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use margin_core::session::{PatchAnchor, SelectionSnapshot};
use margin_core::{EditOutcome, EditorBridge, SelectionOutcome};

use crate::script::DocumentSeed;

#[derive(Debug, Clone)]
struct Document {
    path: Option<String>,
    text: String,
    /// Character offset inserts land at when a patch names no position
    cursor: usize,
    selection: Option<(usize, usize)>,
}

/// Editor bridge over a single in-memory document
///
/// Offsets are in characters. File ranges use 1-based inclusive line numbers.
pub struct DocumentEditor {
    document: RwLock<Document>,
}

impl DocumentEditor {
    pub fn new(seed: &DocumentSeed) -> Self {
        let cursor = seed
            .selection
            .map(|(_, end)| end)
            .unwrap_or_else(|| seed.text.chars().count());
        Self {
            document: RwLock::new(Document {
                path: seed.path.clone(),
                text: seed.text.clone(),
                cursor,
                selection: seed.selection,
            }),
        }
    }

    pub fn text(&self) -> String {
        self.document.read().text.clone()
    }

    pub fn path(&self) -> Option<String> {
        self.document.read().path.clone()
    }
}

fn byte_index(text: &str, chars: usize) -> Option<usize> {
    if chars == 0 {
        return Some(0);
    }
    match text.char_indices().nth(chars) {
        Some((index, _)) => Some(index),
        None if text.chars().count() == chars => Some(text.len()),
        None => None,
    }
}

/// Byte range covering lines `start..=end` (1-based), trailing newline included
fn line_range(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    if start == 0 || start > end {
        return None;
    }
    let mut offset = 0;
    let mut range_start = None;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        let number = index + 1;
        if number == start {
            range_start = Some(offset);
        }
        offset += line.len();
        if number == end {
            return range_start.map(|s| (s, offset));
        }
    }
    None
}

fn matches_expected(current: &str, expected: Option<&str>) -> bool {
    expected.is_none_or(|expected| current.trim_end_matches('\n') == expected.trim_end_matches('\n'))
}

#[async_trait]
impl EditorBridge for DocumentEditor {
    async fn apply_replace_range(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome {
        let PatchAnchor::Selection {
            start,
            end,
            expected_text,
        } = anchor
        else {
            return EditOutcome::failed("Patch is not anchored to a selection");
        };

        let mut doc = self.document.write();
        let (Some(from), Some(to)) = (byte_index(&doc.text, *start), byte_index(&doc.text, *end))
        else {
            return EditOutcome::failed("Selection is out of range");
        };
        if from > to {
            return EditOutcome::failed("Selection is out of range");
        }
        if !matches_expected(&doc.text[from..to], expected_text.as_deref()) {
            return EditOutcome::failed("The selection changed since the patch was proposed");
        }

        doc.text.replace_range(from..to, text);
        doc.cursor = start + text.chars().count();
        doc.selection = None;
        debug!(start, end, "Replaced selection");
        EditOutcome::ok()
    }

    async fn apply_replace_in_file(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome {
        let PatchAnchor::FileRange {
            path,
            start_line,
            end_line,
            expected_text,
        } = anchor
        else {
            return EditOutcome::failed("Patch is not anchored to a file range");
        };

        let mut doc = self.document.write();
        if doc.path.as_deref() != Some(path.as_str()) {
            return EditOutcome::failed(format!("File {} is not open", path));
        }
        let Some((from, to)) = line_range(&doc.text, *start_line, *end_line) else {
            return EditOutcome::failed(format!(
                "Lines {}-{} are outside the file",
                start_line, end_line
            ));
        };
        if !matches_expected(&doc.text[from..to], expected_text.as_deref()) {
            return EditOutcome::failed("The file changed since the patch was proposed");
        }

        let mut replacement = text.to_string();
        if doc.text[..to].ends_with('\n') && !replacement.ends_with('\n') {
            replacement.push('\n');
        }
        doc.text.replace_range(from..to, &replacement);
        doc.selection = None;
        debug!(path = %path, start_line, end_line, "Replaced file range");
        EditOutcome::ok()
    }

    async fn insert_at_cursor(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome {
        let PatchAnchor::Cursor { position } = anchor else {
            return EditOutcome::failed("Patch is not anchored to the cursor");
        };

        let mut doc = self.document.write();
        let position = position.unwrap_or(doc.cursor);
        let Some(at) = byte_index(&doc.text, position) else {
            return EditOutcome::failed("Cursor is out of range");
        };

        doc.text.insert_str(at, text);
        doc.cursor = position + text.chars().count();
        debug!(position, "Inserted at cursor");
        EditOutcome::ok()
    }

    async fn request_selection(&self) -> SelectionOutcome {
        let doc = self.document.read();
        let Some((start, end)) = doc.selection else {
            return SelectionOutcome::failed("Nothing is selected");
        };
        let (Some(from), Some(to)) = (byte_index(&doc.text, start), byte_index(&doc.text, end))
        else {
            return SelectionOutcome::failed("Selection is out of range");
        };
        if from > to {
            return SelectionOutcome::failed("Selection is out of range");
        }

        SelectionOutcome::selected(SelectionSnapshot {
            text: doc.text[from..to].to_string(),
            start,
            end,
            path: doc.path.clone(),
        })
    }
}
