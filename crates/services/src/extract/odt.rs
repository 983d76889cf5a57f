//! OpenDocument text (.odt) to Markdown.
//!
//! Walks the top-level children of `office:text` in `content.xml`:
//! paragraphs and spans become lines, headings become `# ` lines and tables
//! become pipe tables. Blocks are separated by blank lines.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::fs::File;
use std::path::Path;

use super::{read_zip_part, ExtractError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Paragraph,
    Heading,
    Table,
}

impl BlockKind {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"text:p" | b"text:span" => Some(BlockKind::Paragraph),
            b"text:h" => Some(BlockKind::Heading),
            b"table:table" => Some(BlockKind::Table),
            _ => None,
        }
    }
}

/// Block being collected plus the depth of its opening tag
struct OpenBlock {
    kind: BlockKind,
    depth: usize,
    text: String,
    rows: Vec<Vec<String>>,
    in_cell: bool,
}

impl OpenBlock {
    fn new(kind: BlockKind, depth: usize) -> Self {
        Self {
            kind,
            depth,
            text: String::new(),
            rows: Vec::new(),
            in_cell: false,
        }
    }

    fn push_text(&mut self, text: &str) {
        if self.kind != BlockKind::Table {
            self.text.push_str(text);
        } else if self.in_cell {
            if let Some(cell) = self.rows.last_mut().and_then(|row| row.last_mut()) {
                cell.push_str(text);
            }
        }
    }

    fn open_child(&mut self, tag: &[u8]) {
        if self.kind != BlockKind::Table {
            return;
        }
        match tag {
            b"table:table-row" => self.rows.push(Vec::new()),
            b"table:table-cell" => {
                if let Some(row) = self.rows.last_mut() {
                    row.push(String::new());
                    self.in_cell = true;
                }
            }
            _ => {}
        }
    }

    fn close_child(&mut self, tag: &[u8]) {
        if tag == b"table:table-cell" {
            self.in_cell = false;
        }
    }

    /// Inline markers that carry whitespace instead of text
    fn push_marker(&mut self, e: &BytesStart<'_>) {
        match e.name().as_ref() {
            b"text:s" => {
                let count = e
                    .try_get_attribute("text:c")
                    .ok()
                    .flatten()
                    .and_then(|a| a.unescape_value().ok()?.parse::<usize>().ok())
                    .unwrap_or(1);
                self.push_text(&" ".repeat(count));
            }
            b"text:tab" => self.push_text("\t"),
            b"text:line-break" => self.push_text("\n"),
            _ => {}
        }
    }

    fn finish(self) -> String {
        match self.kind {
            BlockKind::Paragraph => self.text,
            BlockKind::Heading => format!("# {}", self.text),
            BlockKind::Table => markdown_table(&self.rows),
        }
    }
}

/// Render rows as a pipe table. The first row is the header; a separator row
/// of dashes sized to each column's widest cell is inserted after it.
pub fn markdown_table(rows: &[Vec<String>]) -> String {
    let Some(header) = rows.first() else {
        return String::new();
    };

    let mut widths: Vec<usize> = Vec::new();
    for row in rows {
        for (column, cell) in row.iter().enumerate() {
            let len = cell.chars().count();
            if column >= widths.len() {
                widths.push(0);
            }
            widths[column] = widths[column].max(len);
        }
    }

    let separator: Vec<String> = (0..header.len()).map(|c| "-".repeat(widths[c])).collect();
    let mut table: Vec<&[String]> = rows.iter().map(Vec::as_slice).collect();
    table.insert(1, &separator);

    let mut out = String::new();
    for row in table {
        for (column, cell) in row.iter().enumerate() {
            out.push_str(&format!("| {:<width$} ", cell, width = widths[column]));
        }
        out.push_str("|\n");
    }
    out
}

/// Convert the body of an ODF `content.xml` document to Markdown.
pub(crate) fn content_xml_to_markdown(xml: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut depth = 0usize;
    let mut body_depth: Option<usize> = None;
    let mut open: Option<OpenBlock> = None;
    let mut blocks: Vec<String> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => {
                depth += 1;
                let tag = e.name();
                if let Some(block) = open.as_mut() {
                    block.open_child(tag.as_ref());
                } else if body_depth.is_none() && tag.as_ref() == b"office:text" {
                    body_depth = Some(depth);
                } else if body_depth.is_some_and(|body| depth == body + 1) {
                    open = BlockKind::from_tag(tag.as_ref()).map(|k| OpenBlock::new(k, depth));
                }
            }
            Event::Empty(e) => {
                if let Some(block) = open.as_mut() {
                    if e.name().as_ref() == b"table:table-cell" {
                        block.open_child(b"table:table-cell");
                        block.close_child(b"table:table-cell");
                    } else {
                        block.push_marker(&e);
                    }
                } else if body_depth == Some(depth) {
                    if let Some(kind) = BlockKind::from_tag(e.name().as_ref()) {
                        blocks.push(OpenBlock::new(kind, depth + 1).finish());
                    }
                }
            }
            Event::Text(t) => {
                if let Some(block) = open.as_mut() {
                    block.push_text(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(block) = open.as_mut() {
                    block.push_text(&String::from_utf8_lossy(&t));
                }
            }
            Event::End(e) => {
                if open.as_ref().is_some_and(|b| b.depth == depth) {
                    if let Some(block) = open.take() {
                        blocks.push(block.finish());
                    }
                } else if let Some(block) = open.as_mut() {
                    block.close_child(e.name().as_ref());
                }
                if body_depth == Some(depth) {
                    body_depth = None;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(blocks.join("\n\n"))
}

/// Extract an .odt file as Markdown.
pub fn odt_to_markdown(path: &Path) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let xml = read_zip_part(&mut archive, "content.xml")?;
    content_xml_to_markdown(&xml)
}
