//! OOXML documents (docx, pptx, xlsx) to plain text or Markdown.

use calamine::{open_workbook, Data, Reader as _, Xlsx};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fs::File;
use std::path::Path;

use super::{markdown_table, read_zip_part, ExtractError};

/// Collect the text of `text_tag` runs, ending each `para_tag` with a newline.
fn collect_runs(xml: &str, text_tag: &[u8], para_tag: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.name().as_ref() == text_tag => in_text = true,
            Event::End(e) => {
                let name = e.name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if name.as_ref() == para_tag {
                    out.push('\n');
                }
            }
            Event::Empty(e) => match e.name().as_ref() {
                b"w:tab" | b"a:tab" => out.push('\t'),
                b"w:br" | b"w:cr" | b"a:br" => out.push('\n'),
                tag if tag == para_tag => out.push('\n'),
                _ => {}
            },
            Event::Text(t) if in_text => out.push_str(&t.unescape()?),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(out)
}

/// Text of a Word document, one line per paragraph.
pub fn docx_to_text(path: &Path) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let xml = read_zip_part(&mut archive, "word/document.xml")?;
    collect_runs(&xml, b"w:t", b"w:p")
}

/// Text of a presentation, one `## Slide N` section per slide.
pub fn pptx_to_text(path: &Path) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;

    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort_by_key(|(number, _)| *number);

    let mut sections = Vec::with_capacity(slides.len());
    for (number, name) in slides {
        let xml = read_zip_part(&mut archive, &name)?;
        let text = collect_runs(&xml, b"a:t", b"a:p")?;
        sections.push(format!("## Slide {number}\n\n{}", text.trim_end()));
    }

    Ok(sections.join("\n\n"))
}

/// Last column Excel allows (`XFD`), zero-based
const MAX_COLUMN: usize = 16_383;
/// Last row Excel allows, one-based
const MAX_ROW: u32 = 1_048_576;
/// Largest sheet turned into a table
const MAX_SHEET_CELLS: u64 = 2_000_000;

/// Zero-based column of a cell reference such as `C7`. `None` past `XFD`.
fn column_index(reference: &str) -> Option<usize> {
    let mut column = 0usize;
    for b in reference.bytes().take_while(u8::is_ascii_alphabetic) {
        let digit = (b.to_ascii_uppercase() - b'A' + 1) as usize;
        column = column.checked_mul(26)?.checked_add(digit)?;
        if column > MAX_COLUMN + 1 {
            return None;
        }
    }
    column.checked_sub(1)
}

/// Zero-based column and one-based row of a cell reference.
fn cell_position(reference: &str) -> Result<(usize, u32), ExtractError> {
    let bad = || ExtractError::Format(format!("bad cell reference {reference}"));
    let column = column_index(reference).ok_or_else(bad)?;
    let digits = reference.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    let row: u32 = digits.parse().map_err(|_| bad())?;
    if row == 0 || row > MAX_ROW {
        return Err(bad());
    }
    Ok((column, row))
}

/// Reject worksheets whose cell references or dimensions would not fit in a
/// table we are willing to build.
fn check_sheet_bounds(xml: &str) -> Result<(), ExtractError> {
    let mut reader = Reader::from_str(xml);
    let (mut max_column, mut max_row) = (0usize, 0u32);

    loop {
        let e = match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) => e,
            Event::Eof => break,
            _ => continue,
        };
        let key = match e.name().as_ref() {
            b"c" => "r",
            b"dimension" => "ref",
            _ => continue,
        };
        let Some(value) = e
            .try_get_attribute(key)
            .ok()
            .flatten()
            .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
        else {
            continue;
        };
        for reference in value.split(':') {
            let (column, row) = cell_position(&reference.replace('$', ""))?;
            max_column = max_column.max(column);
            max_row = max_row.max(row);
        }
    }

    let cells = (max_column as u64 + 1) * u64::from(max_row);
    if cells > MAX_SHEET_CELLS {
        return Err(ExtractError::Format(format!(
            "worksheet too large ({cells} cells)"
        )));
    }
    Ok(())
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Bool(true) => "TRUE".to_string(),
        Data::Bool(false) => "FALSE".to_string(),
        other => other.to_string(),
    }
}

/// Every sheet of a workbook as a `## name` heading followed by a pipe table.
pub fn xlsx_to_markdown(path: &Path) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(File::open(path)?)?;
    let parts: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    for part in parts {
        check_sheet_bounds(&read_zip_part(&mut archive, &part)?)?;
    }

    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let mut sections = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook.worksheet_range(&name)?;
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();
        sections.push(format!("## {name}\n\n{}", markdown_table(&rows)));
    }

    Ok(sections.join("\n\n"))
}
