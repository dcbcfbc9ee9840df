//! CSV row model shared by every stage.
//!
//! Reads are tolerant (optional UTF-8 BOM, legacy column aliases) while
//! pre-flight validation is strict: a missing required column is a config
//! error, and a duplicate or empty `string_id` rejects the whole file.

use std::collections::HashSet;
use std::path::Path;

use crate::error::{LocPipeError, Result};

/// Recognized alias sets, in discovery priority order.
const SOURCE_ALIASES: &[&str] = &["source_text", "source_zh"];
const TOKENIZED_ALIASES: &[&str] = &["tokenized_text", "tokenized_zh"];
const TARGET_ALIASES: &[&str] = &["target_text", "translated_text", "tokenized_target"];
const MAX_LEN_ALIASES: &[&str] = &["max_length_target", "max_len_target"];
const LONG_TEXT_COLUMN: &str = "is_long_text";

/// One localization string with its pipeline state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    pub string_id: String,
    pub source_text: String,
    pub tokenized_text: String,
    pub target_text: String,
    pub rehydrated_text: String,
    pub max_length_target: Option<u32>,
    pub is_long_text: bool,
    /// Unrecognized columns, passed through unchanged in order.
    pub extra: Vec<(String, String)>,
}

/// Rows plus the column names they were read with, so writers can keep the
/// file's own vocabulary.
#[derive(Debug, Clone)]
pub struct RowFile {
    pub rows: Vec<Row>,
    pub source_column: String,
    pub tokenized_column: Option<String>,
    pub target_column: Option<String>,
    pub max_length_column: Option<String>,
    pub long_text_column: Option<String>,
    pub rehydrated_column: Option<String>,
    pub extra_columns: Vec<String>,
}

impl RowFile {
    /// A file shell with default column names, for rows built in memory.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            source_column: "source_text".to_string(),
            tokenized_column: None,
            target_column: None,
            max_length_column: None,
            long_text_column: None,
            rehydrated_column: None,
            extra_columns: Vec::new(),
        }
    }

    /// The tokenized column name to write, matching the source vocabulary
    /// (`tokenized_zh` for `source_zh` files).
    pub fn tokenized_column_name(&self) -> String {
        if let Some(name) = &self.tokenized_column {
            return name.clone();
        }
        if self.source_column == "source_zh" {
            "tokenized_zh".to_string()
        } else {
            "tokenized_text".to_string()
        }
    }

    /// Column order for writing.
    fn header_row(&self) -> Vec<String> {
        let mut headers = vec!["string_id".to_string(), self.source_column.clone()];
        if let Some(name) = &self.tokenized_column {
            headers.push(name.clone());
        }
        if let Some(name) = &self.max_length_column {
            headers.push(name.clone());
        }
        if let Some(name) = &self.long_text_column {
            headers.push(name.clone());
        }
        headers.extend(self.extra_columns.iter().cloned());
        if let Some(name) = &self.target_column {
            headers.push(name.clone());
        }
        if let Some(name) = &self.rehydrated_column {
            headers.push(name.clone());
        }
        headers
    }
}

fn find_alias<'a>(headers: &'a [String], aliases: &[&str]) -> Option<&'a String> {
    for alias in aliases {
        if let Some(h) = headers.iter().find(|h| h.as_str() == *alias) {
            return Some(h);
        }
    }
    None
}

/// Locate the target column: a known alias or any `target_<lang>` column,
/// first discovered wins.
fn find_target_column(headers: &[String]) -> Option<String> {
    for h in headers {
        if TARGET_ALIASES.contains(&h.as_str()) || h.starts_with("target_") {
            return Some(h.clone());
        }
    }
    None
}

/// Read a CSV file into rows, running pre-flight validation.
pub fn read_rows(path: impl AsRef<Path>) -> Result<RowFile> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| LocPipeError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(&raw);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(false)
        .from_reader(raw.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if !headers.iter().any(|h| h == "string_id") {
        return Err(LocPipeError::Config(
            "input CSV is missing required column 'string_id'".to_string(),
        ));
    }
    let source_column = find_alias(&headers, SOURCE_ALIASES)
        .cloned()
        .ok_or_else(|| {
            LocPipeError::Config(
                "input CSV is missing required column 'source_text' (or legacy 'source_zh')"
                    .to_string(),
            )
        })?;

    let tokenized_column = find_alias(&headers, TOKENIZED_ALIASES).cloned();
    let target_column = find_target_column(&headers);
    let max_length_column = find_alias(&headers, MAX_LEN_ALIASES).cloned();
    let long_text_column = headers.iter().find(|h| h.as_str() == LONG_TEXT_COLUMN).cloned();

    let recognized: HashSet<&str> = ["string_id", source_column.as_str()]
        .into_iter()
        .chain(tokenized_column.as_deref())
        .chain(target_column.as_deref())
        .chain(max_length_column.as_deref())
        .chain(long_text_column.as_deref())
        .collect();
    let extra_columns: Vec<String> = headers
        .iter()
        .filter(|h| !recognized.contains(h.as_str()))
        .cloned()
        .collect();

    let mut rows = Vec::new();
    let mut seen_ids = HashSet::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let row_num = idx + 2; // header is line 1
        let field = |name: &str| -> String {
            headers
                .iter()
                .position(|h| h == name)
                .and_then(|i| record.get(i))
                .unwrap_or("")
                .to_string()
        };

        let string_id = field("string_id").trim().to_string();
        if string_id.is_empty() {
            return Err(LocPipeError::InputValidation(format!(
                "row {}: empty string_id",
                row_num
            )));
        }
        if !seen_ids.insert(string_id.clone()) {
            return Err(LocPipeError::InputValidation(format!(
                "row {}: duplicate string_id '{}'",
                row_num, string_id
            )));
        }

        let max_length_target = max_length_column
            .as_deref()
            .map(field)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0);
        let is_long_text = long_text_column
            .as_deref()
            .map(field)
            .map(|v| v.trim() == "1")
            .unwrap_or(false);

        let extra = extra_columns
            .iter()
            .map(|c| (c.clone(), field(c)))
            .collect();

        rows.push(Row {
            string_id,
            source_text: field(&source_column),
            tokenized_text: tokenized_column.as_deref().map(field).unwrap_or_default(),
            target_text: target_column.as_deref().map(field).unwrap_or_default(),
            rehydrated_text: String::new(),
            max_length_target,
            is_long_text,
            extra,
        });
    }

    Ok(RowFile {
        rows,
        source_column,
        tokenized_column,
        target_column,
        max_length_column,
        long_text_column,
        rehydrated_column: None,
        extra_columns,
    })
}

/// Write rows back out with the file's column vocabulary.
pub fn write_rows(path: impl AsRef<Path>, file: &RowFile) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    let headers = file.header_row();
    writer.write_record(&headers)?;

    for row in &file.rows {
        let mut record: Vec<String> = vec![row.string_id.clone(), row.source_text.clone()];
        if file.tokenized_column.is_some() {
            record.push(row.tokenized_text.clone());
        }
        if file.max_length_column.is_some() {
            record.push(
                row.max_length_target
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        if file.long_text_column.is_some() {
            record.push(if row.is_long_text { "1" } else { "0" }.to_string());
        }
        for name in &file.extra_columns {
            let value = row
                .extra
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            record.push(value);
        }
        if file.target_column.is_some() {
            record.push(row.target_text.clone());
        }
        if file.rehydrated_column.is_some() {
            record.push(row.rehydrated_text.clone());
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_read_basic() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "string_id,source_text,max_length_target,is_long_text,scene\n\
             A,Hello {0},10,0,menu\n\
             B,Long body text,,1,dialog\n",
        );
        let file = read_rows(&path).unwrap();
        assert_eq!(file.rows.len(), 2);
        assert_eq!(file.rows[0].string_id, "A");
        assert_eq!(file.rows[0].max_length_target, Some(10));
        assert!(!file.rows[0].is_long_text);
        assert!(file.rows[1].is_long_text);
        assert_eq!(file.rows[0].extra, vec![("scene".to_string(), "menu".to_string())]);
        assert_eq!(file.extra_columns, vec!["scene"]);
    }

    #[test]
    fn test_read_with_bom_and_legacy_columns() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "\u{feff}string_id,source_zh,max_len_target\nA,你好{0},12\n",
        );
        let file = read_rows(&path).unwrap();
        assert_eq!(file.source_column, "source_zh");
        assert_eq!(file.rows[0].source_text, "你好{0}");
        assert_eq!(file.rows[0].max_length_target, Some(12));
        assert_eq!(file.tokenized_column_name(), "tokenized_zh");
    }

    #[test]
    fn test_missing_source_column_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "input.csv", "string_id,text\nA,hi\n");
        let err = read_rows(&path).unwrap_err();
        assert!(matches!(err, LocPipeError::Config(_)));
    }

    #[test]
    fn test_missing_string_id_column_is_config_error() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "input.csv", "id,source_text\nA,hi\n");
        let err = read_rows(&path).unwrap_err();
        assert!(matches!(err, LocPipeError::Config(_)));
    }

    #[test]
    fn test_duplicate_string_id_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "string_id,source_text\nA,one\nA,two\n",
        );
        let err = read_rows(&path).unwrap_err();
        assert!(matches!(err, LocPipeError::InputValidation(_)));
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_empty_string_id_rejects_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(&tmp, "input.csv", "string_id,source_text\n,orphan\n");
        let err = read_rows(&path).unwrap_err();
        assert!(matches!(err, LocPipeError::InputValidation(_)));
    }

    #[test]
    fn test_target_column_discovery_order() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "string_id,source_text,target_ru,translated_text\nA,hi,privet,ignored\n",
        );
        let file = read_rows(&path).unwrap();
        // First discovered wins; target_ru comes before translated_text.
        assert_eq!(file.target_column.as_deref(), Some("target_ru"));
        assert_eq!(file.rows[0].target_text, "privet");
    }

    #[test]
    fn test_round_trip_preserves_extras_and_order() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "string_id,source_text,scene,note\nA,hi,menu,first\nB,yo,hud,second\n",
        );
        let file = read_rows(&path).unwrap();
        let out = tmp.path().join("out.csv");
        write_rows(&out, &file).unwrap();

        let reread = read_rows(&out).unwrap();
        assert_eq!(reread.rows.len(), 2);
        assert_eq!(reread.rows[0].extra[0], ("scene".to_string(), "menu".to_string()));
        assert_eq!(reread.rows[1].extra[1], ("note".to_string(), "second".to_string()));
        // Order preserved.
        assert_eq!(reread.rows[0].string_id, "A");
        assert_eq!(reread.rows[1].string_id, "B");
    }

    #[test]
    fn test_write_draft_with_tokenized_column() {
        let tmp = TempDir::new().unwrap();
        let mut file = RowFile::new(vec![Row {
            string_id: "A".to_string(),
            source_text: "Hello {0}".to_string(),
            tokenized_text: "Hello ⟦PH_1⟧".to_string(),
            ..Row::default()
        }]);
        file.tokenized_column = Some("tokenized_text".to_string());
        let out = tmp.path().join("draft.csv");
        write_rows(&out, &file).unwrap();

        let reread = read_rows(&out).unwrap();
        assert_eq!(reread.rows[0].tokenized_text, "Hello ⟦PH_1⟧");
    }

    #[test]
    fn test_zero_max_length_treated_as_unset() {
        let tmp = TempDir::new().unwrap();
        let path = write_file(
            &tmp,
            "input.csv",
            "string_id,source_text,max_length_target\nA,hi,0\n",
        );
        let file = read_rows(&path).unwrap();
        assert_eq!(file.rows[0].max_length_target, None);
    }
}
