//! CSV output used by `Query2CSV`

use std::fs::File;
use std::path::Path;

use crate::value::{QueryResult, Value};
use crate::Result;

/// Format a cell the way extracts are expected downstream: integers plain,
/// floats without scientific notation, bytes transcoded to UTF-8 and trimmed.
pub fn format_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.fract() != 0.0 => format!("{f:.6}"),
        Value::Float(f) => format!("{f:.0}"),
        Value::Bytes(bytes) => bytes_to_utf8(bytes).trim().to_string(),
        other => other.to_string(),
    }
}

/// Decode bytes as UTF-8, falling back to latin-1 byte for byte.
pub fn bytes_to_utf8(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|b| char::from(*b)).collect(),
    }
}

/// Incremental CSV writer, header first then one record per row.
pub struct CsvSink {
    writer: csv::Writer<File>,
    rows: u64,
}

impl CsvSink {
    pub fn create(path: &Path, columns: &[String]) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(columns)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write_row<'a, I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        self.writer
            .write_record(values.into_iter().map(format_cell))?;
        self.rows += 1;
        Ok(())
    }

    /// Write a record whose cells are already rendered
    pub fn write_text_row<I, S>(&mut self, cells: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer.write_record(cells)?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u64> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

/// Write a fully materialized result set.
pub fn write_csv(path: &Path, result: &QueryResult) -> Result<u64> {
    let mut sink = CsvSink::create(path, &result.columns)?;
    for row in &result.rows {
        sink.write_row(
            result
                .columns
                .iter()
                .map(|col| row.get(col).unwrap_or(&Value::Null)),
        )?;
    }
    sink.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Row;

    #[test]
    fn floats_and_bytes() {
        assert_eq!(format_cell(&Value::Float(12.0)), "12");
        assert_eq!(format_cell(&Value::Float(1234567890123.5)), "1234567890123.500000");
        assert_eq!(format_cell(&Value::Bytes(vec![0x20, 0x53, 0xe3, 0x6f, 0x20])), "São");
        assert_eq!(format_cell(&Value::Null), "");
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/data.csv");
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(1));
        row.insert("name".into(), Value::from("a,b"));
        let result = QueryResult::new(vec!["id".into(), "name".into()], vec![row]);

        let written = write_csv(&path, &result).unwrap();

        assert_eq!(written, 1);
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(content, "id,name\n1,\"a,b\"\n");
    }
}
