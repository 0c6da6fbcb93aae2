use std::{io, path::Path, sync::Arc};

use csv::StringRecord;

use super::Result;
use crate::TrainingError;

/// One record of the source table, remembering where it sat in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub position: usize,
    pub record: StringRecord,
}

impl TableRow {
    pub fn get(&self, column: usize) -> Option<&str> {
        self.record.get(column)
    }
}

/// Header-addressed CSV table kept in original row order.
#[derive(Debug, Clone)]
pub struct DataTable {
    headers: Arc<StringRecord>,
    rows: Vec<TableRow>,
}

impl DataTable {
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|err| {
            TrainingError::initialization(format!(
                "failed to open data table {}: {err}",
                path.display()
            ))
        })?;
        Self::from_reader(file).map_err(|err| match err {
            TrainingError::ConfigFormat(msg) => {
                TrainingError::ConfigFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|err| TrainingError::ConfigFormat(format!("malformed table header: {err}")))?
            .clone();

        let mut rows = Vec::new();
        for (position, record) in reader.records().enumerate() {
            let record = record.map_err(|err| {
                TrainingError::ConfigFormat(format!("malformed table row {}: {err}", position + 1))
            })?;
            rows.push(TableRow { position, record });
        }

        Ok(Self {
            headers: Arc::new(headers),
            rows,
        })
    }

    /// Builds a table from in-memory rows; every row must match the header width.
    pub fn from_rows<S: AsRef<str>>(headers: &[S], rows: Vec<Vec<String>>) -> Result<Self> {
        let headers: StringRecord = headers.iter().map(|h| h.as_ref()).collect();
        let mut table_rows = Vec::with_capacity(rows.len());
        for (position, values) in rows.into_iter().enumerate() {
            if values.len() != headers.len() {
                return Err(TrainingError::ConfigFormat(format!(
                    "row {} has {} fields, expected {}",
                    position + 1,
                    values.len(),
                    headers.len()
                )));
            }
            table_rows.push(TableRow {
                position,
                record: StringRecord::from(values),
            });
        }
        Ok(Self {
            headers: Arc::new(headers),
            rows: table_rows,
        })
    }

    pub fn headers(&self) -> &Arc<StringRecord> {
        &self.headers
    }

    pub fn rows(&self) -> &[TableRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        column_index(&self.headers, name)
    }
}

pub(crate) fn column_index(headers: &StringRecord, name: &str) -> Option<usize> {
    headers.iter().position(|header| header == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_rows_in_file_order() {
        let csv = "frame_path,split\na.png,train\nb.png,val-new-cl\nc.png,train\n";
        let table = DataTable::from_reader(csv.as_bytes()).unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.column_index("split"), Some(1));
        let frames: Vec<&str> = table.rows().iter().filter_map(|r| r.get(0)).collect();
        assert_eq!(frames, vec!["a.png", "b.png", "c.png"]);
        assert_eq!(table.rows()[2].position, 2);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let csv = "frame_path,split\na.png,train,extra\n";
        assert!(matches!(
            DataTable::from_reader(csv.as_bytes()),
            Err(TrainingError::ConfigFormat(_))
        ));
    }
}
