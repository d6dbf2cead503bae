//! Buffered CSV writer for selected item keys

use frame_pipeline_core::{
    parse_params, Item, Outputs, Params, Value, Worker, WorkerContext, WorkerError,
};
use serde::Deserialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
struct KeyWriterParams {
    keys: Vec<String>,
    filenames: Vec<String>,
    #[serde(default)]
    keys_headers: Vec<Option<String>>,
    #[serde(default = "default_buffer_size")]
    buffer_size: usize,
    #[serde(default)]
    additional_data: Vec<String>,
    #[serde(default = "default_separator")]
    field_separator: String,
}

fn default_buffer_size() -> usize {
    100
}

fn default_separator() -> String {
    ",".to_string()
}

type Record = Vec<String>;

/// One key routed to one output file
#[derive(Debug)]
struct KeySink {
    key: String,
    path: PathBuf,
    header: Option<String>,
    pending: Vec<Record>,
}

/// Appends the values of selected keys to CSV files in the output directory
///
/// Every row starts with the video id and frame number, followed by any
/// `additional_data` fields, then the value itself. Lists become one row,
/// lists of lists one row per inner list. Rows are buffered and written
/// every `buffer_size` rows and on shutdown. Fields are written unquoted.
#[derive(Debug)]
pub struct WriteKeysToFiles {
    name: String,
    sinks: Vec<KeySink>,
    buffer_size: usize,
    additional_data: Vec<String>,
    delimiter: u8,
}

impl Default for WriteKeysToFiles {
    fn default() -> Self {
        Self {
            name: String::new(),
            sinks: Vec::new(),
            buffer_size: default_buffer_size(),
            additional_data: Vec::new(),
            delimiter: b',',
        }
    }
}

impl Worker for WriteKeysToFiles {
    fn initialize(&mut self, ctx: &WorkerContext, params: &Params) -> Result<(), WorkerError> {
        self.name = ctx.name.clone();
        let parsed: KeyWriterParams = parse_params(params)?;

        if parsed.keys.len() != parsed.filenames.len() {
            return Err(WorkerError::InvalidParams(format!(
                "{} keys but {} filenames",
                parsed.keys.len(),
                parsed.filenames.len()
            )));
        }
        if parsed.buffer_size == 0 {
            return Err(WorkerError::InvalidParams(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        let &[delimiter] = parsed.field_separator.as_bytes() else {
            return Err(WorkerError::InvalidParams(format!(
                "field_separator must be a single byte, got '{}'",
                parsed.field_separator
            )));
        };

        let mut headers = parsed.keys_headers.into_iter();
        self.sinks = parsed
            .keys
            .into_iter()
            .zip(parsed.filenames)
            .map(|(key, filename)| KeySink {
                key,
                path: ctx.out_path().join(filename),
                header: headers.next().flatten(),
                pending: Vec::new(),
            })
            .collect();
        self.buffer_size = parsed.buffer_size;
        self.additional_data = parsed.additional_data;
        self.delimiter = delimiter;

        info!(
            worker = %self.name,
            "Initialized with {} key-file pairs, buffer size: {}",
            self.sinks.len(),
            self.buffer_size
        );
        Ok(())
    }

    fn startup(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        std::fs::create_dir_all(ctx.out_path())?;
        Ok(())
    }

    fn run(&mut self, item: Option<Item>, out: &Outputs) -> Result<(), WorkerError> {
        let item = item.ok_or_else(|| WorkerError::Other("expected an item".to_string()))?;
        let prefix = self.row_prefix(&item);

        for idx in 0..self.sinks.len() {
            let Some(value) = item.get(&self.sinks[idx].key) else {
                continue;
            };
            let rows = format_rows(&prefix, value);
            let sink = &mut self.sinks[idx];
            sink.pending.extend(rows);

            if sink.pending.len() >= self.buffer_size {
                if let Err(e) = self.flush_sink(idx) {
                    error!(worker = %self.name, error = %e, "Error writing buffered rows");
                }
            }
        }

        out.done_with_item(item)
    }

    fn shutdown(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        let mut first_error = None;
        for idx in 0..self.sinks.len() {
            if let Err(e) = self.flush_sink(idx) {
                error!(worker = %self.name, error = %e, "Error writing buffered rows");
                first_error.get_or_insert(e);
            }
        }
        info!(worker = %self.name, "Shutting down WriteKeysToFiles worker");
        first_error.map_or(Ok(()), Err)
    }
}

impl WriteKeysToFiles {
    fn row_prefix(&self, item: &Item) -> Record {
        let video_id = item
            .video_info()
            .map_or_else(|| "unknown".to_string(), |info| info.id);
        let frame_number = item.frame_number().unwrap_or(-1);

        let mut prefix = Vec::with_capacity(2 + self.additional_data.len());
        prefix.push(video_id);
        prefix.push(frame_number.to_string());
        for key in &self.additional_data {
            prefix.push(item.get(key).map(scalar_text).unwrap_or_default());
        }
        prefix
    }

    fn header_record(&self, header: &str) -> Record {
        let mut record = vec!["video_id".to_string(), "frame_number".to_string()];
        record.extend(self.additional_data.iter().cloned());
        record.push(header.to_string());
        record
    }

    /// Append pending rows in one write, header first if the file is new
    ///
    /// Rows stay pending only when the file could not be opened, so a retry
    /// never writes a row twice.
    fn flush_sink(&mut self, idx: usize) -> Result<(), WorkerError> {
        if self.sinks[idx].pending.is_empty() {
            return Ok(());
        }
        let header = self.sinks[idx]
            .header
            .as_deref()
            .map(|h| self.header_record(h));
        let delimiter = self.delimiter;
        let sink = &mut self.sinks[idx];

        let is_new = !sink.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink.path)?;

        let rows = std::mem::take(&mut sink.pending);
        let header = header.filter(|_| is_new);
        let contents = encode_rows(delimiter, header.iter().chain(&rows))?;
        if let Err(e) = file.write_all(&contents) {
            warn!(
                "Dropped {} rows after a failed write to {}",
                rows.len(),
                sink.path.display()
            );
            return Err(e.into());
        }

        debug!("Wrote {} rows to {}", rows.len(), sink.path.display());
        Ok(())
    }
}

/// Serialize records into one buffer, unquoted, `\n` terminated
fn encode_rows<'a>(
    delimiter: u8,
    rows: impl IntoIterator<Item = &'a Record>,
) -> Result<Vec<u8>, WorkerError> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .quote_style(csv::QuoteStyle::Never)
        .flexible(true)
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row).map_err(csv_error)?;
    }
    writer
        .into_inner()
        .map_err(|e| WorkerError::Other(format!("CSV buffer error: {}", e.error())))
}

fn csv_error(err: csv::Error) -> WorkerError {
    WorkerError::Other(format!("CSV error: {err}"))
}

/// Render a value as CSV rows behind `prefix`
fn format_rows(prefix: &[String], value: &Value) -> Vec<Record> {
    let row = |fields: &mut dyn Iterator<Item = String>| -> Record {
        prefix.iter().cloned().chain(fields).collect()
    };
    let list = match value {
        Value::Json(serde_json::Value::Array(list)) => list,
        other => return vec![row(&mut std::iter::once(scalar_text(other)))],
    };
    if list.is_empty() {
        return Vec::new();
    }

    if list[0].is_array() {
        list.iter()
            .map(|inner| match inner {
                serde_json::Value::Array(fields) => row(&mut fields.iter().map(json_text)),
                other => row(&mut std::iter::once(json_text(other))),
            })
            .collect()
    } else {
        vec![row(&mut list.iter().map(json_text))]
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Json(json) => json_text(json),
        Value::Frame(_) => value.describe(),
    }
}

/// Strings unquoted, everything else as compact JSON
fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{capture, context, emitted, params};
    use serde_json::json;

    fn frame_item(frame_number: i64) -> Item {
        Item::new()
            .with(
                "video_info",
                json!({"id": "cam7", "fps": 10.0, "width": 4, "height": 4}),
            )
            .with("frame_number", frame_number)
            .with("camera", "north")
            .with("boxes", json!([[0, 0, 5, 5], [1, 1, 2, 2]]))
            .with("count", 2i64)
    }

    fn strings(fields: &[&str]) -> Record {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_format_rows() {
        let prefix = strings(&["v", "1"]);

        let nested = Value::Json(json!([[1, 2], [3, 4]]));
        assert_eq!(
            format_rows(&prefix, &nested),
            vec![strings(&["v", "1", "1", "2"]), strings(&["v", "1", "3", "4"])]
        );

        let flat = Value::Json(json!(["a", 2.5]));
        assert_eq!(format_rows(&prefix, &flat), vec![strings(&["v", "1", "a", "2.5"])]);

        assert!(format_rows(&prefix, &Value::Json(json!([]))).is_empty());
        assert_eq!(
            format_rows(&prefix, &Value::Json(json!("text"))),
            vec![strings(&["v", "1", "text"])]
        );
    }

    #[test]
    fn test_encode_rows_uses_separator_unquoted() {
        let rows = vec![
            strings(&["v", "1", "a b", "x,y"]),
            strings(&["v", "2", "c"]),
        ];
        let bytes = encode_rows(b';', &rows).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "v;1;a b;x,y\nv;2;c\n");
    }

    #[test]
    fn test_buffers_and_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("writer", false, dir.path());
        let mut worker = WriteKeysToFiles::default();
        worker
            .initialize(
                &ctx,
                &params(json!({
                    "keys": ["boxes", "count"],
                    "filenames": ["boxes.csv", "count.csv"],
                    "keys_headers": ["x1,y1,x2,y2", null],
                    "buffer_size": 3,
                    "additional_data": ["camera"]
                })),
            )
            .unwrap();
        worker.startup(&ctx).unwrap();

        let (out, rx) = capture("writer");
        worker.run(Some(frame_item(1)), &out).unwrap();
        worker.run(Some(frame_item(2)), &out).unwrap();

        // Four box lines exceed the buffer; the count lines are still pending
        let boxes = std::fs::read_to_string(dir.path().join("boxes.csv")).unwrap();
        assert_eq!(
            boxes,
            "video_id,frame_number,camera,x1,y1,x2,y2\n\
             cam7,1,north,0,0,5,5\n\
             cam7,1,north,1,1,2,2\n\
             cam7,2,north,0,0,5,5\n\
             cam7,2,north,1,1,2,2\n"
        );
        assert!(!dir.path().join("count.csv").exists());

        worker.shutdown(&ctx).unwrap();
        let counts = std::fs::read_to_string(dir.path().join("count.csv")).unwrap();
        assert_eq!(counts, "cam7,1,north,2\ncam7,2,north,2\n");
        assert_eq!(emitted(&rx).len(), 2);
    }

    #[test]
    fn test_header_only_for_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("count.csv"), "existing\n").unwrap();
        let ctx = context("writer", false, dir.path());
        let mut worker = WriteKeysToFiles::default();
        worker
            .initialize(
                &ctx,
                &params(json!({
                    "keys": ["count"],
                    "filenames": ["count.csv"],
                    "keys_headers": ["count"]
                })),
            )
            .unwrap();

        let (out, _rx) = capture("writer");
        worker
            .run(Some(Item::new().with("count", 3i64)), &out)
            .unwrap();
        worker.shutdown(&ctx).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("count.csv")).unwrap();
        assert_eq!(contents, "existing\nunknown,-1,3\n");
    }

    #[test]
    fn test_multi_byte_separator_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("writer", false, dir.path());
        for separator in ["", "::", "\u{2192}"] {
            let err = WriteKeysToFiles::default()
                .initialize(
                    &ctx,
                    &params(json!({
                        "keys": ["a"],
                        "filenames": ["a.csv"],
                        "field_separator": separator
                    })),
                )
                .unwrap_err();
            assert!(matches!(err, WorkerError::InvalidParams(_)), "{separator:?}");
        }
    }

    #[test]
    fn test_failed_flush_never_duplicates_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("writer", false, dir.path());
        let mut worker = WriteKeysToFiles::default();
        worker
            .initialize(
                &ctx,
                &params(json!({
                    "keys": ["count"],
                    "filenames": ["count.csv"],
                    "field_separator": "\t",
                    "buffer_size": 1
                })),
            )
            .unwrap();

        // A directory in the way makes the first flush fail to open the file
        let path = dir.path().join("count.csv");
        std::fs::create_dir(&path).unwrap();

        let (out, rx) = capture("writer");
        let row = |n: i64| Item::new().with("frame_number", n).with("count", n * 10);
        worker.run(Some(row(1)), &out).unwrap();
        assert!(path.is_dir());

        std::fs::remove_dir(&path).unwrap();
        worker.run(Some(row(2)), &out).unwrap();
        worker.run(Some(row(3)), &out).unwrap();
        worker.shutdown(&ctx).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "unknown\t1\t10\nunknown\t2\t20\nunknown\t3\t30\n");
        assert_eq!(emitted(&rx).len(), 3);
    }

    #[test]
    fn test_mismatched_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context("writer", false, dir.path());
        let err = WriteKeysToFiles::default()
            .initialize(&ctx, &params(json!({"keys": ["a", "b"], "filenames": ["a.csv"]})))
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidParams(_)));
    }
}
