//! Record sources: an incremental reader for large JSON arrays and a
//! whole-file reader for small wrapped documents.
//!
//! The array reader holds at most one element's bytes at a time: it scans the
//! input for element boundaries (tracking nesting and string escapes) and only
//! then hands the element to `serde_json`. Consumers pull one record at a time,
//! and nothing is read past the record being requested beyond the buffered
//! reader's current chunk.

use std::path::Path;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::error::SyncError;

const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// How records are laid out in a hand-off file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLayout {
    /// A top-level JSON array, read incrementally.
    Array,
    /// An object holding the records under one field, read whole.
    Wrapped(&'static str),
}

/// Lazy, finite, non-restartable sequence of records.
pub type RecordStream = BoxStream<'static, Result<Value, SyncError>>;

/// Open `path` as a record stream according to `layout`.
pub async fn open_records(path: &Path, layout: SourceLayout) -> Result<RecordStream, SyncError> {
    match layout {
        SourceLayout::Array => Ok(JsonArrayReader::open(path).await?.into_stream().boxed()),
        SourceLayout::Wrapped(field) => {
            let bytes = tokio::fs::read(path).await?;
            let document: Value = serde_json::from_slice(&bytes).map_err(|e| SyncError::Parse {
                offset: None,
                message: format!("line {} column {}: {e}", e.line(), e.column()),
            })?;
            let records = match document {
                Value::Object(mut map) => match map.remove(field) {
                    Some(Value::Array(items)) => items,
                    _ => {
                        warn!(path = %path.display(), field, "No record array found, treating input as empty");
                        Vec::new()
                    }
                },
                _ => {
                    return Err(SyncError::parse(0, format!("expected an object holding `{field}`")));
                }
            };
            Ok(stream::iter(records.into_iter().map(Ok)).boxed())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    First,
    Rest,
    Done,
}

/// Element boundary scanner, fed one buffered chunk at a time.
#[derive(Debug, Default)]
struct Boundary {
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Boundary {
    /// Returns how many bytes of `chunk` belong to the element and whether the
    /// element ended inside this chunk.
    fn feed(&mut self, chunk: &[u8]) -> (usize, bool) {
        for (i, &b) in chunk.iter().enumerate() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return (i + 1, true);
                    }
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    if self.depth == 0 {
                        return (i, true);
                    }
                    self.depth -= 1;
                    if self.depth == 0 {
                        return (i + 1, true);
                    }
                }
                b',' if self.depth == 0 => return (i, true),
                b if self.depth == 0 && is_json_whitespace(b) => return (i, true),
                _ => {}
            }
        }
        (chunk.len(), false)
    }
}

/// Whitespace as JSON defines it; unlike `is_ascii_whitespace`, no form feed.
fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

/// Incremental reader over a JSON array of records.
pub struct JsonArrayReader<R> {
    reader: R,
    offset: u64,
    state: State,
    element: Vec<u8>,
}

impl JsonArrayReader<BufReader<File>> {
    pub async fn open(path: &Path) -> Result<Self, SyncError> {
        let file = File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> JsonArrayReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            state: State::Start,
            element: Vec::new(),
        }
    }

    /// Next element, `None` once the closing `]` has been read. After an error
    /// the reader is exhausted.
    pub async fn next_value(&mut self) -> Result<Option<Value>, SyncError> {
        match self.advance().await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.state = State::Done;
                Err(e)
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Value, SyncError>> {
        stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_value().await?.map(|value| (value, reader)))
        })
    }

    async fn advance(&mut self) -> Result<Option<Value>, SyncError> {
        match self.state {
            State::Done => return Ok(None),
            State::Start => self.open_array().await?,
            State::First | State::Rest => {}
        }

        match self.skip_whitespace().await? {
            None => return Err(SyncError::parse(self.offset, "unexpected end of input, array not closed")),
            Some(b']') => {
                self.bump();
                self.finish().await?;
                return Ok(None);
            }
            Some(b',') if self.state == State::Rest => {
                self.bump();
                match self.skip_whitespace().await? {
                    Some(b']') => return Err(SyncError::parse(self.offset, "trailing comma before `]`")),
                    None => {
                        return Err(SyncError::parse(self.offset, "unexpected end of input after `,`"));
                    }
                    Some(_) => {}
                }
            }
            Some(_) if self.state == State::First => {}
            Some(b) => {
                return Err(SyncError::parse(
                    self.offset,
                    format!("expected `,` or `]`, found `{}`", char::from(b)),
                ));
            }
        }

        let start = self.offset;
        self.read_element().await?;
        if self.element.is_empty() {
            return Err(SyncError::parse(start, "expected a value"));
        }
        let value = serde_json::from_slice(&self.element)
            .map_err(|e| SyncError::parse(start, format!("invalid element: {e}")))?;
        self.state = State::Rest;
        Ok(Some(value))
    }

    async fn open_array(&mut self) -> Result<(), SyncError> {
        if self.reader.fill_buf().await?.starts_with(&BOM) {
            self.reader.consume(BOM.len());
            self.offset += BOM.len() as u64;
        }
        match self.skip_whitespace().await? {
            Some(b'[') => {
                self.bump();
                self.state = State::First;
                Ok(())
            }
            Some(_) => Err(SyncError::parse(self.offset, "expected `[` at start of input")),
            None => Err(SyncError::parse(self.offset, "empty input, expected a JSON array")),
        }
    }

    async fn finish(&mut self) -> Result<(), SyncError> {
        self.state = State::Done;
        match self.skip_whitespace().await? {
            None => Ok(()),
            Some(_) => Err(SyncError::parse(self.offset, "trailing data after closing `]`")),
        }
    }

    async fn read_element(&mut self) -> Result<(), SyncError> {
        self.element.clear();
        let mut boundary = Boundary::default();
        loop {
            let chunk = self.reader.fill_buf().await?;
            if chunk.is_empty() {
                return Err(SyncError::parse(self.offset, "unexpected end of input inside element"));
            }
            let (used, complete) = boundary.feed(chunk);
            self.element.extend_from_slice(&chunk[..used]);
            self.reader.consume(used);
            self.offset += used as u64;
            if complete {
                return Ok(());
            }
        }
    }

    async fn peek(&mut self) -> Result<Option<u8>, SyncError> {
        Ok(self.reader.fill_buf().await?.first().copied())
    }

    fn bump(&mut self) {
        self.reader.consume(1);
        self.offset += 1;
    }

    async fn skip_whitespace(&mut self) -> Result<Option<u8>, SyncError> {
        loop {
            match self.peek().await? {
                Some(b) if is_json_whitespace(b) => self.bump(),
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;

    async fn read_all(input: &[u8], capacity: usize) -> Result<Vec<Value>, SyncError> {
        let reader = JsonArrayReader::new(BufReader::with_capacity(capacity, input));
        reader.into_stream().try_collect().await
    }

    #[tokio::test]
    async fn reads_elements_across_chunk_boundaries() {
        let input = br#" [ {"sku": "A", "tags": ["x", "]"], "n": {"q": "\"}"}},
            {"sku": "B"} , 7, "s", null ] "#;
        for capacity in [1, 2, 3, 8, 4096] {
            let values = read_all(input, capacity).await.unwrap();
            assert_eq!(
                values,
                vec![
                    json!({"sku": "A", "tags": ["x", "]"], "n": {"q": "\"}"}}),
                    json!({"sku": "B"}),
                    json!(7),
                    json!("s"),
                    json!(null),
                ],
                "capacity {capacity}"
            );
        }
    }

    #[tokio::test]
    async fn empty_array_and_bom() {
        assert!(read_all(b"[]", 16).await.unwrap().is_empty());
        let mut input = BOM.to_vec();
        input.extend_from_slice(b"\n[{\"a\":1}]\n");
        assert_eq!(read_all(&input, 16).await.unwrap(), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn yields_valid_prefix_before_truncation() {
        let input = br#"[{"sku":"A"},{"sku":"B"},{"sku":"C"},{"sku":"D""#;
        let mut reader = JsonArrayReader::new(&input[..]);
        for sku in ["A", "B", "C"] {
            assert_eq!(reader.next_value().await.unwrap(), Some(json!({"sku": sku})));
        }
        let err = reader.next_value().await.unwrap_err();
        assert!(matches!(err, SyncError::Parse { offset: Some(_), .. }), "{err}");
        // exhausted after the failure
        assert!(reader.next_value().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reports_offset_of_invalid_element() {
        let input = br#"[{"a":1}, {"a":}]"#;
        let err = read_all(input, 4).await.unwrap_err();
        match err {
            SyncError::Parse { offset, message } => {
                assert_eq!(offset, Some(10));
                assert!(message.contains("invalid element"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn rejects_malformed_structure() {
        for input in [
            &b""[..],
            b"{\"a\":1}",
            b"[1,]",
            b"[,1]",
            b"[1 2]",
            b"[1] x",
            b"[1",
            b"[{\"a\": 1}",
            b"[1,\x0c2]",
            b"\x0c[1]",
        ] {
            assert!(
                matches!(read_all(input, 8).await, Err(SyncError::Parse { .. })),
                "accepted {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[tokio::test]
    async fn wrapped_layout_reads_named_array() {
        let dir = std::env::temp_dir().join(format!("catalog-sync-source-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("brands.json");
        tokio::fs::write(&path, br#"{"brands": [{"title": "Acme"}, {"title": "Zed"}]}"#)
            .await
            .unwrap();

        let records: Vec<Value> = open_records(&path, SourceLayout::Wrapped("brands"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        let none: Vec<Value> = open_records(&path, SourceLayout::Wrapped("categories"))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(none.is_empty());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
