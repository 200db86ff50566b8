//! Dataset acquisition and row decoding.
//!
//! [`fetch_dataset`] turns a dataset URI into a local file, downloading it at
//! most once. [`open_rows`] decodes a local CSV or Parquet file into
//! [`RawRow`]s keyed by source column name.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parquet::file::reader::SerializedFileReader;
use parquet::record::reader::RowIter;
use serde_json::{Map, Value};

use crate::error::{LoadError, LoadResult};

/// One source row, column name to raw value.
pub type RawRow = Map<String, Value>;

/// Supported on-disk dataset encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Csv,
    Parquet,
}

impl DatasetFormat {
    /// Detect the format from the file extension.
    pub fn detect(path: &Path) -> LoadResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("parquet") => Ok(Self::Parquet),
            _ => Err(LoadError::UnsupportedFormat {
                path: path.display().to_string(),
            }),
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Parquet => "parquet",
        }
    }
}

/// Where and how remote datasets are downloaded.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub data_dir: PathBuf,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

/// Resolve `uri` to a local dataset file.
///
/// `http://` and `https://` URIs are downloaded into `data_dir` under the last
/// segment of the URL path. A previous download is reused only when the
/// `.source` file next to it records the same URL. `file://` URIs and plain
/// paths are used in place.
pub fn fetch_dataset(uri: &str, options: &FetchOptions) -> LoadResult<PathBuf> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return download(uri, options);
    }
    let path = PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri));
    DatasetFormat::detect(&path)?;
    if !path.is_file() {
        return Err(LoadError::Read {
            path: path.display().to_string(),
            message: "file not found".into(),
        });
    }
    Ok(path)
}

/// Local file a remote dataset is downloaded to.
fn download_target(url: &str, data_dir: &Path) -> LoadResult<PathBuf> {
    let remote_path = url.split(['?', '#']).next().unwrap_or(url);
    let format = DatasetFormat::detect(Path::new(remote_path))?;
    let name = remote_path
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("taxi_data.{}", format.extension()));
    Ok(data_dir.join(name))
}

fn source_marker(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".source");
    PathBuf::from(name)
}

fn download(url: &str, options: &FetchOptions) -> LoadResult<PathBuf> {
    let target = download_target(url, &options.data_dir)?;
    let marker = source_marker(&target);

    let downloaded = std::fs::metadata(&target).is_ok_and(|m| m.len() > 0);
    let recorded = std::fs::read_to_string(&marker).ok();
    if downloaded && recorded.as_deref().map(str::trim) == Some(url) {
        tracing::info!(path = %target.display(), "dataset already downloaded");
        return Ok(target);
    }
    if downloaded {
        tracing::info!(
            path = %target.display(),
            previous = recorded.as_deref().unwrap_or("unknown").trim(),
            "existing download came from another source, fetching again"
        );
    }
    std::fs::create_dir_all(&options.data_dir).map_err(|source| LoadError::Io { source })?;

    tracing::info!(url, "downloading dataset");
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(options.connect_timeout)
        .timeout_read(options.read_timeout)
        .build();
    let fetch_err = |message: String| LoadError::Fetch {
        url: url.to_string(),
        message,
    };
    let response = match agent.get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(code, _)) => {
            return Err(fetch_err(format!("HTTP {code}")));
        }
        Err(ureq::Error::Transport(transport)) => {
            return Err(fetch_err(transport.to_string()));
        }
    };

    // Stream into a sibling file so an interrupted download is never reused.
    let partial = target.with_extension("part");
    let mut reader = response.into_reader();
    let file = File::create(&partial).map_err(|source| LoadError::Io { source })?;
    let mut writer = BufWriter::new(file);
    let bytes = std::io::copy(&mut reader, &mut writer)
        .map_err(|e| fetch_err(format!("download interrupted: {e}")))?;
    writer.flush().map_err(|source| LoadError::Io { source })?;
    drop(writer);
    std::fs::rename(&partial, &target).map_err(|source| LoadError::Io { source })?;
    std::fs::write(&marker, url).map_err(|source| LoadError::Io { source })?;

    tracing::info!(path = %target.display(), bytes, "download complete");
    Ok(target)
}

/// Sequential reader over the rows of a dataset file.
pub struct RowReader {
    path: PathBuf,
    rows: Box<dyn Iterator<Item = LoadResult<RawRow>>>,
    position: usize,
}

impl RowReader {
    /// Number of rows handed out so far.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next `size` rows, fewer at end of file, or `None` once exhausted.
    pub fn next_chunk(&mut self, size: usize) -> LoadResult<Option<Vec<RawRow>>> {
        let mut chunk = Vec::with_capacity(size.min(64 * 1024));
        while chunk.len() < size {
            match self.rows.next() {
                Some(row) => chunk.push(row?),
                None => break,
            }
        }
        self.position += chunk.len();
        Ok((!chunk.is_empty()).then_some(chunk))
    }
}

impl std::fmt::Debug for RowReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowReader")
            .field("path", &self.path)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// Open a local dataset for sequential row reading.
pub fn open_rows(path: &Path) -> LoadResult<RowReader> {
    let rows = match DatasetFormat::detect(path)? {
        DatasetFormat::Csv => csv_rows(path)?,
        DatasetFormat::Parquet => parquet_rows(path)?,
    };
    Ok(RowReader {
        path: path.to_path_buf(),
        rows,
        position: 0,
    })
}

fn read_err(path: &Path, e: impl std::fmt::Display) -> LoadError {
    LoadError::Read {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn csv_rows(path: &Path) -> LoadResult<Box<dyn Iterator<Item = LoadResult<RawRow>>>> {
    // Short records yield missing columns rather than a read failure.
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| read_err(path, e))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| read_err(path, e))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let owned = path.to_path_buf();
    let rows = reader.into_records().map(move |record| -> LoadResult<RawRow> {
        let record = record.map_err(|e| read_err(&owned, e))?;
        Ok(headers
            .iter()
            .zip(record.iter())
            .map(|(name, value)| (name.clone(), Value::String(value.to_string())))
            .collect())
    });
    Ok(Box::new(rows))
}

fn parquet_rows(path: &Path) -> LoadResult<Box<dyn Iterator<Item = LoadResult<RawRow>>>> {
    let file = File::open(path).map_err(|source| LoadError::Io { source })?;
    let reader = SerializedFileReader::new(file).map_err(|e| read_err(path, e))?;
    let owned = path.to_path_buf();
    let rows = RowIter::from_file_into(Box::new(reader)).map(move |row| -> LoadResult<RawRow> {
        let row = row.map_err(|e| read_err(&owned, e))?;
        match row.to_json_value() {
            Value::Object(map) => Ok(map),
            other => Err(read_err(&owned, format!("row is not a record: {other}"))),
        }
    });
    Ok(Box::new(rows))
}
