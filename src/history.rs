//! History files.
//!
//! A closed state system is saved to a history file, so that later runs on
//! the same trace load it instead of rebuilding it. Each (trace, analysis)
//! pair has its own file in a history directory, named
//! `<trace>@<analysis>.ht`.
//!
//! A history file starts with the `STHT` magic, followed by varint
//! length-delimited protobuf records: a header, the attribute tree, then
//! every interval, attribute by attribute.
//!
//! A history is only loaded by the analysis version and configuration it
//! was built with, see `HistoryKey`.

use std::{
    fmt::Display,
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::debug;
use nom::{
    bytes::complete::{tag, take_while1},
    combinator::eof,
    IResult,
};
use prost::Message;
use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};

use crate::state::{
    store::IntervalStore, AttributeTree, CustomValueRegistry, Quark, StateInterval, StateSystem,
    StateSystemConfig, StateSystemError, StateValue,
};

const MAGIC: &[u8; 4] = b"STHT";
/// Layout version of history files, independent of provider versions.
pub const FORMAT_VERSION: u32 = 1;
const EXTENSION: &str = "ht";
const MAX_RECORD_LEN: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot decode history record: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("corrupt history file: {0}")]
    Corrupt(String),
    #[error("history built by version {found} of '{analysis}', version {expected} expected")]
    VersionMismatch {
        analysis: String,
        found: u32,
        expected: u32,
    },
    #[error("history of analysis '{found}', '{expected}' expected")]
    WrongAnalysis { found: String, expected: String },
    #[error("history of '{analysis}' built with another configuration")]
    ConfigMismatch { analysis: String },
    #[error("invalid history file name '{0}'")]
    InvalidName(String),
    #[error("state system cannot be saved: {0}")]
    Incomplete(#[from] StateSystemError),
}

impl HistoryError {
    /// Returns true if the history file is unusable but can be rebuilt, as
    /// opposed to a storage failure.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            HistoryError::Decode(_)
                | HistoryError::Corrupt(_)
                | HistoryError::VersionMismatch { .. }
                | HistoryError::WrongAnalysis { .. }
                | HistoryError::ConfigMismatch { .. }
        )
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct HistoryHeader {
    #[prost(uint32, tag = "1")]
    pub format: u32,
    #[prost(string, tag = "2")]
    pub analysis_id: String,
    #[prost(uint32, tag = "3")]
    pub provider_version: u32,
    #[prost(string, tag = "4")]
    pub trace_name: String,
    #[prost(uint64, tag = "5")]
    pub start: u64,
    #[prost(uint64, tag = "6")]
    pub end: u64,
    #[prost(int64, tag = "7")]
    pub created_unix_ns: i64,
    #[prost(uint64, tag = "8")]
    pub attribute_count: u64,
    #[prost(uint64, tag = "9")]
    pub interval_count: u64,
    #[prost(string, tag = "10")]
    pub provider_config: String,
}

/// Identifies what built a history: an analysis, its version and its
/// configuration. A history is only loaded under the key it was saved with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryKey {
    pub analysis_id: String,
    pub version: u32,
    pub config: String,
}

impl HistoryKey {
    pub fn new(analysis_id: &str, version: u32) -> Self {
        Self {
            analysis_id: analysis_id.to_string(),
            version,
            config: String::new(),
        }
    }

    pub fn with_config(mut self, config: &str) -> Self {
        self.config = config.to_string();
        self
    }

    fn check(&self, header: &HistoryHeader) -> Result<(), HistoryError> {
        if header.analysis_id != self.analysis_id {
            return Err(HistoryError::WrongAnalysis {
                found: header.analysis_id.clone(),
                expected: self.analysis_id.clone(),
            });
        }

        if header.provider_version != self.version {
            return Err(HistoryError::VersionMismatch {
                analysis: header.analysis_id.clone(),
                found: header.provider_version,
                expected: self.version,
            });
        }

        if header.provider_config != self.config {
            return Err(HistoryError::ConfigMismatch {
                analysis: header.analysis_id.clone(),
            });
        }

        Ok(())
    }
}

impl HistoryHeader {
    /// Creation date, formatted for humans.
    pub fn created(&self) -> String {
        let date_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

        OffsetDateTime::from_unix_timestamp_nanos(self.created_unix_ns as i128)
            .ok()
            .and_then(|d| d.format(&date_format).ok())
            .unwrap_or_else(|| String::from("unknown"))
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeRecord {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Parent quark, -1 for attributes at the root.
    #[prost(sint32, tag = "2")]
    pub parent: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeTreeRecord {
    #[prost(message, repeated, tag = "1")]
    pub attributes: Vec<AttributeRecord>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CustomValueRecord {
    #[prost(uint32, tag = "1")]
    pub type_id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum IntervalValue {
    #[prost(int32, tag = "4")]
    Int(i32),
    #[prost(int64, tag = "5")]
    Long(i64),
    #[prost(double, tag = "6")]
    Double(f64),
    #[prost(string, tag = "7")]
    Str(String),
    #[prost(message, tag = "8")]
    Custom(CustomValueRecord),
}

/// An interval; a missing value stands for `Null`.
#[derive(Clone, PartialEq, Message)]
pub struct IntervalRecord {
    #[prost(uint32, tag = "1")]
    pub quark: u32,
    #[prost(uint64, tag = "2")]
    pub start: u64,
    #[prost(uint64, tag = "3")]
    pub end: u64,
    #[prost(oneof = "IntervalValue", tags = "4, 5, 6, 7, 8")]
    pub value: Option<IntervalValue>,
}

impl From<&StateInterval> for IntervalRecord {
    fn from(interval: &StateInterval) -> Self {
        let value = match &interval.value {
            StateValue::Null | StateValue::Unknown => None,
            StateValue::Int(v) => Some(IntervalValue::Int(*v)),
            StateValue::Long(v) => Some(IntervalValue::Long(*v)),
            StateValue::Double(v) => Some(IntervalValue::Double(*v)),
            StateValue::String(v) => Some(IntervalValue::Str(v.clone())),
            StateValue::Custom(v) => Some(IntervalValue::Custom(CustomValueRecord {
                type_id: v.custom_type_id() as u32,
                data: v.to_bytes(),
            })),
        };

        Self {
            quark: interval.quark.index() as u32,
            start: interval.start,
            end: interval.end.unwrap_or(interval.start),
            value,
        }
    }
}

fn decode_value(
    value: Option<IntervalValue>,
    registry: &CustomValueRegistry,
) -> Result<StateValue, HistoryError> {
    let ret = match value {
        None => StateValue::Null,
        Some(IntervalValue::Int(v)) => StateValue::Int(v),
        Some(IntervalValue::Long(v)) => StateValue::Long(v),
        Some(IntervalValue::Double(v)) => StateValue::Double(v),
        Some(IntervalValue::Str(v)) => StateValue::String(v),
        Some(IntervalValue::Custom(c)) => u8::try_from(c.type_id)
            .ok()
            .and_then(|id| registry.decode(id, &c.data))
            .ok_or_else(|| {
                HistoryError::Corrupt(format!("cannot decode custom value of type {}", c.type_id))
            })?,
    };

    Ok(ret)
}

fn write_record<M: Message, W: Write>(w: &mut W, msg: &M) -> Result<(), HistoryError> {
    let mut buf = Vec::with_capacity(msg.encoded_len() + 10);
    msg.encode_length_delimited(&mut buf)
        .map_err(|e| HistoryError::Corrupt(e.to_string()))?;

    w.write_all(&buf)?;

    Ok(())
}

/// Reads the next length-delimited record. Returns `None` at the end of the
/// stream.
fn read_record<M: Message + Default, R: Read>(r: &mut R) -> Result<Option<M>, HistoryError> {
    let mut length: u64 = 0;
    let mut byte = [0u8; 1];

    for i in 0..10 {
        match r.read_exact(&mut byte) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && i == 0 => return Ok(None),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(HistoryError::Corrupt(String::from("truncated record length")))
            }
            Err(e) => return Err(e.into()),
        }

        length |= ((byte[0] & 0x7F) as u64) << (i * 7);

        if byte[0] & 0x80 == 0 {
            break;
        }
    }

    if length > MAX_RECORD_LEN {
        return Err(HistoryError::Corrupt(format!("record too large ({} bytes)", length)));
    }

    let mut buf = vec![0u8; length as usize];
    match r.read_exact(&mut buf) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(HistoryError::Corrupt(String::from("truncated record")))
        }
        Err(e) => return Err(e.into()),
    }

    Ok(Some(M::decode(buf.as_slice())?))
}

fn expect_record<M: Message + Default, R: Read>(r: &mut R, what: &str) -> Result<M, HistoryError> {
    read_record(r)?.ok_or_else(|| HistoryError::Corrupt(format!("missing {}", what)))
}

/// Writes a closed state system.
pub fn write_history<W: Write>(
    w: &mut W,
    key: &HistoryKey,
    trace_name: &str,
    ss: &StateSystem,
) -> Result<HistoryHeader, HistoryError> {
    ss.with_parts(|tree, store| -> Result<HistoryHeader, HistoryError> {
        let header = HistoryHeader {
            format: FORMAT_VERSION,
            analysis_id: key.analysis_id.clone(),
            provider_version: key.version,
            provider_config: key.config.clone(),
            trace_name: trace_name.to_string(),
            start: store.start_time(),
            end: store.end_time(),
            created_unix_ns: OffsetDateTime::now_utc().unix_timestamp_nanos() as i64,
            attribute_count: tree.len() as u64,
            interval_count: store.interval_count() as u64,
        };

        w.write_all(MAGIC)?;
        write_record(w, &header)?;

        let attributes = tree
            .entries()
            .map(|(name, parent)| AttributeRecord {
                name: name.to_string(),
                parent: Quark::to_raw(parent),
            })
            .collect();
        write_record(w, &AttributeTreeRecord { attributes })?;

        for interval in store.intervals() {
            write_record(w, &IntervalRecord::from(&interval))?;
        }

        Ok(header)
    })?
}

fn read_header<R: Read>(r: &mut R) -> Result<HistoryHeader, HistoryError> {
    let mut magic = [0u8; 4];

    match r.read_exact(&mut magic) {
        Ok(_) if &magic == MAGIC => {}
        Ok(_) => return Err(HistoryError::Corrupt(String::from("not a history file"))),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            return Err(HistoryError::Corrupt(String::from("not a history file")))
        }
        Err(e) => return Err(e.into()),
    }

    let header: HistoryHeader = expect_record(r, "header")?;

    if header.format != FORMAT_VERSION {
        return Err(HistoryError::Corrupt(format!(
            "unsupported format {}",
            header.format
        )));
    }

    Ok(header)
}

fn read_tree<R: Read>(r: &mut R, header: &HistoryHeader) -> Result<AttributeTree, HistoryError> {
    let record: AttributeTreeRecord = expect_record(r, "attribute tree")?;

    if record.attributes.len() as u64 != header.attribute_count {
        return Err(HistoryError::Corrupt(String::from("attribute count mismatch")));
    }

    let entries = record
        .attributes
        .into_iter()
        .map(|a| match a.parent {
            -1 => Ok((a.name, None)),
            p if p >= 0 => Ok((a.name, Some(Quark::new(p as usize)))),
            p => Err(HistoryError::Corrupt(format!("invalid parent {}", p))),
        })
        .collect::<Result<Vec<_>, HistoryError>>()?;

    AttributeTree::from_entries(entries)
        .ok_or_else(|| HistoryError::Corrupt(String::from("invalid attribute tree")))
}

/// Reads a state system saved by `write_history` under `key`.
pub fn read_history<R: Read>(
    r: &mut R,
    key: &HistoryKey,
    config: StateSystemConfig,
    registry: Arc<CustomValueRegistry>,
) -> Result<StateSystem, HistoryError> {
    let header = read_header(r)?;
    key.check(&header)?;

    let tree = read_tree(r, &header)?;

    let mut intervals = Vec::with_capacity(header.interval_count.min(1 << 20) as usize);

    for _ in 0..header.interval_count {
        let record: IntervalRecord = expect_record(r, "interval")?;

        intervals.push(StateInterval {
            quark: Quark::new(record.quark as usize),
            start: record.start,
            end: Some(record.end),
            value: decode_value(record.value, &registry)?,
        });
    }

    if read_record::<IntervalRecord, R>(r)?.is_some() {
        return Err(HistoryError::Corrupt(String::from("trailing records")));
    }

    let store = IntervalStore::from_intervals(header.start, header.end, tree.len(), intervals)
        .map_err(|e| HistoryError::Corrupt(e.to_string()))?;

    Ok(StateSystem::from_parts(tree, store, config, registry))
}

/// Name of a history file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HistoryFileName {
    pub trace: String,
    pub analysis: String,
}

fn parse_history_file_name(input: &str) -> IResult<&str, HistoryFileName> {
    let (i, trace) = take_while1(|c: char| c != '@' && c != '/')(input)?;
    let (i, _) = tag("@")(i)?;
    let (i, analysis) = take_while1(|c: char| c != '.' && c != '@' && c != '/')(i)?;
    let (i, _) = tag(".")(i)?;
    let (i, _) = tag(EXTENSION)(i)?;
    let (i, _) = eof(i)?;

    Ok((
        i,
        HistoryFileName {
            trace: trace.to_string(),
            analysis: analysis.to_string(),
        },
    ))
}

impl HistoryFileName {
    pub fn new(trace: &str, analysis: &str) -> Self {
        Self {
            trace: trace.to_string(),
            analysis: analysis.to_string(),
        }
    }

    pub fn parse(fname: &str) -> Option<Self> {
        parse_history_file_name(fname).ok().map(|(_, n)| n)
    }
}

impl Display for HistoryFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}.{}", self.trace, self.analysis, EXTENSION)
    }
}

/// A directory of history files.
#[derive(Debug, Clone)]
pub struct HistoryDirectory {
    path: PathBuf,
}

impl HistoryDirectory {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the history file of `analysis` on `trace`. Fails if the file
    /// name would not be recognized by `histories`, e.g. for a trace name
    /// containing '@'.
    pub fn file_path(&self, trace: &str, analysis: &str) -> Result<PathBuf, HistoryError> {
        let name = HistoryFileName::new(trace, analysis);
        let fname = name.to_string();

        match HistoryFileName::parse(&fname) {
            Some(parsed) if parsed == name => Ok(self.path.join(fname)),
            _ => Err(HistoryError::InvalidName(fname)),
        }
    }

    /// Create the directory pointed by `self.path()` if it does not already
    /// exists.
    pub fn create_dir(&self) -> Result<(), HistoryError> {
        std::fs::create_dir_all(&self.path)?;

        Ok(())
    }

    /// Lists the history files of the directory, sorted by name.
    pub fn histories(&self) -> Result<Vec<(HistoryFileName, PathBuf)>, HistoryError> {
        let pattern = format!(
            "{}/*.{}",
            glob::Pattern::escape(&self.path.to_string_lossy()),
            EXTENSION
        );
        let paths = glob::glob(&pattern).map_err(|e| HistoryError::Corrupt(e.to_string()))?;

        let mut ret = paths
            .filter_map(|p| p.ok())
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?;
                HistoryFileName::parse(name).map(|n| (n, p.clone()))
            })
            .collect::<Vec<_>>();

        ret.sort();

        Ok(ret)
    }

    /// Saves a closed state system. The file is written next to its final
    /// location and renamed once complete.
    pub fn save(
        &self,
        trace: &str,
        key: &HistoryKey,
        ss: &StateSystem,
    ) -> Result<PathBuf, HistoryError> {
        self.create_dir()?;

        let path = self.file_path(trace, &key.analysis_id)?;
        let tmp = path.with_extension("ht.tmp");

        let res = File::create(&tmp).map_err(HistoryError::from).and_then(|f| {
            let mut w = BufWriter::new(f);
            let header = write_history(&mut w, key, trace, ss)?;
            w.flush()?;
            Ok(header)
        });

        let header = match res {
            Ok(h) => h,
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
        };

        std::fs::rename(&tmp, &path)?;

        debug!(
            "Saved {} intervals of '{}' to {}",
            header.interval_count,
            key.analysis_id,
            path.display()
        );

        Ok(path)
    }

    /// Loads the history saved under `key` for `trace`.
    pub fn load(
        &self,
        trace: &str,
        key: &HistoryKey,
        config: StateSystemConfig,
        registry: Arc<CustomValueRegistry>,
    ) -> Result<StateSystem, HistoryError> {
        let path = self.file_path(trace, &key.analysis_id)?;
        let mut r = BufReader::new(File::open(path)?);

        read_history(&mut r, key, config, registry)
    }

    /// Reads the header of a history file.
    pub fn header<P: AsRef<Path>>(path: P) -> Result<HistoryHeader, HistoryError> {
        let mut r = BufReader::new(File::open(path)?);

        read_header(&mut r)
    }

    pub fn exists(&self, trace: &str, analysis_id: &str) -> bool {
        self.file_path(trace, analysis_id)
            .map_or(false, |p| p.exists())
    }

    /// Removes the history of `analysis_id` on `trace`, if any.
    pub fn remove(&self, trace: &str, analysis_id: &str) -> Result<(), HistoryError> {
        match std::fs::remove_file(self.file_path(trace, analysis_id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
