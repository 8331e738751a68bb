use crate::error::ReduceError;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File naming for rotated shards: `{prefix}.{category}.{sequence}.{extension}.gz`,
/// or `{category}.{sequence}.{extension}.gz` when the prefix is empty.
#[derive(Debug, Clone)]
pub struct ShardNaming {
    pub prefix: String,
    pub extension: String,
}

impl ShardNaming {
    pub fn new(prefix: &str, extension: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn file_name(&self, category: &str, sequence: u64) -> String {
        if self.prefix.is_empty() {
            format!("{}.{}.{}.gz", category, sequence, self.extension)
        } else {
            format!("{}.{}.{}.{}.gz", self.prefix, category, sequence, self.extension)
        }
    }
}

/// A shard that has been finished. Its file is immutable from here on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedShard {
    pub category: String,
    pub sequence: u64,
    pub path: PathBuf,
    /// Uncompressed payload bytes, trailer excluded.
    pub size_bytes: u64,
}

struct OpenShard {
    sequence: u64,
    path: PathBuf,
    size_bytes: u64,
    stream: GzEncoder<BufWriter<File>>,
}

#[derive(Default)]
struct CategoryState {
    open: Option<OpenShard>,
    next_sequence: u64,
    header_written: bool,
}

/// Maps a category to a growing gzip stream, rotating to a fresh shard file once the
/// open one has grown past `size_limit` bytes.
///
/// Every `write` call is emitted whole into a single shard, so callers pass complete
/// records. Not synchronized; share it behind a `Mutex` when several threads write.
pub struct OutputMultiplexer {
    dir: PathBuf,
    naming: ShardNaming,
    size_limit: u64,
    trailer: Option<Vec<u8>>,
    categories: HashMap<String, CategoryState>,
}

impl OutputMultiplexer {
    /// Shards are closed with a trailing newline, like the merged outputs always were.
    pub fn new(dir: &Path, naming: ShardNaming, size_limit: u64) -> Result<Self, ReduceError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            naming,
            size_limit,
            trailer: Some(b"\n".to_vec()),
            categories: HashMap::new(),
        })
    }

    /// Close shards without appending anything, so the shards concatenate back to the exact input.
    pub fn without_trailer(mut self) -> Self {
        self.trailer = None;
        self
    }

    /// Append `bytes` to the open shard for `category`, rotating first if that shard is
    /// already over the size limit. Returns the shard closed by the rotation, if any.
    pub fn write(&mut self, category: &str, bytes: &[u8]) -> Result<Option<ClosedShard>, ReduceError> {
        validate_category(category)?;
        let state = self.categories.entry(category.to_string()).or_default();

        let mut closed = None;
        if state.open.as_ref().is_some_and(|s| s.size_bytes > self.size_limit) {
            if let Some(shard) = state.open.take() {
                closed = Some(finish(category, shard, self.trailer.as_deref())?);
            }
        }

        if state.open.is_none() {
            state.open = Some(open_next(&self.dir, &self.naming, category, state)?);
        }

        if let Some(shard) = state.open.as_mut() {
            shard.stream.write_all(bytes)?;
            shard.size_bytes += bytes.len() as u64;
        }
        Ok(closed)
    }

    /// Write a header line for `category` unless one was already written for it during
    /// this run. Returns whether it was written.
    pub fn write_header(&mut self, category: &str, bytes: &[u8]) -> Result<(Option<ClosedShard>, bool), ReduceError> {
        if self.header_written(category) {
            return Ok((None, false));
        }
        let closed = self.write(category, bytes)?;
        if let Some(state) = self.categories.get_mut(category) {
            state.header_written = true;
        }
        Ok((closed, true))
    }

    pub fn header_written(&self, category: &str) -> bool {
        self.categories.get(category).is_some_and(|s| s.header_written)
    }

    pub fn open_categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .categories
            .iter()
            .filter(|(_, s)| s.open.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Finish every open shard. Call once at clean shutdown.
    pub fn close_all(&mut self) -> Result<Vec<ClosedShard>, ReduceError> {
        let mut closed = Vec::new();
        let mut first_error = None;
        for name in self.open_categories() {
            let Some(shard) = self.categories.get_mut(&name).and_then(|s| s.open.take()) else {
                continue;
            };
            match finish(&name, shard, self.trailer.as_deref()) {
                Ok(c) => closed.push(c),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}

fn validate_category(category: &str) -> Result<(), ReduceError> {
    if category.is_empty() || category.contains(['/', '\\']) || category == "." || category == ".." {
        return Err(ReduceError::Other(format!("invalid output category {:?}", category)));
    }
    Ok(())
}

fn open_next(dir: &Path, naming: &ShardNaming, category: &str, state: &mut CategoryState) -> Result<OpenShard, ReduceError> {
    let mut sequence = state.next_sequence;
    let mut path = dir.join(naming.file_name(category, sequence));
    while path.exists() {
        sequence += 1;
        path = dir.join(naming.file_name(category, sequence));
    }
    state.next_sequence = sequence + 1;

    let file = File::create(&path)?;
    debug!(path = %path.display(), "opened shard");
    Ok(OpenShard {
        sequence,
        path,
        size_bytes: 0,
        stream: GzEncoder::new(BufWriter::new(file), Compression::default()),
    })
}

fn finish(category: &str, mut shard: OpenShard, trailer: Option<&[u8]>) -> Result<ClosedShard, ReduceError> {
    if let Some(trailer) = trailer {
        shard.stream.write_all(trailer)?;
    }
    let mut inner = shard.stream.finish()?;
    inner.flush()?;
    debug!(path = %shard.path.display(), bytes = shard.size_bytes, "closed shard");
    Ok(ClosedShard {
        category: category.to_string(),
        sequence: shard.sequence,
        path: shard.path,
        size_bytes: shard.size_bytes,
    })
}
