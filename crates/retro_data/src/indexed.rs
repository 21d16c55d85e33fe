//! src/indexed.rs
//!
//! Memory-mapped indexed token dataset (Megatron `MMIDIDX` format).
//!
//! A dataset lives in two files sharing a path prefix:
//!
//! ```text
//! {prefix}.bin   raw little-endian tokens, sequences back to back
//! {prefix}.idx   magic       b"MMIDIDX\x00\x00"   (9 bytes)
//!                version     u64 = 1
//!                dtype code  u8
//!                sequences   u64  (S)
//!                documents   u64  (D)
//!                lengths     i32 x S   tokens per sequence
//!                pointers    i64 x S   byte offset of each sequence in .bin
//!                doc indices i64 x D   sequence index where each document starts, plus a final sentinel
//! ```
//!
//! Only the index is read into memory; token data stays in the page cache.

use anyhow::{anyhow, bail, ensure, Context, Result};
use bytemuck::{pod_collect_to_vec, Pod};
use memmap2::Mmap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const INDEX_HEADER: &[u8; 9] = b"MMIDIDX\x00\x00";
const INDEX_VERSION: u64 = 1;

/// Token storage type, with the codes used in the index header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    U8,
    I8,
    I16,
    I32,
    I64,
    U16,
}

impl DType {
    pub fn code(self) -> u8 {
        match self {
            DType::U8 => 1,
            DType::I8 => 2,
            DType::I16 => 3,
            DType::I32 => 4,
            DType::I64 => 5,
            DType::U16 => 8,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => DType::U8,
            2 => DType::I8,
            3 => DType::I16,
            4 => DType::I32,
            5 => DType::I64,
            8 => DType::U16,
            6 | 7 => bail!("Floating point token data (dtype code {}) is not supported", code),
            other => bail!("Unknown dtype code {} in index file", other),
        })
    }

    pub fn size(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Smallest dtype able to hold every token id of a vocabulary.
    pub fn optimal_for_vocab(vocab_size: usize) -> Self {
        if vocab_size < 65500 {
            DType::U16
        } else {
            DType::I32
        }
    }
}

pub fn index_file_path(path_prefix: &Path) -> PathBuf {
    with_suffix(path_prefix, ".idx")
}

pub fn data_file_path(path_prefix: &Path) -> PathBuf {
    with_suffix(path_prefix, ".bin")
}

// `Path::with_extension` would clobber prefixes that already contain a dot.
fn with_suffix(path_prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(path_prefix.as_os_str());
    path.push(suffix);
    PathBuf::from(path)
}

/// Read-only view over a `.bin`/`.idx` pair.
#[derive(Debug)]
pub struct MmapIndexedDataset {
    path_prefix: PathBuf,
    dtype: DType,
    sequence_lengths: Vec<i32>,
    sequence_pointers: Vec<i64>,
    document_indices: Vec<i64>,
    // `None` for an empty data file, which cannot be mapped.
    bin: Option<Mmap>,
}

impl MmapIndexedDataset {
    pub fn open(path_prefix: impl AsRef<Path>) -> Result<Self> {
        let path_prefix = path_prefix.as_ref().to_path_buf();

        let idx_path = index_file_path(&path_prefix);
        let idx_bytes = fs::read(&idx_path)
            .with_context(|| format!("Failed to read index file: {}", idx_path.display()))?;
        let index = IndexReader::new(&idx_bytes)
            .parse()
            .with_context(|| format!("Malformed index file: {}", idx_path.display()))?;

        let bin_path = data_file_path(&path_prefix);
        let bin_file = File::open(&bin_path)
            .with_context(|| format!("Failed to open data file: {}", bin_path.display()))?;
        let bin_len = bin_file.metadata()?.len() as usize;
        let bin = if bin_len == 0 {
            None
        } else {
            // SAFETY: the file is opened read-only and is not expected to be
            // modified while the dataset is alive.
            Some(unsafe { Mmap::map(&bin_file) }.with_context(|| {
                format!("Failed to memory-map data file: {}", bin_path.display())
            })?)
        };

        for (i, (&length, &pointer)) in index
            .sequence_lengths
            .iter()
            .zip(index.sequence_pointers.iter())
            .enumerate()
        {
            ensure!(
                length >= 0 && pointer >= 0,
                "Sequence {} has negative length ({}) or pointer ({})",
                i,
                length,
                pointer
            );
            let end = (length as usize)
                .checked_mul(index.dtype.size())
                .and_then(|bytes| (pointer as usize).checked_add(bytes))
                .ok_or_else(|| anyhow!("Sequence {} overflows the address space", i))?;
            ensure!(
                end <= bin_len,
                "Sequence {} ends at byte {} but {} holds only {} bytes",
                i,
                end,
                bin_path.display(),
                bin_len
            );
        }

        Ok(Self {
            path_prefix,
            dtype: index.dtype,
            sequence_lengths: index.sequence_lengths,
            sequence_pointers: index.sequence_pointers,
            document_indices: index.document_indices,
            bin,
        })
    }

    pub fn path_prefix(&self) -> &Path {
        &self.path_prefix
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequence_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence_lengths.is_empty()
    }

    pub fn sequence_lengths(&self) -> &[i32] {
        &self.sequence_lengths
    }

    pub fn document_indices(&self) -> &[i64] {
        &self.document_indices
    }

    /// Reads `length` tokens of sequence `idx` starting at token `offset`.
    /// `length = None` reads to the end of the sequence.
    pub fn get(&self, idx: usize, offset: usize, length: Option<usize>) -> Result<Vec<i64>> {
        ensure!(
            idx < self.len(),
            "Sequence index {} out of bounds for dataset of size {}",
            idx,
            self.len()
        );
        let sequence_length = self.sequence_lengths[idx] as usize;
        ensure!(
            offset <= sequence_length,
            "Offset {} exceeds length {} of sequence {}",
            offset,
            sequence_length,
            idx
        );
        let length = length.unwrap_or(sequence_length - offset);
        ensure!(
            offset + length <= sequence_length,
            "Range {}..{} exceeds length {} of sequence {}",
            offset,
            offset + length,
            sequence_length,
            idx
        );

        let item_size = self.dtype.size();
        let start = self.sequence_pointers[idx] as usize + offset * item_size;
        let bytes = &self.data()[start..start + length * item_size];
        Ok(decode_tokens(self.dtype, bytes))
    }

    fn data(&self) -> &[u8] {
        self.bin.as_deref().unwrap_or(&[])
    }
}

fn decode_tokens(dtype: DType, bytes: &[u8]) -> Vec<i64> {
    fn widen<T: Pod + Into<i64>>(bytes: &[u8]) -> Vec<i64> {
        pod_collect_to_vec::<u8, T>(bytes)
            .into_iter()
            .map(Into::into)
            .collect()
    }

    match dtype {
        DType::U8 => bytes.iter().map(|&b| i64::from(b)).collect(),
        DType::I8 => bytes.iter().map(|&b| i64::from(b as i8)).collect(),
        DType::I16 => widen::<i16>(bytes),
        DType::U16 => widen::<u16>(bytes),
        DType::I32 => widen::<i32>(bytes),
        DType::I64 => pod_collect_to_vec::<u8, i64>(bytes),
    }
}

struct ParsedIndex {
    dtype: DType,
    sequence_lengths: Vec<i32>,
    sequence_pointers: Vec<i64>,
    document_indices: Vec<i64>,
}

struct IndexReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> IndexReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| {
                anyhow!(
                    "unexpected end of index: {} bytes requested at offset {} of {}",
                    n,
                    self.position,
                    self.bytes.len()
                )
            })?;
        let slice = &self.bytes[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn read_count(&mut self) -> Result<usize> {
        let count = self.read_u64()?;
        usize::try_from(count).with_context(|| format!("count {} does not fit in memory", count))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into()?))
    }

    fn read_array<T: Pod>(&mut self, count: usize) -> Result<Vec<T>> {
        let size = count
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| anyhow!("array of {} elements overflows the index size", count))?;
        let bytes = self.take(size)?;
        Ok(pod_collect_to_vec(bytes))
    }

    fn parse(mut self) -> Result<ParsedIndex> {
        ensure!(
            self.take(INDEX_HEADER.len())? == INDEX_HEADER,
            "not an MMIDIDX index (bad magic header)"
        );
        let version = self.read_u64()?;
        ensure!(
            version == INDEX_VERSION,
            "unsupported index version {}, expected {}",
            version,
            INDEX_VERSION
        );
        let dtype = DType::from_code(self.take(1)?[0])?;
        let sequence_count = self.read_count()?;
        let document_count = self.read_count()?;

        let sequence_lengths = self.read_array::<i32>(sequence_count)?;
        let sequence_pointers = self.read_array::<i64>(sequence_count)?;
        let document_indices = self.read_array::<i64>(document_count)?;

        Ok(ParsedIndex {
            dtype,
            sequence_lengths,
            sequence_pointers,
            document_indices,
        })
    }
}

/// Writes a `.bin`/`.idx` pair.
///
/// # Example
/// ```ignore
/// let mut builder = IndexedDatasetBuilder::new("corpus_text_document", DType::U16)?;
/// builder.add_document(&[464, 3290, 13, 50256])?;
/// builder.finalize()?;
/// ```
pub struct IndexedDatasetBuilder {
    path_prefix: PathBuf,
    dtype: DType,
    bin: BufWriter<File>,
    sequence_lengths: Vec<i32>,
    document_indices: Vec<i64>,
}

impl IndexedDatasetBuilder {
    pub fn new(path_prefix: impl Into<PathBuf>, dtype: DType) -> Result<Self> {
        let path_prefix = path_prefix.into();
        let bin_path = data_file_path(&path_prefix);
        let bin = File::create(&bin_path)
            .with_context(|| format!("Failed to create data file: {}", bin_path.display()))?;
        Ok(Self {
            path_prefix,
            dtype,
            bin: BufWriter::new(bin),
            sequence_lengths: Vec::new(),
            document_indices: vec![0],
        })
    }

    /// Appends one sequence.
    pub fn add_item(&mut self, tokens: &[i64]) -> Result<()> {
        for &token in tokens {
            self.write_token(token)?;
        }
        let length = i32::try_from(tokens.len())
            .with_context(|| format!("Sequence of {} tokens is too long", tokens.len()))?;
        self.sequence_lengths.push(length);
        Ok(())
    }

    /// Closes the current document after the sequences added so far.
    pub fn end_document(&mut self) {
        self.document_indices.push(self.sequence_lengths.len() as i64);
    }

    /// Appends a document made of a single sequence.
    pub fn add_document(&mut self, tokens: &[i64]) -> Result<()> {
        self.add_item(tokens)?;
        self.end_document();
        Ok(())
    }

    fn write_token(&mut self, token: i64) -> Result<()> {
        let dtype = self.dtype;
        let out_of_range = || format!("Token {} does not fit into {:?}", token, dtype);
        match dtype {
            DType::U8 => self.bin.write_all(&u8::try_from(token).with_context(out_of_range)?.to_le_bytes())?,
            DType::I8 => self.bin.write_all(&i8::try_from(token).with_context(out_of_range)?.to_le_bytes())?,
            DType::I16 => self.bin.write_all(&i16::try_from(token).with_context(out_of_range)?.to_le_bytes())?,
            DType::U16 => self.bin.write_all(&u16::try_from(token).with_context(out_of_range)?.to_le_bytes())?,
            DType::I32 => self.bin.write_all(&i32::try_from(token).with_context(out_of_range)?.to_le_bytes())?,
            DType::I64 => self.bin.write_all(&token.to_le_bytes())?,
        }
        Ok(())
    }

    /// Flushes the token data and writes the index file.
    pub fn finalize(mut self) -> Result<PathBuf> {
        self.bin.flush()?;

        let idx_path = index_file_path(&self.path_prefix);
        let file = File::create(&idx_path)
            .with_context(|| format!("Failed to create index file: {}", idx_path.display()))?;
        let mut idx = BufWriter::new(file);

        idx.write_all(INDEX_HEADER)?;
        idx.write_all(&INDEX_VERSION.to_le_bytes())?;
        idx.write_all(&[self.dtype.code()])?;
        idx.write_all(&(self.sequence_lengths.len() as u64).to_le_bytes())?;
        idx.write_all(&(self.document_indices.len() as u64).to_le_bytes())?;

        for length in &self.sequence_lengths {
            idx.write_all(&length.to_le_bytes())?;
        }
        let mut pointer = 0i64;
        for &length in &self.sequence_lengths {
            idx.write_all(&pointer.to_le_bytes())?;
            pointer += length as i64 * self.dtype.size() as i64;
        }
        for index in &self.document_indices {
            idx.write_all(&index.to_le_bytes())?;
        }
        idx.flush()?;
        Ok(self.path_prefix)
    }
}
