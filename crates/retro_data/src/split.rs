//! src/split.rs
//!
//! Train/valid/test split bookkeeping.
//!
//! A split string such as `"969,30,1"` is turned into a normalized
//! [`SplitVector`] (`[0.969, 0.030, 0.001]`) and then into a [`SplitMatrix`]
//! of bookends on the unit interval, one per [`Split`]:
//!
//! ```text
//! [0.90, 0.09, 0.01] -> [0.00, 0.90, 0.99, 1.00] -> [(0.00, 0.90), (0.90, 0.99), (0.99, 1.00)]
//! ```
//!
//! When two split vectors are given (the pretraining split and the split used
//! while preprocessing the corpus) each entry of the matrix is the overlap of
//! the two bookends, so a document is only exposed to a split if both
//! partitions agree on it.

use crate::utils::normalize;
use anyhow::{ensure, Context, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train = 0,
    Valid = 1,
    Test = 2,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

/// Normalized train/valid/test fractions.
pub type SplitVector = [f64; 3];

/// `(start, end)` fractions of one split on the unit interval.
pub type Bookend = (f64, f64);

/// Per-split bookends; `None` when a split receives no documents.
pub type SplitMatrix = [Option<Bookend>; 3];

/// Parses a split string into normalized fractions.
///
/// Every run of digits and dots is read as one number, so `"99,1,0"`,
/// `"99 1 0"` and `"99/1/0"` are equivalent. Missing trailing entries are
/// treated as zero: `"80"` selects everything for training.
pub fn parse_and_normalize_split(split: &str) -> Result<SplitVector> {
    let values = split
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f64>()
                .with_context(|| format!("Invalid entry '{}' in split '{}'", token, split))
        })
        .collect::<Result<Vec<_>>>()?;

    ensure!(
        values.len() <= Split::ALL.len(),
        "Split '{}' has {} entries, but at most {} are supported",
        split,
        values.len(),
        Split::ALL.len()
    );

    let mut vector = [0.0; 3];
    vector[..values.len()].copy_from_slice(&values);
    let normalized = normalize(&vector).with_context(|| format!("Invalid split '{}'", split))?;

    let mut result = [0.0; 3];
    result.copy_from_slice(&normalized);
    Ok(result)
}

/// Builds the bookend matrix of `vector_a`, intersected with `vector_b` when given.
pub fn convert_split_vector_to_split_matrix(
    vector_a: &SplitVector,
    vector_b: Option<&SplitVector>,
) -> SplitMatrix {
    let vector_b = vector_b.unwrap_or(vector_a);
    let bookends_a = bookends(vector_a);
    let bookends_b = bookends(vector_b);

    std::array::from_fn(|i| {
        let start = bookends_a[i].0.max(bookends_b[i].0);
        let end = bookends_a[i].1.min(bookends_b[i].1);
        if end <= start {
            None
        } else {
            Some((start, end))
        }
    })
}

/// Element-wise closeness with numpy `allclose` tolerances.
pub fn split_vectors_close(a: &SplitVector, b: &SplitVector) -> bool {
    const RTOL: f64 = 1e-5;
    const ATOL: f64 = 1e-8;
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= ATOL + RTOL * y.abs())
}

pub fn format_split_matrix(matrix: &SplitMatrix) -> String {
    let entries: Vec<String> = matrix
        .iter()
        .map(|bookend| match bookend {
            Some((start, end)) => format!("({}, {})", start, end),
            None => "None".to_string(),
        })
        .collect();
    format!("[{}]", entries.join(", "))
}

fn bookends(vector: &SplitVector) -> [Bookend; 3] {
    let mut start = 0.0;
    std::array::from_fn(|i| {
        let end = start + vector[i];
        let bookend = (start, end);
        start = end;
        bookend
    })
}
