use std::{fs, path::Path};

use anyhow::{Context, Result};

use crate::error::{ConfigError, LabelError};

/// Ordered set of characters a captcha may contain.
///
/// The position of a character is its class index in every output head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alphabet {
    symbols: Vec<char>,
}

impl Alphabet {
    pub fn new(symbols: &str) -> Self {
        Self {
            symbols: symbols.chars().collect(),
        }
    }

    /// Reads the first line of `path`, stripped of surrounding whitespace.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read symbols file '{}'", path.display()))?;
        let line = content.lines().next().unwrap_or_default().trim();

        if line.is_empty() {
            return Err(ConfigError::EmptySymbols(path.to_path_buf()).into());
        }

        Ok(Self::new(line))
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, index: usize) -> Option<char> {
        self.symbols.get(index).copied()
    }

    /// Linear search, first occurrence wins.
    pub fn index_of(&self, symbol: char) -> Option<usize> {
        self.symbols.iter().position(|&candidate| candidate == symbol)
    }

    /// Class index for each of the `length` label positions.
    ///
    /// `None` marks a position whose target row stays all zero: either the
    /// character is not part of the alphabet or the label is shorter than
    /// `length`. Unknown characters are not reported.
    pub fn encode(&self, label: &str, length: usize) -> Result<Vec<Option<usize>>, LabelError> {
        let found = label.chars().count();
        if found > length {
            return Err(LabelError::TooLong {
                label: label.to_string(),
                found,
                expected: length,
            });
        }

        let mut indices: Vec<_> = label.chars().map(|ch| self.index_of(ch)).collect();
        indices.resize(length, None);

        Ok(indices)
    }

    /// Inverse of [`Alphabet::encode`] for predicted indices; out of range
    /// indices are skipped.
    pub fn decode(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .filter_map(|&index| self.symbol(index))
            .collect()
    }
}
