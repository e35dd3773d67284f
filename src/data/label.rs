//! Conversion between transcriptions and class-index sequences.

use anyhow::{bail, Result};
use std::collections::HashMap;

/// End-of-sequence marker used by attention decoders
pub const EOS: char = '$';

fn index_alphabet(chars: &[char], offset: usize) -> Result<HashMap<char, usize>> {
    let mut index = HashMap::with_capacity(chars.len());
    for (i, &c) in chars.iter().enumerate() {
        if index.insert(c, i + offset).is_some() {
            bail!("Duplicate character {:?} in alphabet", c);
        }
    }
    Ok(index)
}

/// Encoded batch of labels: concatenated indices plus per-label lengths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub indices: Vec<i64>,
    pub lengths: Vec<usize>,
}

impl Encoded {
    /// Start offset of each label inside `indices`
    pub fn offsets(&self) -> Vec<usize> {
        self.lengths
            .iter()
            .scan(0, |acc, &len| {
                let start = *acc;
                *acc += len;
                Some(start)
            })
            .collect()
    }
}

/// Label codec for CTC outputs.
///
/// Class 0 is the blank; alphabet characters map to `1..=len`.
#[derive(Debug, Clone)]
pub struct CtcConverter {
    chars: Vec<char>,
    index: HashMap<char, usize>,
    ignore_case: bool,
}

impl CtcConverter {
    pub fn new(alphabet: &str, ignore_case: bool) -> Result<Self> {
        let alphabet = if ignore_case {
            alphabet.to_lowercase()
        } else {
            alphabet.to_string()
        };
        let mut chars: Vec<char> = Vec::new();
        for c in alphabet.chars() {
            // Case folding may merge letters
            if !(ignore_case && chars.contains(&c)) {
                chars.push(c);
            }
        }
        if chars.is_empty() {
            bail!("Alphabet must not be empty");
        }
        let index = index_alphabet(&chars, 1)?;
        Ok(Self {
            chars,
            index,
            ignore_case,
        })
    }

    /// Classes the network must emit, blank included
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    pub fn encode_one(&self, text: &str) -> Result<Vec<i64>> {
        let text = if self.ignore_case {
            text.to_lowercase()
        } else {
            text.to_string()
        };
        text.chars()
            .map(|c| match self.index.get(&c) {
                Some(&i) => Ok(i as i64),
                None => bail!("Character {:?} in label {:?} is not in the alphabet", c, text),
            })
            .collect()
    }

    pub fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Result<Encoded> {
        let mut indices = Vec::new();
        let mut lengths = Vec::with_capacity(texts.len());
        for text in texts {
            let encoded = self.encode_one(text.as_ref())?;
            lengths.push(encoded.len());
            indices.extend(encoded);
        }
        Ok(Encoded { indices, lengths })
    }

    /// Greedy CTC decode: collapse repeats, then drop blanks
    pub fn decode(&self, indices: &[i64]) -> String {
        let mut text = String::new();
        let mut previous = 0;
        for &i in indices {
            if i != 0 && i != previous {
                if let Some(&c) = usize::try_from(i - 1).ok().and_then(|i| self.chars.get(i)) {
                    text.push(c);
                }
            }
            previous = i;
        }
        text
    }
}

/// Label codec for attention decoders.
///
/// Every encoded label ends with [`EOS`]; decoding cuts at the first marker.
#[derive(Debug, Clone)]
pub struct AttentionConverter {
    chars: Vec<char>,
    index: HashMap<char, usize>,
}

impl AttentionConverter {
    pub fn new(alphabet: &str) -> Result<Self> {
        let mut chars: Vec<char> = alphabet.chars().filter(|&c| c != EOS).collect();
        if chars.is_empty() {
            bail!("Alphabet must not be empty");
        }
        chars.push(EOS);
        let index = index_alphabet(&chars, 0)?;
        Ok(Self { chars, index })
    }

    pub fn num_classes(&self) -> usize {
        self.chars.len()
    }

    pub fn eos_index(&self) -> i64 {
        (self.chars.len() - 1) as i64
    }

    /// Encode `text` followed by the end marker
    pub fn encode_one(&self, text: &str) -> Result<Vec<i64>> {
        let mut encoded = Vec::with_capacity(text.len() + 1);
        for c in text.chars() {
            match self.index.get(&c) {
                Some(&i) if c != EOS => encoded.push(i as i64),
                _ => bail!("Character {:?} in label {:?} is not in the alphabet", c, text),
            }
        }
        encoded.push(self.eos_index());
        Ok(encoded)
    }

    pub fn encode<S: AsRef<str>>(&self, texts: &[S]) -> Result<Encoded> {
        let mut indices = Vec::new();
        let mut lengths = Vec::with_capacity(texts.len());
        for text in texts {
            let encoded = self.encode_one(text.as_ref())?;
            lengths.push(encoded.len());
            indices.extend(encoded);
        }
        Ok(Encoded { indices, lengths })
    }

    /// Characters up to, not including, the first end marker
    pub fn decode(&self, indices: &[i64]) -> String {
        indices
            .iter()
            .map_while(|&i| {
                let c = usize::try_from(i).ok().and_then(|i| self.chars.get(i)).copied()?;
                (c != EOS).then_some(c)
            })
            .collect()
    }

    /// Number of leading steps a decode consumed, end marker included
    pub fn decoded_steps(&self, indices: &[i64]) -> usize {
        match indices.iter().position(|&i| i == self.eos_index()) {
            Some(pos) => pos + 1,
            None => indices.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctc_encode() {
        let converter = CtcConverter::new("abc", false).unwrap();
        assert_eq!(converter.num_classes(), 4);

        let encoded = converter.encode(&["ab", "cab"]).unwrap();
        assert_eq!(encoded.indices, vec![1, 2, 3, 1, 2]);
        assert_eq!(encoded.lengths, vec![2, 3]);
        assert_eq!(encoded.offsets(), vec![0, 2]);

        assert!(converter.encode_one("abd").is_err());
    }

    #[test]
    fn test_ctc_ignore_case() {
        let converter = CtcConverter::new("abcABC", true).unwrap();
        assert_eq!(converter.num_classes(), 4);
        assert_eq!(converter.encode_one("AbC").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_ctc_decode_collapses() {
        let converter = CtcConverter::new("ab", false).unwrap();
        assert_eq!(converter.decode(&[1, 1, 0, 1, 2, 2, 0, 0]), "aab");
        assert_eq!(converter.decode(&[0, 0]), "");
        // Out of range classes are ignored
        assert_eq!(converter.decode(&[9, 1]), "a");
    }

    #[test]
    fn test_attention_round_trip() {
        let converter = AttentionConverter::new("0123456789").unwrap();
        assert_eq!(converter.num_classes(), 11);
        assert_eq!(converter.eos_index(), 10);

        let encoded = converter.encode(&["42", ""]).unwrap();
        assert_eq!(encoded.indices, vec![4, 2, 10, 10]);
        assert_eq!(encoded.lengths, vec![3, 1]);

        assert_eq!(converter.decode(&[4, 2, 10, 7, 7]), "42");
        assert_eq!(converter.decoded_steps(&[4, 2, 10, 7, 7]), 3);
        assert_eq!(converter.decoded_steps(&[4, 2]), 2);
    }

    #[test]
    fn test_attention_rejects_marker_in_label() {
        let converter = AttentionConverter::new("ab$").unwrap();
        assert_eq!(converter.num_classes(), 3);
        assert!(converter.encode_one("a$").is_err());
    }

    #[test]
    fn test_duplicate_alphabet() {
        assert!(CtcConverter::new("aa", false).is_err());
        assert!(AttentionConverter::new("").is_err());
    }
}
