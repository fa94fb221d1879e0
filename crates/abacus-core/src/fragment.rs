//! Splitting a blob into numbered fragments.
//!
//! Boundaries depend only on the blob length and the maximum fragment
//! size, never on the attempt. A receiver can therefore merge fragments
//! from different send attempts of the same message.
//!
//! With `num = ceil(L / F)`, `base = L / num`, `rem = L % num`, fragments
//! `1..=rem` carry `base + 1` bytes and the remainder carry `base`.

use std::ops::Range;

use bytes::Bytes;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::wire::MAX_FRAGMENT_NUM;

/// One planned fragment of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 1-based fragment number.
    pub num: u16,
    pub last: bool,
    /// Byte range within the blob.
    pub range: Range<usize>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Zero-copy view of this fragment's bytes.
    pub fn slice(&self, blob: &Bytes) -> Bytes {
        blob.slice(self.range.clone())
    }
}

/// Plan the fragments for a blob of `len` bytes.
pub fn partition(len: usize, max_fragment_size: usize) -> Result<Vec<Fragment>, FragmentError> {
    if len == 0 {
        return Err(FragmentError::Empty);
    }
    if max_fragment_size == 0 {
        return Err(FragmentError::ZeroFragmentSize);
    }

    let num = len.div_ceil(max_fragment_size);
    if num > MAX_FRAGMENT_NUM as usize {
        return Err(FragmentError::TooManyFragments { len, needed: num });
    }

    let base = len / num;
    let rem = len % num;

    let mut fragments = Vec::with_capacity(num);
    let mut start = 0;
    for i in 0..num {
        let size = if i < rem { base + 1 } else { base };
        fragments.push(Fragment {
            num: (i + 1) as u16,
            last: i + 1 == num,
            range: start..start + size,
        });
        start += size;
    }
    debug_assert_eq!(start, len);
    Ok(fragments)
}

/// Shuffle the fragments into this attempt's send order.
pub fn shuffle<R: Rng + ?Sized>(fragments: &mut [Fragment], rng: &mut R) {
    fragments.shuffle(rng);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("cannot fragment an empty blob")]
    Empty,

    #[error("maximum fragment size is zero")]
    ZeroFragmentSize,

    #[error("blob of {len} bytes needs {needed} fragments, more than {}", MAX_FRAGMENT_NUM)]
    TooManyFragments { len: usize, needed: usize },
}
