//! Useful types and other utilities that don't really belong anywhere else.

/// A fixed-capacity array of bits, sized once at construction and never grown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Box<[u64]>,
    capacity: usize,
}

/// Returned when a bit index lies outside of a [BitSet]'s capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("bit {index} out of range for a {capacity}-bit set")]
pub struct OutOfRange {
    pub index: usize,
    pub capacity: usize,
}

impl BitSet {
    const WORD_BITS: usize = u64::BITS as usize;

    /// Create a set able to hold bits `0..capacity`, all clear
    pub fn new(capacity: usize) -> Self {
        let words = vec![0u64; capacity.div_ceil(Self::WORD_BITS)].into_boxed_slice();
        Self { words, capacity }
    }

    /// The number of addressable bits
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn locate(&self, index: usize) -> Result<(usize, u64), OutOfRange> {
        if index >= self.capacity {
            return Err(OutOfRange {
                index,
                capacity: self.capacity,
            });
        }
        Ok((index / Self::WORD_BITS, 1 << (index % Self::WORD_BITS)))
    }

    /// Is bit `index` set? Bits outside the capacity are never set.
    pub fn test(&self, index: usize) -> bool {
        self.locate(index)
            .map_or(false, |(word, mask)| self.words[word] & mask != 0)
    }

    /// Set bit `index`, returning its previous value
    pub fn set(&mut self, index: usize) -> Result<bool, OutOfRange> {
        let (word, mask) = self.locate(index)?;
        let was_set = self.words[word] & mask != 0;
        self.words[word] |= mask;
        Ok(was_set)
    }

    /// Clear bit `index`, returning its previous value
    pub fn clear(&mut self, index: usize) -> Result<bool, OutOfRange> {
        let (word, mask) = self.locate(index)?;
        let was_set = self.words[word] & mask != 0;
        self.words[word] &= !mask;
        Ok(was_set)
    }

    /// Clear every bit
    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    /// Count the bits currently set
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[test]
fn test_bitset() {
    let mut bits = BitSet::new(130);
    assert_eq!(bits.capacity(), 130);
    assert!(!bits.test(0));

    assert_eq!(bits.set(0), Ok(false));
    assert_eq!(bits.set(0), Ok(true));
    assert_eq!(bits.set(64), Ok(false));
    assert_eq!(bits.set(129), Ok(false));
    assert!(bits.test(0) && bits.test(64) && bits.test(129));
    assert!(!bits.test(63) && !bits.test(65));
    assert_eq!(bits.count(), 3);

    assert_eq!(bits.clear(64), Ok(true));
    assert_eq!(bits.clear(64), Ok(false));
    assert!(!bits.test(64));

    bits.clear_all();
    assert_eq!(bits.count(), 0);
}

#[test]
fn test_bitset_bounds() {
    let mut bits = BitSet::new(64);

    // The last index is addressable, the capacity itself and beyond are not
    assert_eq!(bits.set(63), Ok(false));
    assert_eq!(
        bits.set(64),
        Err(OutOfRange {
            index: 64,
            capacity: 64
        })
    );
    assert!(bits.set(65).is_err());
    assert!(bits.clear(64).is_err());
    assert!(!bits.test(64));
    assert!(!bits.test(usize::MAX));
}
