//! Hardware feature bits.
//!
//! A [`FeatureSet`] is a fixed-width bitset. The meaning of a bit depends on the
//! ISA of the descriptor holding it, so the named enums below are the only safe
//! way to build one; raw indices go through [`FeatureBit::new`], which rejects
//! anything past the end of the set.

use super::Isa;
use std::fmt;

/// Number of 32-bit words in a [`FeatureSet`].
pub const FEATURE_WORDS: usize = 4;

/// Number of addressable feature bits.
pub const FEATURE_BITS: u32 = (FEATURE_WORDS as u32) * 32;

/// A validated bit index into a [`FeatureSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureBit(u8);

impl FeatureBit {
    pub const fn new(bit: u32) -> Option<Self> {
        if bit < FEATURE_BITS {
            Some(FeatureBit(bit as u8))
        } else {
            None
        }
    }

    pub const fn index(self) -> u32 {
        self.0 as u32
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureSet {
    words: [u32; FEATURE_WORDS],
}

impl FeatureSet {
    pub const fn empty() -> Self {
        FeatureSet {
            words: [0; FEATURE_WORDS],
        }
    }

    /// Builds a set from raw probe words, least significant bit first.
    pub const fn from_words(words: [u32; FEATURE_WORDS]) -> Self {
        FeatureSet { words }
    }

    pub const fn words(&self) -> [u32; FEATURE_WORDS] {
        self.words
    }

    pub fn insert(&mut self, bit: FeatureBit) {
        let i = bit.index();
        self.words[(i / 32) as usize] |= 1 << (i % 32);
    }

    pub fn contains(&self, bit: FeatureBit) -> bool {
        let i = bit.index();
        self.words[(i / 32) as usize] & (1 << (i % 32)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = FeatureBit> + '_ {
        (0..FEATURE_BITS)
            .filter_map(FeatureBit::new)
            .filter(move |bit| self.contains(*bit))
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|b| b.index())).finish()
    }
}

macro_rules! feature_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $bit:expr, $text:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $bit,)*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)*];

            pub const fn bit(self) -> FeatureBit {
                FeatureBit(self as u8)
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $text,)*
                }
            }
        }
    };
}

feature_enum! {
    /// ARMv8-A feature bits, numbered as the Linux `HWCAP` order.
    Aarch64Feature {
        Fp = 0, "fp";
        Asimd = 1, "asimd";
        Evtstrm = 2, "evtstrm";
        Aes = 3, "aes";
        Pmull = 4, "pmull";
        Sha1 = 5, "sha1";
        Sha256 = 6, "sha2";
        Crc32 = 7, "crc32";
        Atomics = 8, "atomics";
        Fphp = 9, "fphp";
        Asimdhp = 10, "asimdhp";
        Cpuid = 11, "cpuid";
        Asimdrdm = 12, "asimdrdm";
        Jscvt = 13, "jscvt";
        Fcma = 14, "fcma";
        Lrcpc = 15, "lrcpc";
        Dcpop = 16, "dcpop";
        Sha3 = 17, "sha3";
        Sm3 = 18, "sm3";
        Sm4 = 19, "sm4";
        Asimddp = 20, "asimddp";
        Sha512 = 21, "sha512";
        Sve = 22, "sve";
        Asimdfhm = 23, "asimdfhm";
        Dit = 24, "dit";
        Uscat = 25, "uscat";
        Ilrcpc = 26, "ilrcpc";
        Flagm = 27, "flagm";
        Ssbs = 28, "ssbs";
        Sb = 29, "sb";
        Paca = 30, "paca";
        Pacg = 31, "pacg";
        Sve2 = 32, "sve2";
        I8mm = 33, "i8mm";
        Bf16 = 34, "bf16";
    }
}

feature_enum! {
    /// x86-64 feature bits.
    X86Feature {
        Sse = 0, "sse";
        Sse2 = 1, "sse2";
        Sse3 = 2, "sse3";
        Ssse3 = 3, "ssse3";
        Sse4_1 = 4, "sse4.1";
        Sse4_2 = 5, "sse4.2";
        Popcnt = 6, "popcnt";
        Avx = 7, "avx";
        Avx2 = 8, "avx2";
        Fma = 9, "fma";
        Bmi1 = 10, "bmi1";
        Bmi2 = 11, "bmi2";
        Lzcnt = 12, "lzcnt";
        Aes = 13, "aes";
        Pclmulqdq = 14, "pclmulqdq";
        Avx512f = 15, "avx512f";
    }
}

/// A named feature of either ISA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Aarch64(Aarch64Feature),
    X86(X86Feature),
}

impl Feature {
    pub const fn isa(self) -> Isa {
        match self {
            Feature::Aarch64(_) => Isa::Aarch64,
            Feature::X86(_) => Isa::X86_64,
        }
    }

    pub const fn bit(self) -> FeatureBit {
        match self {
            Feature::Aarch64(f) => f.bit(),
            Feature::X86(f) => f.bit(),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Feature::Aarch64(f) => f.name(),
            Feature::X86(f) => f.name(),
        }
    }
}

impl From<Aarch64Feature> for Feature {
    fn from(f: Aarch64Feature) -> Self {
        Feature::Aarch64(f)
    }
}

impl From<X86Feature> for Feature {
    fn from(f: X86Feature) -> Self {
        Feature::X86(f)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_bit_rejects_out_of_range() {
        assert!(FeatureBit::new(0).is_some());
        assert!(FeatureBit::new(FEATURE_BITS - 1).is_some());
        assert!(FeatureBit::new(FEATURE_BITS).is_none());
        assert!(FeatureBit::new(u32::MAX).is_none());
    }

    #[test]
    fn set_spans_words() {
        let mut set = FeatureSet::empty();
        assert!(set.is_empty());
        set.insert(FeatureBit::new(3).unwrap());
        set.insert(FeatureBit::new(40).unwrap());
        set.insert(FeatureBit::new(127).unwrap());

        assert_eq!(set.len(), 3);
        assert_eq!(set.words(), [1 << 3, 1 << 8, 0, 1 << 31]);
        let bits: Vec<u32> = set.iter().map(|b| b.index()).collect();
        assert_eq!(bits, vec![3, 40, 127]);
    }

    #[test]
    fn named_bits_are_unique_per_isa() {
        let mut seen = FeatureSet::empty();
        for f in Aarch64Feature::ALL {
            assert!(!seen.contains(f.bit()), "{} reused a bit", f.name());
            seen.insert(f.bit());
        }
        let mut seen = FeatureSet::empty();
        for f in X86Feature::ALL {
            assert!(!seen.contains(f.bit()), "{} reused a bit", f.name());
            seen.insert(f.bit());
        }
    }
}
