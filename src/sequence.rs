use std::fmt::{Display, Formatter};

/// A 16 bit sequence number that wraps around. It is used both for packet sequence numbers and
///  for reliable order ids.
///
/// Comparisons are based on the signed difference between two values, i.e. a value is 'newer'
///  than another if it is ahead by less than half the counter range. Raw integer comparison is
///  meaningless once the counter wrapped, so there is intentionally no `Ord` implementation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Sequence(u16);

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub const ZERO: Sequence = Sequence(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> Sequence {
        Sequence(self.0.wrapping_add(1))
    }

    pub fn plus(&self, n: u16) -> Sequence {
        Sequence(self.0.wrapping_add(n))
    }

    /// `self - other` with wraparound: positive if `self` is newer
    pub fn distance(&self, other: Sequence) -> i32 {
        distance(self.0, other.0)
    }

    pub fn is_newer_than(&self, other: Sequence) -> bool {
        is_newer(self.0, other.0)
    }
}

/// signed wraparound difference `a - b`
pub fn distance(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

pub fn is_newer(a: u16, b: u16) -> bool {
    distance(a, b) > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::simple(1, 0, true)]
    #[case::equal(5, 5, false)]
    #[case::older(4, 5, false)]
    #[case::wrap(0, 65535, true)]
    #[case::wrap_reverse(65535, 0, false)]
    #[case::wrap_far(100, 65000, true)]
    #[case::almost_half(32767, 0, true)]
    #[case::half(32768, 0, false)]
    #[case::half_reverse(0, 32768, false)]
    fn test_is_newer(#[case] a: u16, #[case] b: u16, #[case] expected: bool) {
        assert_eq!(is_newer(a, b), expected);
        assert_eq!(Sequence::from_raw(a).is_newer_than(Sequence::from_raw(b)), expected);
    }

    #[rstest]
    #[case(5, 3, 2)]
    #[case(3, 5, -2)]
    #[case(0, 65535, 1)]
    #[case(65535, 0, -1)]
    #[case(10, 65530, 16)]
    fn test_distance(#[case] a: u16, #[case] b: u16, #[case] expected: i32) {
        assert_eq!(distance(a, b), expected);
    }

    #[test]
    fn test_is_newer_agrees_with_ordering_across_wrap() {
        for base in [0u16, 1000, 32768, 65000, 65535] {
            for offset in 1..1000u16 {
                let a = base.wrapping_add(offset);
                assert!(is_newer(a, base), "{} should be newer than {}", a, base);
                assert!(!is_newer(base, a));
                assert_eq!(distance(a, base), offset as i32);
            }
        }
    }

    #[test]
    fn test_next_wraps() {
        assert_eq!(Sequence::from_raw(65535).next(), Sequence::ZERO);
        assert_eq!(Sequence::from_raw(65530).plus(10), Sequence::from_raw(4));
    }
}
