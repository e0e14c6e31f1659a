use bytemuck::{Pod, Zeroable};

/// Struct representing a fixed-capacity, zero-padded byte string.
///
/// The string does not record its own length: the owner keeps it next to the
/// bytes, which allows any byte (including `\0`) to be part of the string.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PodStr<const MAX_SIZE: usize> {
    /// The bytes of the string.
    pub value: [u8; MAX_SIZE],
}

impl<const MAX_SIZE: usize> PodStr<MAX_SIZE> {
    /// Creates a string from a slice, returning `None` if the slice does not fit.
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_SIZE {
            return None;
        }

        let mut value = [0; MAX_SIZE];
        value[..slice.len()].copy_from_slice(slice);
        Some(Self { value })
    }

    /// Returns the first `len` bytes of the string.
    ///
    /// `len` is clamped to the capacity of the string.
    pub fn prefix(&self, len: usize) -> &[u8] {
        &self.value[..std::cmp::min(len, MAX_SIZE)]
    }
}

unsafe impl<const MAX_SIZE: usize> Pod for PodStr<MAX_SIZE> {}

unsafe impl<const MAX_SIZE: usize> Zeroable for PodStr<MAX_SIZE> {}

#[cfg(test)]
mod tests {
    use crate::pod::PodStr;

    #[test]
    fn test_from_slice() {
        let str = PodStr::<10>::from_slice(b"str").unwrap();
        assert_eq!(str.prefix(3), b"str");

        // A slice that is equal to the max size fits.
        let str = PodStr::<10>::from_slice(b"emptyempty").unwrap();
        assert_eq!(str.prefix(10), b"emptyempty");

        // A slice that is bigger than the max size does not.
        assert!(PodStr::<10>::from_slice(b"emptyemptyempty").is_none());
    }

    #[test]
    fn test_prefix_is_clamped() {
        let str = PodStr::<4>::from_slice(b"ab").unwrap();
        assert_eq!(str.prefix(64), b"ab\0\0");
    }
}
