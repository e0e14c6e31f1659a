use bytemuck::Pod;

pub mod collections;
pub mod error;
pub mod pod;

#[cfg(test)]
mod proptests;

pub use collections::{estimate_required_bytes, GrowReport, Keys, PoolLayout, TreeMap, MAX_KEY_LEN};
pub use error::{Error, Result};

/// Trait to represent types that are copied in and out of a byte block.
///
/// Reads and writes are unaligned, so a record can sit at any offset of a
/// block regardless of the block's base address.
pub trait ZeroCopy
where
    Self: Pod,
{
    fn load(data: &[u8]) -> Self {
        bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<Self>()])
    }

    fn store(&self, data: &mut [u8]) {
        data[..std::mem::size_of::<Self>()].copy_from_slice(bytemuck::bytes_of(self))
    }
}
