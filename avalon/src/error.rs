use ash::vk;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the resource layer.
///
/// Only runtime conditions end up here. Invariant violations (releasing a
/// store that is still mapped, destroying an image with staged updates) are
/// caller bugs and assert instead of returning an error.
#[derive(Debug, Error)]
pub enum Error {
    /// A native API call failed.
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
    /// Device memory allocation or mapping failed.
    #[error("device memory operation failed: {0:?}")]
    Memory(vk_mem::Error),
    /// A size, pitch or offset computation overflowed.
    #[error("arithmetic overflow in a size or offset computation")]
    ArithmeticOverflow,
    /// A growable pool reached its maximum pool count.
    #[error("too many pools allocated")]
    TooManyPools,
}

impl From<vk_mem::Error> for Error {
    fn from(err: vk_mem::Error) -> Self {
        Error::Memory(err)
    }
}
