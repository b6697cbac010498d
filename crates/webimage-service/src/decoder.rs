use bytes::Bytes;

use crate::caching::CacheContents;
use crate::types::DecodeOptions;

/// Turns the bytes stored in the disk tier into the payload handed to listeners.
///
/// Decoding happens on the disk stage, every time an entry is read from disk. Errors are
/// delivered as [`LoadError::DecodeFailed`](crate::caching::LoadError::DecodeFailed).
pub trait Decoder: Send + Sync + 'static {
    /// The decoded payload, shared between listeners and the memory tier.
    type Item: Send + Sync + 'static;

    fn decode(&self, data: Bytes, options: &DecodeOptions) -> CacheContents<Self::Item>;

    /// Returns the weight of an item, which is used as the memory tier's cost.
    fn weight(item: &Self::Item) -> u32;
}

/// A [`Decoder`] that hands out the raw bytes, ignoring the size hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    type Item = Bytes;

    fn decode(&self, data: Bytes, _options: &DecodeOptions) -> CacheContents<Bytes> {
        Ok(data)
    }

    fn weight(item: &Bytes) -> u32 {
        item.len().try_into().unwrap_or(u32::MAX)
    }
}
