//! Wire codec: block-cipher encryption and DEFLATE decompression
//!
//! The receive pipeline is strict: decrypt first (when a cipher is
//! installed), then detect and inflate compression, then split the tag.
//! Both stages are needed before the tag is readable, which is why they
//! live below the multiplexer rather than with response parsing.

mod compress;
mod crypto;

pub(crate) use compress::{decompress, is_compressed, COMPRESSED_PREFIX_LEN};
pub(crate) use crypto::{decrypt, derive_key, encrypt};
