//! Page stores for the key file and the value file.
//!
//! Each store serializes raw I/O on its file behind one mutex. Bucket
//! level exclusion is the engine's job; the store mutex only keeps a
//! seek/write pair and its allocator update together.

mod file;
mod key;
mod value;

pub use key::KeyStore;
pub use value::ValueStore;
