//! Capture file handles
//!
//! [`CaptureFile`] reads (and decrypts) records, [`ScrubFile`] rewrites them in
//! place. Both are shared through a [`FileRegistry`], which keeps a handle open
//! while it is leased and for a short grace period after.

mod handle;
mod registry;
mod scrub;

pub use handle::*;
pub use registry::*;
pub use scrub::*;
