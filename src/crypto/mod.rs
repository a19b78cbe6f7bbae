pub mod b64;
pub mod canonical;
pub mod content_sig;
pub mod keys;
pub mod oaep;
pub mod pss;

pub use canonical::canonical;
