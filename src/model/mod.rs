pub mod branch;
pub mod fingerprint;
pub mod record;

pub use branch::*;
pub use fingerprint::*;
pub use record::*;
