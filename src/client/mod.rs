pub mod neon;
pub mod retry;
pub mod traits;

pub use neon::*;
pub use retry::*;
pub use traits::*;
