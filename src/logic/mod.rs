pub mod coordination;
pub mod inspect;
pub mod migration;
pub mod naming;
pub mod session;

pub use coordination::*;
pub use inspect::*;
pub use migration::*;
pub use naming::*;
pub use session::*;
