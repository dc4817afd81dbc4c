mod health;
pub mod proposals;
pub mod sse;

pub use health::*;
pub use proposals::*;
