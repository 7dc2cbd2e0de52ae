pub mod display;
pub mod store;

pub use display::*;
pub use store::*;
