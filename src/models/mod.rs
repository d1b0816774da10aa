pub mod events;
pub mod flow;

pub use events::*;
pub use flow::*;
