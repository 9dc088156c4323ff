mod types;
mod ws;

pub use types::*;
pub use ws::*;
