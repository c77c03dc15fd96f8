mod download;
mod order;
mod transaction;

pub use download::*;
pub use order::*;
pub use transaction::*;
