mod id;
mod records;

pub use id::*;
pub use records::*;
