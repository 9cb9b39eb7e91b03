mod resolver;
mod table;

pub use resolver::FunctionAddressResolver;
pub use table::{OffsetTable, ResolvedAddresses};
