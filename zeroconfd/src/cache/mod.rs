pub mod hash;
pub mod table;

pub use table::EntryTable;
