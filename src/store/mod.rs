pub mod memory;
pub mod postgrest;

pub use memory::MemoryRelay;
pub use postgrest::PostgrestRelay;
