#[cfg(not(target_pointer_width = "64"))]
compile_error!("pageward supports only 64-bit targets.");

#[cfg(all(not(unix), not(any(loom, miri))))]
compile_error!("pageward needs mmap/mprotect; only unix targets are supported.");

pub(crate) mod sync;

pub mod config;
pub mod memory;

// external surface
pub use memory::domain::{ArenaHandle, Domain, RegionHandle};

// building blocks
pub use memory::epoch::{Epoch, LargeBlock};
pub use memory::guard::Handle;
pub use memory::page_arena::PageArena;
pub use memory::queue::{EpochQueue, WINDOW_SIZE};
pub use memory::region::Region;
pub use memory::window::GenerationalBuffer;

// config/stats/errors
pub use config::{ArenaFlags, ArenaOptions, EpochPolicy, ReleasePolicy};
pub use memory::stats::{MemoryStats, memory_stats};
pub use memory::vm::{Protection, VmError};
