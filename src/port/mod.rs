//! Host port allocation for services.

mod allocator;

pub use allocator::{is_port_available, PortAllocator};
