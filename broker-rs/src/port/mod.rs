/**
 * port module
 * Session port pool for spawned debug sessions
 */

pub mod allocator;

pub use allocator::{PortAllocator, PortRange, PortState, ANY_PORT};
