mod allocator;
mod context;
mod device;

pub mod prelude {
    pub use crate::context::*;
    pub use crate::device::*;
}
