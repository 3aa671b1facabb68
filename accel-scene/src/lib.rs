mod buffer;
mod builder;
mod device;
mod error;
mod geometry;
mod graveyard;
mod instance;
mod maths;
mod params;
mod policy;
pub mod recording;
mod registry;
mod scene_description;
mod slot_pool;

pub mod prelude {
    pub use crate::builder::*;
    pub use crate::device::*;
    pub use crate::error::*;
    pub use crate::geometry::*;
    pub use crate::graveyard::*;
    pub use crate::instance::*;
    pub use crate::maths::*;
    pub use crate::params::*;
    pub use crate::policy::*;
    pub use crate::registry::*;
    pub use crate::scene_description::*;
    pub use crate::slot_pool::*;
}
