pub mod controller_type;
pub mod error;
pub mod mount;
pub mod path;
pub mod record;

pub use controller_type::ControllerType;
pub use error::PathError;
pub use mount::{CgroupMount, MountTable};
pub use path::{PathConfig, PathStrategy};
pub use record::CgroupRecord;
