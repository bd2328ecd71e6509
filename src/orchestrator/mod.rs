mod builder;
mod core;
mod lifecycle;
mod listener;
mod orphans;

pub use builder::NodeBuilder;
pub use self::core::Node;
pub use lifecycle::{CreateOptions, ListQuery, ServiceUpdate};
pub use orphans::BootReport;
