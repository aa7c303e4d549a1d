pub mod id;
pub mod sortable;

pub use sortable::SortableIdGenerator;
