pub mod hash;
pub(crate) mod task;
