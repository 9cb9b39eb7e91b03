pub mod image;
mod sparse;
mod stack;
mod view;

#[cfg(test)]
pub mod mock;

pub use image::{ImageRegion, MemoryImage, load_image, save_image};
pub use sparse::SparseMemory;
pub use stack::{MAX_STACK_DEPTH, StackFrame, StackSnapshot};
pub use view::MemoryView;

#[cfg(test)]
pub use mock::MockMemoryBuilder;
