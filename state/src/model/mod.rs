mod batch;
mod item;

pub use batch::BatchEntry;
pub(crate) use batch::BatchRow;
pub(crate) use item::ItemRow;
