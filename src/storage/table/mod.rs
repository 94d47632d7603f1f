mod table_heap;
mod tuple;

pub use table_heap::{TableHeap, TableIterator};
pub use tuple::Tuple;
