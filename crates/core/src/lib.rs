pub mod rect;
pub mod selection;
pub mod sink;

pub use rect::GridRect;
pub use selection::Selection;
pub use sink::CommandSink;
