pub mod handle;
pub mod result;

pub use handle::{ResultHandle, ResultStatus};
pub use result::RowStream;
