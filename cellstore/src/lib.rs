pub use cellstore_layout::*;
#[cfg(feature = "files")]
pub use cellstore_file as file;
pub use {cellstore_buffer as buffer, cellstore_error as error, cellstore_io as io};
