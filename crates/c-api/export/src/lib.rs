pub use exifbox_c_api::*;
