pub mod beam;
pub mod decompress;
pub mod headers;
pub mod specindx;
pub mod squeeze;

pub use beam::set_beam;
pub use decompress::{decompress, DecompressReport};
pub use headers::show_headers;
pub use specindx::{run_pipeline, spectral_index, InputImage, SpecIndexOptions};
pub use squeeze::{squeeze_file, SqueezeOptions, SqueezeReport};
