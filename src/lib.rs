pub mod beam;
pub mod cli;
pub mod commands;
pub mod fits;
pub mod logging;
pub mod miriad;
pub mod spectral;
pub mod utils;
pub mod wcs;

// Re-export commonly used items
pub use fits::{Card, Header, Pixels};
pub use miriad::{MiriadRunner, Toolkit};
