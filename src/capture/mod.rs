pub mod screen;
pub mod worker;

pub use screen::{MacScreenSource, ScreenSource};
pub use worker::CaptureLoop;
