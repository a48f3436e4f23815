pub mod naming;
pub mod store;

pub use store::{Frame, FrameStore, RawFrameFile};
