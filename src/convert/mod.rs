pub mod pixels;
pub mod rotation;

pub use pixels::{i420_len, SourceFrame};
pub use rotation::{rotate_amount, I420Frame, Rotation, RotationConverter};
