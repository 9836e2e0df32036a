pub mod matrix;
pub mod solar;
pub mod stats;
pub mod vector;

pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
pub use vector::Vec2;
