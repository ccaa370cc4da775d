pub mod pool;
pub mod vec2;
