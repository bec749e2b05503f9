mod clock_replacer;
pub mod point_cache;

pub use self::point_cache::PointCache;
