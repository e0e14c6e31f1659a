pub mod pool;
pub mod tree_map;

pub use pool::estimate_required_bytes;
pub use pool::GrowReport;
pub use pool::PoolLayout;
pub use pool::MAX_KEY_LEN;
pub use tree_map::Keys;
pub use tree_map::TreeMap;
