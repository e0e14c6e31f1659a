mod pod_str;

pub use pod_str::*;
