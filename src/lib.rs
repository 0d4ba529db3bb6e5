pub mod depth_map;
pub mod logger;
